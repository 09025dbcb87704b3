//! Hierarchical budget ledger.
//!
//! Balances live in `budget_balances` as a cached projection; every mutation
//! appends to `budget_ledger`, which is the source of truth. Replaying the
//! journal reproduces the balance table exactly (see
//! [`replay_balances`](BudgetLedger::replay_balances)).
//!
//! Concurrency: the allocate and spend paths use conditional UPDATEs inside
//! a transaction, so two writers racing on the same row cannot drive
//! `available` negative; the loser's guard matches zero rows and the
//! operation fails with the budget error instead.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::domain::errors::LedgerError;
use crate::domain::models::{BudgetBalance, JournalEntry, JournalOp};

/// Journal conventions, per operation:
///
/// | op        | cell_id row  | effect on that row          |
/// |-----------|--------------|-----------------------------|
/// | init      | the root     | allocated = amount          |
/// | allocate  | parent side  | delegated += amount         |
/// | allocate  | child side   | allocated += amount         |
/// | top_up    | as allocate  | as allocate                 |
/// | spend     | the spender  | spent += amount             |
/// | reclaim   | child side   | allocated -= amount         |
/// | reclaim   | parent side  | delegated -= amount         |
///
/// Parent-side entries carry `from_cell_id = cell_id`; child-side entries
/// carry `to_cell_id = cell_id`. `balance_after` records the row's
/// `available` after the mutation.
#[derive(Clone)]
pub struct BudgetLedger {
    pool: SqlitePool,
}

impl BudgetLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Create (or reset) the root account of a cell tree.
    pub async fn init_root(&self, cell_id: &str, amount: f64) -> Result<(), LedgerError> {
        if amount < 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO budget_balances (cell_id, allocated, spent, delegated)
             VALUES (?, ?, 0, 0)
             ON CONFLICT(cell_id) DO UPDATE SET allocated = excluded.allocated, spent = 0, delegated = 0",
        )
        .bind(cell_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        Self::journal(&mut tx, cell_id, JournalOp::Init, amount, None, None, amount, None).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delegate `amount` from `parent_id` to `child_id`.
    pub async fn allocate(
        &self,
        parent_id: &str,
        child_id: &str,
        amount: f64,
    ) -> Result<(), LedgerError> {
        self.delegate(parent_id, child_id, amount, JournalOp::Allocate).await
    }

    /// Increase an existing child's allocation. Same balance arithmetic as
    /// [`allocate`](Self::allocate); the distinct journal operation records
    /// that this was a top-up rather than a first delegation.
    pub async fn top_up(
        &self,
        parent_id: &str,
        child_id: &str,
        amount: f64,
    ) -> Result<(), LedgerError> {
        self.delegate(parent_id, child_id, amount, JournalOp::TopUp).await
    }

    async fn delegate(
        &self,
        parent_id: &str,
        child_id: &str,
        amount: f64,
        op: JournalOp,
    ) -> Result<(), LedgerError> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        let Some(parent) = Self::balance_in_tx(&mut tx, parent_id).await? else {
            return Err(LedgerError::NoBudgetRecord(parent_id.to_string()));
        };

        // Guarded update: fails the race instead of going negative.
        let updated = sqlx::query(
            "UPDATE budget_balances
             SET delegated = delegated + ?
             WHERE cell_id = ? AND (allocated - spent - delegated) >= ?",
        )
        .bind(amount)
        .bind(parent_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(LedgerError::InsufficientBudget {
                cell_id: parent_id.to_string(),
                required: amount,
                available: parent.available(),
            });
        }

        sqlx::query(
            "INSERT INTO budget_balances (cell_id, allocated, spent, delegated)
             VALUES (?, ?, 0, 0)
             ON CONFLICT(cell_id) DO UPDATE SET allocated = allocated + excluded.allocated",
        )
        .bind(child_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        let parent_after = Self::available_in_tx(&mut tx, parent_id).await?;
        let child_after = Self::available_in_tx(&mut tx, child_id).await?;

        Self::journal(&mut tx, parent_id, op, amount, Some(parent_id), Some(child_id), parent_after, None)
            .await?;
        Self::journal(&mut tx, child_id, op, amount, Some(parent_id), Some(child_id), child_after, None)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Record spending against a cell's own allocation.
    pub async fn spend(&self, cell_id: &str, amount: f64) -> Result<(), LedgerError> {
        self.spend_with_reason(cell_id, amount, None).await
    }

    pub async fn spend_with_reason(
        &self,
        cell_id: &str,
        amount: f64,
        reason: Option<&str>,
    ) -> Result<(), LedgerError> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        let Some(balance) = Self::balance_in_tx(&mut tx, cell_id).await? else {
            return Err(LedgerError::NoBudgetRecord(cell_id.to_string()));
        };

        let updated = sqlx::query(
            "UPDATE budget_balances
             SET spent = spent + ?
             WHERE cell_id = ? AND (allocated - spent - delegated) >= ?",
        )
        .bind(amount)
        .bind(cell_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(LedgerError::BudgetExhausted {
                cell_id: cell_id.to_string(),
                required: amount,
                available: balance.available(),
            });
        }

        let after = Self::available_in_tx(&mut tx, cell_id).await?;
        Self::journal(&mut tx, cell_id, JournalOp::Spend, amount, None, None, after, reason).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Return a child's unused allocation to its parent. Returns the amount
    /// reclaimed; 0 when the child is missing or has nothing available.
    pub async fn reclaim(&self, child_id: &str, parent_id: &str) -> Result<f64, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let Some(child) = Self::balance_in_tx(&mut tx, child_id).await? else {
            return Ok(0.0);
        };
        let avail = child.available();
        if avail <= 0.0 {
            return Ok(0.0);
        }

        if Self::balance_in_tx(&mut tx, parent_id).await?.is_none() {
            return Err(LedgerError::NoBudgetRecord(parent_id.to_string()));
        }

        sqlx::query("UPDATE budget_balances SET allocated = allocated - ? WHERE cell_id = ?")
            .bind(avail)
            .bind(child_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE budget_balances SET delegated = delegated - ? WHERE cell_id = ?")
            .bind(avail)
            .bind(parent_id)
            .execute(&mut *tx)
            .await?;

        let child_after = Self::available_in_tx(&mut tx, child_id).await?;
        let parent_after = Self::available_in_tx(&mut tx, parent_id).await?;

        Self::journal(&mut tx, child_id, JournalOp::Reclaim, avail, Some(child_id), Some(parent_id), child_after, None)
            .await?;
        Self::journal(&mut tx, parent_id, JournalOp::Reclaim, avail, Some(child_id), Some(parent_id), parent_after, None)
            .await?;

        tx.commit().await?;
        Ok(avail)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn get_balance(&self, cell_id: &str) -> Result<Option<BudgetBalance>, LedgerError> {
        let row = sqlx::query(
            "SELECT cell_id, allocated, spent, delegated FROM budget_balances WHERE cell_id = ?",
        )
        .bind(cell_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| BudgetBalance {
            cell_id: row.get("cell_id"),
            allocated: row.get("allocated"),
            spent: row.get("spent"),
            delegated: row.get("delegated"),
        }))
    }

    pub async fn available(&self, cell_id: &str) -> Result<f64, LedgerError> {
        Ok(self.get_balance(cell_id).await?.map_or(0.0, |b| b.available()))
    }

    /// Last `limit` journal entries for a cell, newest first.
    pub async fn get_history(&self, cell_id: &str, limit: i64) -> Result<Vec<JournalEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, cell_id, operation, amount, from_cell_id, to_cell_id, balance_after, reason, created_at
             FROM budget_ledger WHERE cell_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(cell_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Rebuild every balance by folding the full journal in order.
    ///
    /// Event-sourcing check: the result must equal the contents of
    /// `budget_balances`.
    pub async fn replay_balances(&self) -> Result<HashMap<String, BudgetBalance>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, cell_id, operation, amount, from_cell_id, to_cell_id, balance_after, reason, created_at
             FROM budget_ledger ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut balances: HashMap<String, BudgetBalance> = HashMap::new();

        for row in &rows {
            let entry = Self::row_to_entry(row)?;
            let balance = balances.entry(entry.cell_id.clone()).or_insert_with(|| BudgetBalance {
                cell_id: entry.cell_id.clone(),
                allocated: 0.0,
                spent: 0.0,
                delegated: 0.0,
            });

            let is_parent_side = entry.from_cell_id.as_deref() == Some(entry.cell_id.as_str());
            match entry.operation {
                JournalOp::Init => {
                    balance.allocated = entry.amount;
                    balance.spent = 0.0;
                    balance.delegated = 0.0;
                }
                JournalOp::Allocate | JournalOp::TopUp => {
                    if is_parent_side {
                        balance.delegated += entry.amount;
                    } else {
                        balance.allocated += entry.amount;
                    }
                }
                JournalOp::Spend => balance.spent += entry.amount,
                JournalOp::Reclaim => {
                    if is_parent_side {
                        balance.allocated -= entry.amount;
                    } else {
                        balance.delegated -= entry.amount;
                    }
                }
            }
        }

        Ok(balances)
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    async fn balance_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        cell_id: &str,
    ) -> Result<Option<BudgetBalance>, LedgerError> {
        let row = sqlx::query(
            "SELECT cell_id, allocated, spent, delegated FROM budget_balances WHERE cell_id = ?",
        )
        .bind(cell_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|row| BudgetBalance {
            cell_id: row.get("cell_id"),
            allocated: row.get("allocated"),
            spent: row.get("spent"),
            delegated: row.get("delegated"),
        }))
    }

    async fn available_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        cell_id: &str,
    ) -> Result<f64, LedgerError> {
        Ok(Self::balance_in_tx(tx, cell_id).await?.map_or(0.0, |b| b.available()))
    }

    #[allow(clippy::too_many_arguments)]
    async fn journal(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        cell_id: &str,
        op: JournalOp,
        amount: f64,
        from_cell_id: Option<&str>,
        to_cell_id: Option<&str>,
        balance_after: f64,
        reason: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO budget_ledger (cell_id, operation, amount, from_cell_id, to_cell_id, balance_after, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cell_id)
        .bind(op.as_str())
        .bind(amount)
        .bind(from_cell_id)
        .bind(to_cell_id)
        .bind(balance_after)
        .bind(reason)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<JournalEntry, LedgerError> {
        let operation: String = row.get("operation");
        let created_at: String = row.get("created_at");
        Ok(JournalEntry {
            id: row.get("id"),
            cell_id: row.get("cell_id"),
            operation: operation
                .parse()
                .map_err(|_| LedgerError::NoBudgetRecord(format!("corrupt journal op '{operation}'")))?,
            amount: row.get("amount"),
            from_cell_id: row.get("from_cell_id"),
            to_cell_id: row.get("to_cell_id"),
            balance_after: row.get("balance_after"),
            reason: row.get("reason"),
            created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                .map_or_else(|_| chrono::Utc::now(), |dt| dt.with_timezone(&chrono::Utc)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::migrations::Migrator;

    async fn ledger() -> BudgetLedger {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run().await.unwrap();
        BudgetLedger::new(pool)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[tokio::test]
    async fn test_three_level_allocation() {
        let ledger = ledger().await;
        ledger.init_root("root", 100.0).await.unwrap();
        ledger.allocate("root", "team", 40.0).await.unwrap();
        ledger.allocate("team", "dev", 15.0).await.unwrap();
        ledger.spend("dev", 8.0).await.unwrap();

        assert_close(ledger.available("root").await.unwrap(), 60.0);
        assert_close(ledger.available("team").await.unwrap(), 25.0);
        assert_close(ledger.available("dev").await.unwrap(), 7.0);
    }

    #[tokio::test]
    async fn test_reclaim_after_partial_spend() {
        let ledger = ledger().await;
        ledger.init_root("p", 100.0).await.unwrap();
        ledger.allocate("p", "c", 40.0).await.unwrap();
        ledger.spend("c", 15.0).await.unwrap();

        let reclaimed = ledger.reclaim("c", "p").await.unwrap();
        assert_close(reclaimed, 25.0);

        assert_close(ledger.available("p").await.unwrap(), 85.0);
        assert_close(ledger.available("c").await.unwrap(), 0.0);

        let child = ledger.get_balance("c").await.unwrap().unwrap();
        assert_close(child.allocated, 15.0);
    }

    #[tokio::test]
    async fn test_spend_boundary() {
        let ledger = ledger().await;
        ledger.init_root("cell", 10.0).await.unwrap();

        // Exactly the available amount succeeds.
        ledger.spend("cell", 10.0).await.unwrap();

        // Anything more fails with the exhaustion error.
        let err = ledger.spend("cell", 0.0001).await.unwrap_err();
        assert!(matches!(err, LedgerError::BudgetExhausted { .. }));
        assert!(err.to_string().starts_with("Budget exhausted"));
    }

    #[tokio::test]
    async fn test_allocate_requires_parent_record() {
        let ledger = ledger().await;
        let err = ledger.allocate("ghost", "child", 5.0).await.unwrap_err();
        assert!(matches!(err, LedgerError::NoBudgetRecord(_)));
    }

    #[tokio::test]
    async fn test_allocate_insufficient() {
        let ledger = ledger().await;
        ledger.init_root("root", 10.0).await.unwrap();
        let err = ledger.allocate("root", "child", 10.5).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBudget { .. }));
        assert!(err.to_string().starts_with("Insufficient budget"));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amounts() {
        let ledger = ledger().await;
        ledger.init_root("root", 10.0).await.unwrap();
        assert!(matches!(ledger.allocate("root", "c", 0.0).await, Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(ledger.spend("root", -1.0).await, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_top_up_matches_allocate_balances() {
        let ledger = ledger().await;
        ledger.init_root("root", 100.0).await.unwrap();
        ledger.allocate("root", "child", 10.0).await.unwrap();
        ledger.top_up("root", "child", 5.0).await.unwrap();

        assert_close(ledger.available("root").await.unwrap(), 85.0);
        assert_close(ledger.available("child").await.unwrap(), 15.0);

        // One journal entry per side, tagged top_up.
        let history = ledger.get_history("child", 10).await.unwrap();
        assert_eq!(history[0].operation, JournalOp::TopUp);
    }

    #[tokio::test]
    async fn test_reclaim_missing_child_returns_zero() {
        let ledger = ledger().await;
        ledger.init_root("p", 10.0).await.unwrap();
        assert_close(ledger.reclaim("nope", "p").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_parent_delegated_tracks_child_allocations() {
        let ledger = ledger().await;
        ledger.init_root("root", 100.0).await.unwrap();
        ledger.allocate("root", "a", 20.0).await.unwrap();
        ledger.allocate("root", "b", 30.0).await.unwrap();

        let root = ledger.get_balance("root").await.unwrap().unwrap();
        let a = ledger.get_balance("a").await.unwrap().unwrap();
        let b = ledger.get_balance("b").await.unwrap().unwrap();
        assert_close(root.delegated, a.allocated + b.allocated);
    }

    #[tokio::test]
    async fn test_journal_replay_reproduces_balances() {
        let ledger = ledger().await;
        ledger.init_root("root", 100.0).await.unwrap();
        ledger.allocate("root", "team", 40.0).await.unwrap();
        ledger.allocate("team", "dev", 15.0).await.unwrap();
        ledger.spend("dev", 8.0).await.unwrap();
        ledger.top_up("root", "team", 10.0).await.unwrap();
        ledger.reclaim("dev", "team").await.unwrap();

        let replayed = ledger.replay_balances().await.unwrap();
        for cell_id in ["root", "team", "dev"] {
            let live = ledger.get_balance(cell_id).await.unwrap().unwrap();
            let from_journal = replayed.get(cell_id).unwrap();
            assert_close(from_journal.allocated, live.allocated);
            assert_close(from_journal.spent, live.spent);
            assert_close(from_journal.delegated, live.delegated);
        }
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let ledger = ledger().await;
        ledger.init_root("root", 100.0).await.unwrap();
        ledger.spend("root", 1.0).await.unwrap();
        ledger.spend("root", 2.0).await.unwrap();

        let history = ledger.get_history("root", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_close(history[0].amount, 2.0);
        assert_eq!(history[0].operation, JournalOp::Spend);
    }
}
