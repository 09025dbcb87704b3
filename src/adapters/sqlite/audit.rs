//! Append-only audit trail for privileged operations.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub subject: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        actor: &str,
        action: &str,
        subject: &str,
        detail: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, subject, detail, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(actor)
        .bind(action)
        .bind(subject)
        .bind(detail)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, actor, action, subject, detail, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                AuditEntry {
                    id: row.get("id"),
                    actor: row.get("actor"),
                    action: row.get("action"),
                    subject: row.get("subject"),
                    detail: row.get("detail"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::migrations::Migrator;

    #[tokio::test]
    async fn test_record_and_recent() {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run().await.unwrap();
        let audit = AuditLog::new(pool);

        audit.record("operator", "spawn.approve", "req-1", None).await.unwrap();
        audit.record("operator", "budget.init", "root", Some("100.0")).await.unwrap();

        let entries = audit.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "budget.init");
    }
}
