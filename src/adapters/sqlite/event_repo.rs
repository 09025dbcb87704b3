//! Persistence for cell event records.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::domain::models::CellEvent;

/// One persisted event row.
#[derive(Debug, Clone)]
pub struct StoredCellEvent {
    pub id: i64,
    pub cell_name: String,
    pub namespace: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CellEventRepo {
    pool: SqlitePool,
}

impl CellEventRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &CellEvent) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO cell_events (cell_name, namespace, event_type, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.cell_name)
        .bind(&event.namespace)
        .bind(event.event_type.to_string())
        .bind(event.payload.to_string())
        .bind(event.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert a batch inside one transaction. Used by the event consumer's
    /// buffered flush.
    pub async fn insert_batch(&self, events: &[CellEvent]) -> Result<usize, sqlx::Error> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO cell_events (cell_name, namespace, event_type, payload, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&event.cell_name)
            .bind(&event.namespace)
            .bind(event.event_type.to_string())
            .bind(event.payload.to_string())
            .bind(event.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(events.len())
    }

    /// Most recent events for one cell, newest first.
    pub async fn list_for_cell(
        &self,
        namespace: &str,
        cell_name: &str,
        limit: i64,
    ) -> Result<Vec<StoredCellEvent>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, cell_name, namespace, event_type, payload, created_at
             FROM cell_events
             WHERE namespace = ? AND cell_name = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(namespace)
        .bind(cell_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_event).collect())
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> StoredCellEvent {
        let payload: String = row.get("payload");
        let created_at: String = row.get("created_at");
        StoredCellEvent {
            id: row.get("id"),
            cell_name: row.get("cell_name"),
            namespace: row.get("namespace"),
            event_type: row.get("event_type"),
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc)),
        }
    }
}
