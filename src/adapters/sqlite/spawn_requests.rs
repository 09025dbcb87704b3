//! Persistence for the spawn approval queue.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::models::{SpawnInput, SpawnRequest, SpawnRequestStatus};

#[derive(Clone)]
pub struct SpawnRequestRepo {
    pool: SqlitePool,
}

impl SpawnRequestRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, request: &SpawnRequest) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO spawn_requests (id, parent_cell_id, namespace, spec, status, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(request.id.to_string())
        .bind(&request.parent_cell_id)
        .bind(&request.namespace)
        .bind(serde_json::to_string(&request.input).unwrap_or_default())
        .bind(request.status.as_str())
        .bind(&request.reason)
        .bind(request.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SpawnRequest>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, parent_cell_id, namespace, spec, status, reason, decided_by, created_at, decided_at
             FROM spawn_requests WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_request))
    }

    pub async fn list(&self, status: Option<SpawnRequestStatus>) -> Result<Vec<SpawnRequest>, sqlx::Error> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT id, parent_cell_id, namespace, spec, status, reason, decided_by, created_at, decided_at
                     FROM spawn_requests WHERE status = ? ORDER BY created_at",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, parent_cell_id, namespace, spec, status, reason, decided_by, created_at, decided_at
                     FROM spawn_requests ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(Self::row_to_request).collect())
    }

    /// Record the human decision for a pending request. Returns false if the
    /// request was not pending (already decided or unknown).
    pub async fn decide(
        &self,
        id: Uuid,
        status: SpawnRequestStatus,
        decided_by: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE spawn_requests
             SET status = ?, decided_by = ?, decided_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(decided_by)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> SpawnRequest {
        let id: String = row.get("id");
        let spec: String = row.get("spec");
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");
        let decided_at: Option<String> = row.get("decided_at");

        SpawnRequest {
            id: Uuid::from_str(&id).unwrap_or_default(),
            parent_cell_id: row.get("parent_cell_id"),
            namespace: row.get("namespace"),
            input: serde_json::from_str(&spec).unwrap_or_else(|_| SpawnInput {
                parent_cell_id: String::new(),
                namespace: String::new(),
                cell_name: String::new(),
                spec: crate::domain::models::CellSpec::default(),
                blueprint_ref: None,
                budget: None,
            }),
            status: SpawnRequestStatus::from_str(&status).unwrap_or(SpawnRequestStatus::Pending),
            reason: row.get("reason"),
            decided_by: row.get("decided_by"),
            created_at: parse_ts(&created_at),
            decided_at: decided_at.as_deref().map(parse_ts),
        }
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
