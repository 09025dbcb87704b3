//! Shared helpers for integration tests.

use mitos::adapters::sqlite::{connection::create_test_pool, Migrator};
use sqlx::SqlitePool;

/// Fresh in-memory database with the full schema applied.
pub async fn test_pool() -> SqlitePool {
    let pool = create_test_pool().await.expect("create test pool");
    Migrator::new(pool.clone()).run().await.expect("run migrations");
    pool
}
