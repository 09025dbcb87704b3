//! SQLite adapters for the operational store.

pub mod audit;
pub mod connection;
pub mod event_repo;
pub mod migrations;
pub mod spawn_requests;

pub use audit::AuditLog;
pub use connection::{create_pool, create_test_pool, PoolConfig};
pub use event_repo::CellEventRepo;
pub use migrations::Migrator;
pub use spawn_requests::SpawnRequestRepo;
