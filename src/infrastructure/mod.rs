//! Process-level infrastructure.

pub mod telemetry;

pub use telemetry::Telemetry;
