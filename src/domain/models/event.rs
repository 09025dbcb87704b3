//! Structured event records published to the per-cell events subject.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Significant cell runtime transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellEventType {
    Started,
    Stopped,
    Response,
    Error,
    BudgetExceeded,
    MaxIterations,
    Paused,
}

impl std::fmt::Display for CellEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
            Self::Response => write!(f, "response"),
            Self::Error => write!(f, "error"),
            Self::BudgetExceeded => write!(f, "budget_exceeded"),
            Self::MaxIterations => write!(f, "max_iterations"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// One record on the events stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellEvent {
    #[serde(rename = "type")]
    pub event_type: CellEventType,
    pub cell_name: String,
    pub namespace: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl CellEvent {
    pub fn new(
        event_type: CellEventType,
        cell_name: impl Into<String>,
        namespace: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            cell_name: cell_name.into(),
            namespace: namespace.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
