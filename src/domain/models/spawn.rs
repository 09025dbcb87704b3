//! Spawn inputs, decisions, and the approval-queue record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cell::CellSpec;

/// What a parent cell is asking to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnInput {
    pub parent_cell_id: String,
    pub namespace: String,
    pub cell_name: String,
    pub spec: CellSpec,
    /// Required under the `blueprint_only` policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint_ref: Option<String>,
    /// Budget to delegate to the child, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
}

/// Outcome of the recursion validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpawnDecision {
    Allowed,
    Denied { reason: String },
    /// A SpawnRequest record was queued for human approval.
    PendingApproval { reason: String, request_id: Uuid },
}

impl SpawnDecision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Denied { reason } | Self::PendingApproval { reason, .. } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnRequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl SpawnRequestStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for SpawnRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown spawn request status '{other}'")),
        }
    }
}

/// Row in the approval queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub id: Uuid,
    pub parent_cell_id: String,
    pub namespace: String,
    pub input: SpawnInput,
    pub status: SpawnRequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}
