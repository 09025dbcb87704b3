//! Budget accounting types: balance projection and journal entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-cell balance row.
///
/// `available` is derived, never stored: `allocated − spent − delegated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetBalance {
    pub cell_id: String,
    pub allocated: f64,
    pub spent: f64,
    pub delegated: f64,
}

impl BudgetBalance {
    pub fn available(&self) -> f64 {
        self.allocated - self.spent - self.delegated
    }
}

/// Journal operation discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOp {
    Init,
    Allocate,
    Spend,
    Reclaim,
    TopUp,
}

impl JournalOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Allocate => "allocate",
            Self::Spend => "spend",
            Self::Reclaim => "reclaim",
            Self::TopUp => "top_up",
        }
    }
}

impl std::str::FromStr for JournalOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "allocate" => Ok(Self::Allocate),
            "spend" => Ok(Self::Spend),
            "reclaim" => Ok(Self::Reclaim),
            "top_up" => Ok(Self::TopUp),
            other => Err(format!("unknown journal operation '{other}'")),
        }
    }
}

impl std::fmt::Display for JournalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One append-only journal row. The journal is the source of truth; the
/// balance table is a cached projection of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: i64,
    pub cell_id: String,
    pub operation: JournalOp,
    pub amount: f64,
    pub from_cell_id: Option<String>,
    pub to_cell_id: Option<String>,
    pub balance_after: f64,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
