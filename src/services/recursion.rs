//! Recursion validator - the spawn gate.
//!
//! Combines the platform cap, the parent's spawn policy, depth and
//! descendant limits, and the budget check into one decision. Rules are
//! evaluated in order; the first failing rule wins and its reason is
//! returned verbatim to the caller.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::adapters::sqlite::SpawnRequestRepo;
use crate::domain::errors::{LedgerError, TreeError};
use crate::domain::models::{RecursionSpec, SpawnDecision, SpawnInput, SpawnPolicy, SpawnRequest, SpawnRequestStatus};
use crate::services::cell_tree::CellTreeStore;
use crate::services::ledger::BudgetLedger;

/// Absolute ceiling on cells in the realm, regardless of per-cell limits.
pub const DEFAULT_PLATFORM_MAX_CELLS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("spawn request store failed: {0}")]
    Requests(#[from] sqlx::Error),
}

pub struct RecursionValidator {
    tree: CellTreeStore,
    ledger: BudgetLedger,
    requests: SpawnRequestRepo,
    platform_max_cells: u64,
}

impl RecursionValidator {
    pub fn new(tree: CellTreeStore, ledger: BudgetLedger, requests: SpawnRequestRepo) -> Self {
        Self {
            tree,
            ledger,
            requests,
            platform_max_cells: DEFAULT_PLATFORM_MAX_CELLS,
        }
    }

    #[must_use]
    pub fn with_platform_cap(mut self, max_cells: u64) -> Self {
        self.platform_max_cells = max_cells;
        self
    }

    /// Decide whether `input` may spawn under the parent's `recursion` spec.
    pub async fn validate(
        &self,
        recursion: &RecursionSpec,
        input: &SpawnInput,
    ) -> Result<SpawnDecision, ValidationError> {
        // 1. Platform cap.
        if self.tree.count_all().await? >= self.platform_max_cells {
            return Ok(SpawnDecision::Denied {
                reason: format!("Platform limit: {} cells reached", self.platform_max_cells),
            });
        }

        // 2. Policy.
        match recursion.spawn_policy {
            SpawnPolicy::Disabled => {
                return Ok(SpawnDecision::Denied { reason: "Spawning disabled".to_string() });
            }
            SpawnPolicy::BlueprintOnly if input.blueprint_ref.is_none() => {
                return Ok(SpawnDecision::Denied { reason: "Blueprint required".to_string() });
            }
            SpawnPolicy::ApprovalRequired => {
                let request = SpawnRequest {
                    id: Uuid::new_v4(),
                    parent_cell_id: input.parent_cell_id.clone(),
                    namespace: input.namespace.clone(),
                    input: input.clone(),
                    status: SpawnRequestStatus::Pending,
                    reason: Some("approval required".to_string()),
                    decided_by: None,
                    created_at: Utc::now(),
                    decided_at: None,
                };
                self.requests.create(&request).await?;
                return Ok(SpawnDecision::PendingApproval {
                    reason: "approval required".to_string(),
                    request_id: request.id,
                });
            }
            SpawnPolicy::BlueprintOnly | SpawnPolicy::Open => {}
        }

        // 3 & 4. Depth and descendants. An unregistered parent is a fresh
        // root: depth 0, no descendants.
        let (depth, descendants) = match self.tree.get(&input.parent_cell_id).await? {
            Some(node) => (node.depth, node.descendant_count),
            None => (0, 0),
        };

        if depth >= recursion.max_depth {
            return Ok(SpawnDecision::Denied {
                reason: format!("max depth reached ({depth}/{})", recursion.max_depth),
            });
        }

        if descendants >= recursion.max_descendants {
            return Ok(SpawnDecision::Denied {
                reason: format!("max descendants reached ({descendants}/{})", recursion.max_descendants),
            });
        }

        // 5. Budget, only when the spawn asks for a delegation.
        if let Some(budget) = input.budget {
            let available = self.ledger.available(&input.parent_cell_id).await?;
            if available < budget {
                return Ok(SpawnDecision::Denied {
                    reason: format!("insufficient budget ({available:.4} available, {budget:.4} requested)"),
                });
            }
        }

        Ok(SpawnDecision::Allowed)
    }
}
