//! Cell ancestry node with materialized path.

use serde::{Deserialize, Serialize};

/// One node in the cell forest.
///
/// Invariants maintained by the tree store:
/// - a root has `parent_id = None`, `depth = 0`, `path = cell_id`
/// - `depth(child) = depth(parent) + 1`
/// - `path(child) = path(parent) + "/" + cell_id`
/// - `descendant_count` is the exact transitive descendant count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellNode {
    pub cell_id: String,
    pub parent_id: Option<String>,
    pub root_id: String,
    pub depth: u32,
    pub path: String,
    pub descendant_count: u32,
    pub namespace: String,
}

impl CellNode {
    /// Derive the depth implied by the materialized path.
    pub fn path_depth(&self) -> u32 {
        u32::try_from(self.path.split('/').count()).unwrap_or(u32::MAX).saturating_sub(1)
    }
}
