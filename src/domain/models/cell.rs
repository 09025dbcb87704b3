//! The Cell resource: one unit of agent execution.

use serde::{Deserialize, Serialize};

use super::resource::{impl_resource, ObjectMeta};

/// Gate applied when this cell tries to create a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPolicy {
    /// Any spawn passing depth/descendant/budget checks is allowed.
    Open,
    /// No spawning at all.
    Disabled,
    /// Spawns must reference a blueprint.
    BlueprintOnly,
    /// Spawns queue a pending request for a human decision.
    ApprovalRequired,
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        Self::Open
    }
}

fn default_max_depth() -> u32 {
    5
}

fn default_max_descendants() -> u32 {
    50
}

/// Limits applied by the recursion validator before a spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecursionSpec {
    pub max_depth: u32,
    pub max_descendants: u32,
    pub spawn_policy: SpawnPolicy,
}

impl Default for RecursionSpec {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_descendants: default_max_descendants(),
            spawn_policy: SpawnPolicy::default(),
        }
    }
}

/// Which provider/model backs this cell's Mind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MindSelector {
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

impl Default for MindSelector {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            temperature: None,
            max_tokens: 4096,
        }
    }
}

/// Spending limits enforced by the runtime's budget tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellBudget {
    /// Lifetime ceiling; the runtime pauses when total cost reaches it.
    pub max_total_cost: f64,
    /// Rolling one-hour ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost_per_hour: Option<f64>,
}

fn default_max_messages() -> usize {
    50
}

/// Working-memory sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySpec {
    pub max_messages: usize,
    /// Summarize once total messages reach this count. Disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarize_after: Option<usize>,
}

impl Default for MemorySpec {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            summarize_after: None,
        }
    }
}

/// Desired state of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CellSpec {
    pub system_prompt: String,
    pub mind: MindSelector,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<CellBudget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursion: Option<RecursionSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySpec>,
    /// Set by the formation controller on cells it materializes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formation_ref: Option<String>,
}

/// Observed lifecycle phase of a cell worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CellPhase {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for CellPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CellStatus {
    pub phase: CellPhase,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The Cell resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    #[serde(default = "super::resource::api_version_default")]
    pub api_version: String,
    #[serde(default = "Cell::kind_default")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CellSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CellStatus>,
}

impl Cell {
    fn kind_default() -> String {
        "Cell".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: CellSpec) -> Self {
        Self {
            api_version: super::resource::API_VERSION.to_string(),
            kind: Self::kind_default(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn phase(&self) -> CellPhase {
        self.status.as_ref().map_or(CellPhase::Pending, |s| s.phase)
    }

    pub fn cost(&self) -> f64 {
        self.status.as_ref().map_or(0.0, |s| s.cost)
    }
}

impl_resource!(Cell, "Cell");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursion_defaults() {
        let spec: RecursionSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.max_depth, 5);
        assert_eq!(spec.max_descendants, 50);
        assert_eq!(spec.spawn_policy, SpawnPolicy::Open);
    }

    #[test]
    fn test_spawn_policy_wire_names() {
        let policy: SpawnPolicy = serde_json::from_str("\"blueprint_only\"").unwrap();
        assert_eq!(policy, SpawnPolicy::BlueprintOnly);
        let policy: SpawnPolicy = serde_json::from_str("\"approval_required\"").unwrap();
        assert_eq!(policy, SpawnPolicy::ApprovalRequired);
    }

    #[test]
    fn test_cell_manifest_roundtrip() {
        let yaml = r"
apiVersion: mitos.dev/v1
kind: Cell
metadata:
  name: scout
  namespace: prod
spec:
  systemPrompt: You are a scout.
  budget:
    maxTotalCost: 2.5
";
        let cell: Cell = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cell.metadata.name, "scout");
        assert_eq!(cell.spec.budget.unwrap().max_total_cost, 2.5);
        assert_eq!(cell.phase(), CellPhase::Pending);
    }
}
