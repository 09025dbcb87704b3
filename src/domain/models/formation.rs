//! The Formation resource: a declarative group of cells with topology and a
//! shared budget.

use serde::{Deserialize, Serialize};

use super::cell::{CellPhase, CellSpec};
use super::resource::{impl_resource, ObjectMeta};

fn default_replicas() -> u32 {
    1
}

/// One cell template to materialize `replicas` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellTemplate {
    pub name: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub spec: CellSpec,
}

/// Connectivity pattern generated into the routing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    #[default]
    FullMesh,
    Hierarchy,
    Star,
    Ring,
    Custom,
    /// No direct routes; cells coordinate through shared artifacts.
    Stigmergy,
}

/// Explicit route for `custom` topologies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologySpec {
    #[serde(rename = "type")]
    pub kind: TopologyKind,
    /// Hub template for `star`, root template for `hierarchy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormationBudget {
    pub max_total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FormationSpec {
    pub cells: Vec<CellTemplate>,
    pub topology: TopologySpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<FormationBudget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,
}

impl FormationSpec {
    /// Total cells the spec asks for across all templates.
    pub fn desired_count(&self) -> u32 {
        self.cells.iter().map(|t| t.replicas).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FormationPhase {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl std::fmt::Display for FormationPhase {
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

/// Per-child summary row in the formation status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellSummary {
    pub name: String,
    pub phase: CellPhase,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FormationStatus {
    pub phase: FormationPhase,
    pub ready_cells: u32,
    pub total_cells: u32,
    pub total_cost: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<CellSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The Formation resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Formation {
    #[serde(default = "super::resource::api_version_default")]
    pub api_version: String,
    #[serde(default = "Formation::kind_default")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: FormationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FormationStatus>,
}

impl Formation {
    fn kind_default() -> String {
        "Formation".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: FormationSpec) -> Self {
        Self {
            api_version: super::resource::API_VERSION.to_string(),
            kind: Self::kind_default(),
            metadata,
            spec,
            status: None,
        }
    }
}

impl_resource!(Formation, "Formation");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_count_sums_templates() {
        let spec = FormationSpec {
            cells: vec![
                CellTemplate { name: "scout".to_string(), replicas: 2, spec: CellSpec::default() },
                CellTemplate { name: "worker".to_string(), replicas: 3, spec: CellSpec::default() },
            ],
            ..Default::default()
        };
        assert_eq!(spec.desired_count(), 5);
    }

    #[test]
    fn test_topology_kind_wire_names() {
        let kind: TopologyKind = serde_json::from_str("\"full_mesh\"").unwrap();
        assert_eq!(kind, TopologyKind::FullMesh);
        let kind: TopologyKind = serde_json::from_str("\"stigmergy\"").unwrap();
        assert_eq!(kind, TopologyKind::Stigmergy);
    }
}
