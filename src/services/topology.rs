//! Topology routing table generation.
//!
//! The formation controller renders `spec.topology` into a per-cell routing
//! table and publishes it as a retained config artifact; cells read it at
//! startup and enforce it at send time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::models::{FormationSpec, TopologyKind};

/// Routes for one source cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RouteEntry {
    pub destinations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

/// The published artifact: source cell name → allowed destinations.
pub type RoutingTable = BTreeMap<String, RouteEntry>;

/// Retained subject carrying a formation's routing table.
pub fn topology_subject(namespace: &str, formation: &str) -> String {
    format!("config.topology.{namespace}.{formation}")
}

/// Instance names for one template: `{templateName}-{i}`.
fn instances(name: &str, replicas: u32) -> Vec<String> {
    (0..replicas).map(|i| format!("{name}-{i}")).collect()
}

/// Render the routing table for a formation spec.
pub fn generate(spec: &FormationSpec) -> RoutingTable {
    let protocol = spec.topology.protocol.clone();
    let per_template: Vec<(String, Vec<String>)> = spec
        .cells
        .iter()
        .map(|t| (t.name.clone(), instances(&t.name, t.replicas)))
        .collect();
    let all: Vec<String> = per_template.iter().flat_map(|(_, cells)| cells.clone()).collect();

    let mut table = RoutingTable::new();
    let entry = |destinations: Vec<String>| RouteEntry { destinations, protocol: protocol.clone() };

    match spec.topology.kind {
        TopologyKind::FullMesh => {
            for cell in &all {
                let destinations = all.iter().filter(|c| *c != cell).cloned().collect();
                table.insert(cell.clone(), entry(destinations));
            }
        }

        // Levels follow template order: each level talks to the next level
        // down and back up.
        TopologyKind::Hierarchy => {
            for (level, (_, cells)) in per_template.iter().enumerate() {
                let mut destinations = Vec::new();
                if level > 0 {
                    destinations.extend(per_template[level - 1].1.clone());
                }
                if level + 1 < per_template.len() {
                    destinations.extend(per_template[level + 1].1.clone());
                }
                for cell in cells {
                    table.insert(cell.clone(), entry(destinations.clone()));
                }
            }
        }

        TopologyKind::Star => {
            let hub_template = spec
                .topology
                .center
                .clone()
                .or_else(|| per_template.first().map(|(name, _)| name.clone()))
                .unwrap_or_default();
            let hubs: Vec<String> = per_template
                .iter()
                .find(|(name, _)| *name == hub_template)
                .map(|(_, cells)| cells.clone())
                .unwrap_or_default();

            for cell in &all {
                if hubs.contains(cell) {
                    let destinations = all.iter().filter(|c| !hubs.contains(*c)).cloned().collect();
                    table.insert(cell.clone(), entry(destinations));
                } else {
                    table.insert(cell.clone(), entry(hubs.clone()));
                }
            }
        }

        TopologyKind::Ring => {
            let n = all.len();
            for (i, cell) in all.iter().enumerate() {
                let destinations = if n > 1 { vec![all[(i + 1) % n].clone()] } else { Vec::new() };
                table.insert(cell.clone(), entry(destinations));
            }
        }

        // Route declarations name templates; expand both sides to instances.
        TopologyKind::Custom => {
            for cell in &all {
                table.insert(cell.clone(), entry(Vec::new()));
            }
            for route in &spec.topology.routes {
                let sources = per_template
                    .iter()
                    .find(|(name, _)| *name == route.from)
                    .map(|(_, cells)| cells.clone())
                    .unwrap_or_default();
                let targets = per_template
                    .iter()
                    .find(|(name, _)| *name == route.to)
                    .map(|(_, cells)| cells.clone())
                    .unwrap_or_default();
                for source in sources {
                    if let Some(existing) = table.get_mut(&source) {
                        existing.destinations.extend(targets.clone());
                    }
                }
            }
        }

        // No direct routes; coordination happens through shared artifacts.
        TopologyKind::Stigmergy => {
            for cell in &all {
                table.insert(cell.clone(), entry(Vec::new()));
            }
        }
    }

    table
}
