//! Formation controller.
//!
//! Materializes a formation spec into its cells, publishes the topology
//! routing table, enforces the shared budget, and aggregates child status.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::errors::ReconcileError;
use crate::domain::models::{
    Cell, CellPhase, CellSpec, CellStatus, CellSummary, Envelope, EnvelopeType, Formation,
    FormationPhase, FormationStatus, ObjectMeta, OwnerReference, Resource,
};
use crate::domain::ports::{Bus, ResourceStore};
use crate::services::reconciler::Reconcile;
use crate::services::topology;

/// Label linking materialized cells back to their formation.
pub const FORMATION_LABEL: &str = "formation";

pub struct FormationController {
    formations: Arc<dyn ResourceStore<Formation>>,
    cells: Arc<dyn ResourceStore<Cell>>,
    bus: Arc<dyn Bus>,
    /// Root under which per-formation shared workspaces are created.
    workspace_root: PathBuf,
}

impl FormationController {
    pub fn new(
        formations: Arc<dyn ResourceStore<Formation>>,
        cells: Arc<dyn ResourceStore<Cell>>,
        bus: Arc<dyn Bus>,
        workspace_root: PathBuf,
    ) -> Self {
        Self { formations, cells, bus, workspace_root }
    }

    fn desired_cells(formation: &Formation) -> Vec<(String, CellSpec)> {
        let mut desired = Vec::new();
        for template in &formation.spec.cells {
            for i in 0..template.replicas {
                let mut spec = template.spec.clone();
                spec.formation_ref = Some(formation.metadata.name.clone());
                desired.push((format!("{}-{i}", template.name), spec));
            }
        }
        desired
    }

    fn owned_meta(formation: &Formation, name: &str) -> ObjectMeta {
        ObjectMeta::named(name, &formation.metadata.namespace)
            .with_label(FORMATION_LABEL, &formation.metadata.name)
            .with_owner(OwnerReference {
                kind: "Formation".to_string(),
                name: formation.metadata.name.clone(),
                uid: formation.metadata.uid,
            })
    }

    async fn ensure_workspace(&self, formation: &Formation) -> Result<(), ReconcileError> {
        if formation.spec.workspace.is_none() {
            return Ok(());
        }
        let dir = self
            .workspace_root
            .join(&formation.metadata.namespace)
            .join(&formation.metadata.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }

    async fn publish_topology(&self, formation: &Formation) -> Result<(), ReconcileError> {
        let table = topology::generate(&formation.spec);
        let envelope = Envelope::new(
            format!("formation/{}", formation.metadata.name),
            "topology",
            EnvelopeType::Event,
            json!({ "routes": table }),
        );
        self.bus
            .publish_retained(
                &topology::topology_subject(&formation.metadata.namespace, &formation.metadata.name),
                &envelope,
            )
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }

    /// Steps 3-5: converge the live cell set onto the desired set.
    async fn converge_cells(
        &self,
        formation: &Formation,
        desired: &[(String, CellSpec)],
    ) -> Result<Vec<Cell>, ReconcileError> {
        let namespace = formation.metadata.namespace.as_str();

        let live = self
            .cells
            .list_labeled(Some(namespace), FORMATION_LABEL, &formation.metadata.name)
            .await
            .map_err(ReconcileError::transient)?;

        for (name, spec) in desired {
            let existing = live.iter().find(|c| c.metadata.name == *name);
            match existing {
                None => {
                    let cell = Cell::new(Self::owned_meta(formation, name), spec.clone());
                    self.cells.create(cell).await.map_err(ReconcileError::transient)?;
                    tracing::info!(formation = %formation.metadata.name, cell = %name, "cell created");
                }
                Some(existing) if existing.phase() == CellPhase::Failed => {
                    // Failed cells are replaced rather than patched.
                    self.cells
                        .delete(namespace, name)
                        .await
                        .map_err(ReconcileError::transient)?;
                    let cell = Cell::new(Self::owned_meta(formation, name), spec.clone());
                    self.cells.create(cell).await.map_err(ReconcileError::transient)?;
                    tracing::info!(formation = %formation.metadata.name, cell = %name, "failed cell recreated");
                }
                Some(existing) if existing.spec != *spec => {
                    let mut updated = existing.clone();
                    updated.spec = spec.clone();
                    self.cells.update(updated).await.map_err(ReconcileError::transient)?;
                    tracing::info!(formation = %formation.metadata.name, cell = %name, "cell spec updated");
                }
                Some(_) => {}
            }
        }

        // Scale-down: anything labeled for us but not desired goes away.
        for cell in &live {
            if !desired.iter().any(|(name, _)| *name == cell.metadata.name) {
                self.cells
                    .delete(namespace, &cell.metadata.name)
                    .await
                    .map_err(ReconcileError::transient)?;
                tracing::info!(formation = %formation.metadata.name, cell = %cell.metadata.name, "cell removed on scale-down");
            }
        }

        self.cells
            .list_labeled(Some(namespace), FORMATION_LABEL, &formation.metadata.name)
            .await
            .map_err(ReconcileError::transient)
    }

    /// Step 6: pause every cell once the formation budget is exhausted.
    async fn pause_all(&self, cells: &[Cell]) -> Result<(), ReconcileError> {
        for cell in cells {
            if cell.phase() == CellPhase::Paused {
                continue;
            }
            let mut updated = cell.clone();
            updated.status = Some(CellStatus {
                phase: CellPhase::Paused,
                cost: cell.cost(),
                message: Some("budget exceeded".to_string()),
            });
            self.cells.set_status(updated).await.map_err(ReconcileError::transient)?;
        }
        Ok(())
    }

    fn derive_phase(cells: &[Cell]) -> FormationPhase {
        if cells.is_empty() {
            return FormationPhase::Pending;
        }
        if cells.iter().all(|c| c.phase() == CellPhase::Completed) {
            return FormationPhase::Completed;
        }
        if cells.iter().any(|c| c.phase() == CellPhase::Failed) {
            return FormationPhase::Failed;
        }
        if cells.iter().any(|c| c.phase() == CellPhase::Running) {
            return FormationPhase::Running;
        }
        FormationPhase::Pending
    }
}

#[async_trait]
impl Reconcile<Formation> for FormationController {
    async fn reconcile(&self, formation: Formation) -> Result<(), ReconcileError> {
        self.ensure_workspace(&formation).await?;
        self.publish_topology(&formation).await?;

        let desired = Self::desired_cells(&formation);
        let live = self.converge_cells(&formation, &desired).await?;

        let total_cost: f64 = live.iter().map(Cell::cost).sum();
        let total_cells = u32::try_from(live.len()).unwrap_or(u32::MAX);
        let ready_cells =
            u32::try_from(live.iter().filter(|c| c.phase() == CellPhase::Running).count())
                .unwrap_or(u32::MAX);
        let summaries: Vec<CellSummary> = live
            .iter()
            .map(|c| CellSummary { name: c.metadata.name.clone(), phase: c.phase(), cost: c.cost() })
            .collect();

        let over_budget = formation
            .spec
            .budget
            .as_ref()
            .is_some_and(|b| total_cost >= b.max_total_cost);

        let status = if over_budget {
            tracing::warn!(formation = %formation.metadata.name, total_cost, "formation budget exhausted");
            self.pause_all(&live).await?;
            FormationStatus {
                phase: FormationPhase::Paused,
                ready_cells,
                total_cells,
                total_cost,
                cells: summaries,
                message: Some("budget exceeded".to_string()),
            }
        } else {
            FormationStatus {
                phase: Self::derive_phase(&live),
                ready_cells,
                total_cells,
                total_cost,
                cells: summaries,
                message: None,
            }
        };

        let mut updated = formation.clone();
        updated.status = Some(status);
        self.formations
            .set_status(updated)
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }

    /// Owner-reference cascade: deleting the formation deletes its cells.
    async fn cleanup(&self, formation: Formation) {
        let Ok(live) = self
            .cells
            .list_labeled(
                Some(&formation.metadata.namespace),
                FORMATION_LABEL,
                &formation.metadata.name,
            )
            .await
        else {
            return;
        };
        for cell in live {
            let _ = self
                .cells
                .delete(&formation.metadata.namespace, &cell.metadata.name)
                .await;
        }
    }

    async fn on_terminal_failure(&self, formation: Formation, error: &ReconcileError) {
        let mut status = formation.status.clone().unwrap_or_default();
        status.phase = FormationPhase::Failed;
        status.message = Some(format!("reconcile failed: {error}"));
        let mut updated = formation.clone();
        updated.status = Some(status);
        if let Err(err) = self.formations.set_status(updated).await {
            tracing::error!(formation = %formation.key(), error = %err, "failed to record terminal failure");
        }
    }
}
