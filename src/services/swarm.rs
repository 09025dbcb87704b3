//! Swarm controller.
//!
//! Autoscales a fleet of identical cells between `minReplicas` and
//! `maxReplicas` in response to a trigger signal, with cooldown and
//! stabilization guards, a budget gate on scale-up, and drain-then-delete
//! scale-down removing the most recently created cells first.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::domain::errors::ReconcileError;
use crate::domain::models::envelope::control_subject;
use crate::domain::models::{
    Cell, Envelope, ObjectMeta, OwnerReference, Resource, Swarm, SwarmPhase, SwarmStatus,
    TriggerSpec,
};
use crate::domain::ports::{Bus, ResourceStore};
use crate::services::reconciler::Reconcile;

/// Label linking autoscaled cells back to their swarm.
pub const SWARM_LABEL: &str = "swarm";

/// Last-known values for `metric` triggers, fed by external reporters.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    values: Arc<RwLock<HashMap<String, f64>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, name: &str, value: f64) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.read().ok().and_then(|values| values.get(name).copied())
    }
}

/// Scale-candidate tracking for the stabilization window.
struct Stabilization {
    candidate: u32,
    since: DateTime<Utc>,
}

pub struct SwarmController {
    swarms: Arc<dyn ResourceStore<Swarm>>,
    cells: Arc<dyn ResourceStore<Cell>>,
    bus: Arc<dyn Bus>,
    metrics: MetricRegistry,
    stabilization: Mutex<HashMap<String, Stabilization>>,
}

impl SwarmController {
    pub fn new(
        swarms: Arc<dyn ResourceStore<Swarm>>,
        cells: Arc<dyn ResourceStore<Cell>>,
        bus: Arc<dyn Bus>,
        metrics: MetricRegistry,
    ) -> Self {
        Self {
            swarms,
            cells,
            bus,
            metrics,
            stabilization: Mutex::new(HashMap::new()),
        }
    }

    /// Does a `*/N` or `*` minute pattern match the current minute?
    fn schedule_matches(pattern: &str, minute: u32) -> bool {
        if pattern == "*" {
            return true;
        }
        pattern
            .strip_prefix("*/")
            .and_then(|n| n.parse::<u32>().ok())
            .is_some_and(|n| n > 0 && minute % n == 0)
    }

    async fn trigger_value(&self, swarm: &Swarm) -> Result<f64, ReconcileError> {
        match &swarm.spec.trigger {
            TriggerSpec::QueueDepth { subject, .. } => {
                let depth = self
                    .bus
                    .queue_depth(subject)
                    .await
                    .map_err(ReconcileError::transient)?;
                #[allow(clippy::cast_precision_loss)]
                Ok(depth as f64)
            }
            TriggerSpec::Metric { name, .. } => Ok(self.metrics.get(name).unwrap_or(0.0)),
            TriggerSpec::Schedule { pattern } => {
                Ok(f64::from(u8::from(Self::schedule_matches(pattern, Utc::now().minute()))))
            }
            // Cost/throughput ratio; reported externally like a metric until
            // throughput accounting lands.
            TriggerSpec::BudgetEfficiency { .. } => {
                Ok(self.metrics.get("budget_efficiency").unwrap_or(0.0))
            }
        }
    }

    fn desired_replicas(swarm: &Swarm, current: u32, value: f64) -> u32 {
        let min = swarm.spec.min_replicas;
        let max = swarm.spec.max_replicas;
        let step = swarm.spec.scaling.step;

        match &swarm.spec.trigger {
            TriggerSpec::Schedule { pattern } => {
                if Self::schedule_matches(pattern, Utc::now().minute()) {
                    max
                } else {
                    min
                }
            }
            TriggerSpec::QueueDepth { scale_above, scale_below, .. }
            | TriggerSpec::Metric { scale_above, scale_below, .. }
            | TriggerSpec::BudgetEfficiency { scale_above, scale_below } => {
                if value > *scale_above {
                    current.saturating_add(step).clamp(min, max)
                } else if value < *scale_below {
                    current.saturating_sub(step).clamp(min, max)
                } else {
                    current.clamp(min, max)
                }
            }
        }
    }

    fn cell_name(swarm: &Swarm, index: u32) -> String {
        format!("{}-{index}", swarm.metadata.name)
    }

    /// Ensure exactly `count` replicas exist. Scale-down drains and removes
    /// the highest indexes (most recently created) first.
    async fn converge(&self, swarm: &Swarm, count: u32) -> Result<(), ReconcileError> {
        let namespace = swarm.metadata.namespace.as_str();
        let live = self
            .cells
            .list_labeled(Some(namespace), SWARM_LABEL, &swarm.metadata.name)
            .await
            .map_err(ReconcileError::transient)?;

        for index in 0..count {
            let name = Self::cell_name(swarm, index);
            if live.iter().any(|c| c.metadata.name == name) {
                continue;
            }
            let meta = ObjectMeta::named(&name, namespace)
                .with_label(SWARM_LABEL, &swarm.metadata.name)
                .with_owner(OwnerReference {
                    kind: "Swarm".to_string(),
                    name: swarm.metadata.name.clone(),
                    uid: swarm.metadata.uid,
                });
            self.cells
                .create(Cell::new(meta, swarm.spec.cell_template.clone()))
                .await
                .map_err(ReconcileError::transient)?;
            tracing::info!(swarm = %swarm.metadata.name, cell = %name, "replica created");
        }

        // LIFO removal: highest index first.
        let mut extra: Vec<&Cell> = live
            .iter()
            .filter(|c| {
                Self::replica_index(swarm, &c.metadata.name).is_none_or(|index| index >= count)
            })
            .collect();
        extra.sort_by_key(|c| std::cmp::Reverse(Self::replica_index(swarm, &c.metadata.name)));

        let grace = Duration::from_secs(swarm.spec.scaling.grace_period_seconds);
        for cell in extra {
            let drain = Envelope::control(
                format!("swarm/{}", swarm.metadata.name),
                &cell.metadata.name,
                "drain",
                json!({ "gracePeriodSeconds": swarm.spec.scaling.grace_period_seconds }),
            );
            self.bus
                .publish(&control_subject(namespace, &cell.metadata.name), &drain)
                .await
                .map_err(ReconcileError::transient)?;

            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }

            self.cells
                .delete(namespace, &cell.metadata.name)
                .await
                .map_err(ReconcileError::transient)?;
            tracing::info!(swarm = %swarm.metadata.name, cell = %cell.metadata.name, "replica drained and removed");
        }

        Ok(())
    }

    fn replica_index(swarm: &Swarm, cell_name: &str) -> Option<u32> {
        cell_name
            .strip_prefix(&format!("{}-", swarm.metadata.name))
            .and_then(|raw| raw.parse().ok())
    }

    async fn write_status(&self, swarm: &Swarm, status: SwarmStatus) -> Result<(), ReconcileError> {
        let mut updated = swarm.clone();
        updated.status = Some(status);
        self.swarms
            .set_status(updated)
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile<Swarm> for SwarmController {
    #[allow(clippy::too_many_lines)]
    async fn reconcile(&self, swarm: Swarm) -> Result<(), ReconcileError> {
        let mut status = swarm.status.clone().unwrap_or_default();

        // Suspended swarms skip trigger evaluation entirely.
        if swarm.spec.suspended {
            status.phase = SwarmPhase::Suspended;
            return self.write_status(&swarm, status).await;
        }
        status.phase = SwarmPhase::Active;

        let current = status
            .current_replicas
            .clamp(swarm.spec.min_replicas, swarm.spec.max_replicas);

        let value = self.trigger_value(&swarm).await?;
        status.last_trigger_value = Some(value);

        let desired = Self::desired_replicas(&swarm, current, value);
        status.desired_replicas = desired;

        if desired == current {
            // Nothing to decide; still converge (first reconcile creates the
            // minimum fleet) and clear any stale scale candidate.
            if let Ok(mut stabilization) = self.stabilization.lock() {
                stabilization.remove(&swarm.key());
            }
            self.converge(&swarm, current).await?;
            status.current_replicas = current;
            return self.write_status(&swarm, status).await;
        }

        // Guard 1: cooldown since the last scale.
        if let Some(last) = status.last_scale_time {
            let elapsed = Utc::now().signed_duration_since(last);
            let cooldown = i64::try_from(swarm.spec.scaling.cooldown_seconds).unwrap_or(i64::MAX);
            if elapsed.num_seconds() < cooldown {
                self.converge(&swarm, current).await?;
                status.current_replicas = current;
                return self.write_status(&swarm, status).await;
            }
        }

        // Guards 2-3: the candidate must hold steady for the stabilization
        // window before acting.
        enum StabilizationOutcome {
            CandidateReset,
            StillStabilizing,
            Ready,
        }
        let outcome = {
            let mut stabilization = self
                .stabilization
                .lock()
                .map_err(|_| ReconcileError::terminal(anyhow::anyhow!("stabilization state poisoned")))?;
            let entry = stabilization.entry(swarm.key());
            let entry = entry.or_insert_with(|| Stabilization { candidate: desired, since: Utc::now() });

            if entry.candidate != desired {
                entry.candidate = desired;
                entry.since = Utc::now();
                StabilizationOutcome::CandidateReset
            } else {
                let held = Utc::now().signed_duration_since(entry.since);
                let window =
                    i64::try_from(swarm.spec.scaling.stabilization_seconds).unwrap_or(i64::MAX);
                if held.num_seconds() < window {
                    StabilizationOutcome::StillStabilizing
                } else {
                    stabilization.remove(&swarm.key());
                    StabilizationOutcome::Ready
                }
            }
        };

        match outcome {
            StabilizationOutcome::CandidateReset | StabilizationOutcome::StillStabilizing => {
                self.converge(&swarm, current).await?;
                status.current_replicas = current;
                return self.write_status(&swarm, status).await;
            }
            StabilizationOutcome::Ready => {}
        }

        // Guard 4: budget gate on scale-up. Projection uses the per-cell
        // hourly cap from the template.
        if desired > current {
            if let (Some(budget), Some(cell_budget)) =
                (&swarm.spec.budget, &swarm.spec.cell_template.budget)
            {
                if let Some(per_cell_hour) = cell_budget.max_cost_per_hour {
                    let projected = f64::from(desired) * per_cell_hour;
                    if projected > budget.max_cost_per_hour {
                        tracing::warn!(
                            swarm = %swarm.metadata.name,
                            projected,
                            cap = budget.max_cost_per_hour,
                            "scale-up cancelled by budget gate"
                        );
                        self.converge(&swarm, current).await?;
                        status.current_replicas = current;
                        return self.write_status(&swarm, status).await;
                    }
                }
            }
        }

        tracing::info!(
            swarm = %swarm.metadata.name,
            from = current,
            to = desired,
            trigger_value = value,
            "scaling"
        );
        self.converge(&swarm, desired).await?;

        status.current_replicas = desired;
        status.last_scale_time = Some(Utc::now());
        self.write_status(&swarm, status).await
    }

    /// Cascade: deleting the swarm deletes its replicas.
    async fn cleanup(&self, swarm: Swarm) {
        let Ok(live) = self
            .cells
            .list_labeled(Some(&swarm.metadata.namespace), SWARM_LABEL, &swarm.metadata.name)
            .await
        else {
            return;
        };
        for cell in live {
            let _ = self.cells.delete(&swarm.metadata.namespace, &cell.metadata.name).await;
        }
    }

    async fn on_terminal_failure(&self, swarm: Swarm, error: &ReconcileError) {
        let mut status = swarm.status.clone().unwrap_or_default();
        status.phase = SwarmPhase::Error;
        status.message = Some(format!("reconcile failed: {error}"));
        let mut updated = swarm.clone();
        updated.status = Some(status);
        if let Err(err) = self.swarms.set_status(updated).await {
            tracing::error!(swarm = %swarm.key(), error = %err, "failed to record terminal failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::MemoryBus;
    use crate::adapters::store::MemoryStore;
    use crate::domain::models::{CellSpec, ScalingSpec, SwarmSpec};

    fn swarm(min: u32, max: u32, trigger: TriggerSpec) -> Swarm {
        Swarm::new(
            ObjectMeta::named("fleet", "default"),
            SwarmSpec {
                cell_template: CellSpec::default(),
                min_replicas: min,
                max_replicas: max,
                trigger,
                scaling: ScalingSpec {
                    step: 1,
                    cooldown_seconds: 0,
                    stabilization_seconds: 0,
                    grace_period_seconds: 0,
                },
                budget: None,
                suspended: false,
            },
        )
    }

    fn metric_trigger() -> TriggerSpec {
        TriggerSpec::Metric {
            name: "load".to_string(),
            scale_above: 10.0,
            scale_below: 2.0,
        }
    }

    struct Fixture {
        swarms: Arc<MemoryStore<Swarm>>,
        cells: Arc<MemoryStore<Cell>>,
        metrics: MetricRegistry,
        controller: SwarmController,
    }

    async fn setup(resource: Swarm) -> Fixture {
        let swarms = Arc::new(MemoryStore::<Swarm>::new());
        let cells = Arc::new(MemoryStore::<Cell>::new());
        let bus = MemoryBus::new();
        let metrics = MetricRegistry::new();
        swarms.create(resource).await.unwrap();

        let controller = SwarmController::new(
            swarms.clone() as Arc<dyn ResourceStore<Swarm>>,
            cells.clone() as Arc<dyn ResourceStore<Cell>>,
            bus as Arc<dyn Bus>,
            metrics.clone(),
        );
        Fixture { swarms, cells, metrics, controller }
    }

    async fn current(fixture: &Fixture) -> Swarm {
        ResourceStore::get(fixture.swarms.as_ref(), "default", "fleet")
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_reconcile_creates_minimum_fleet() {
        let fixture = setup(swarm(2, 5, metric_trigger())).await;
        fixture.controller.reconcile(current(&fixture).await).await.unwrap();

        assert_eq!(fixture.cells.list(Some("default")).await.unwrap().len(), 2);
        let status = current(&fixture).await.status.unwrap();
        assert_eq!(status.current_replicas, 2);
        assert_eq!(status.phase, SwarmPhase::Active);
    }

    #[tokio::test]
    async fn test_scales_up_on_high_signal() {
        let fixture = setup(swarm(1, 5, metric_trigger())).await;
        fixture.controller.reconcile(current(&fixture).await).await.unwrap();

        fixture.metrics.report("load", 50.0);
        // Zero-length stabilization window: the candidate acts immediately.
        fixture.controller.reconcile(current(&fixture).await).await.unwrap();

        let status = current(&fixture).await.status.unwrap();
        assert_eq!(status.current_replicas, 2);
        assert!(status.last_scale_time.is_some());
        assert_eq!(fixture.cells.list(Some("default")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_removes_newest_first() {
        let fixture = setup(swarm(1, 5, metric_trigger())).await;

        fixture.metrics.report("load", 50.0);
        for _ in 0..6 {
            fixture.controller.reconcile(current(&fixture).await).await.unwrap();
        }
        assert!(current(&fixture).await.status.unwrap().current_replicas >= 2);

        fixture.metrics.report("load", 0.0);
        fixture.controller.reconcile(current(&fixture).await).await.unwrap();
        fixture.controller.reconcile(current(&fixture).await).await.unwrap();

        let live = fixture.cells.list(Some("default")).await.unwrap();
        let names: Vec<_> = live.iter().map(|c| c.metadata.name.as_str()).collect();
        // fleet-0 survives; the newest index was removed.
        assert!(names.contains(&"fleet-0"));
        let status = current(&fixture).await.status.unwrap();
        assert_eq!(usize::try_from(status.current_replicas).unwrap(), live.len());
    }

    #[tokio::test]
    async fn test_replicas_stay_within_bounds() {
        let fixture = setup(swarm(1, 2, metric_trigger())).await;
        fixture.metrics.report("load", 100.0);

        for _ in 0..8 {
            fixture.controller.reconcile(current(&fixture).await).await.unwrap();
            let status = current(&fixture).await.status.unwrap();
            assert!(status.current_replicas >= 1 && status.current_replicas <= 2);
        }
        assert_eq!(current(&fixture).await.status.unwrap().current_replicas, 2);
    }

    #[tokio::test]
    async fn test_cooldown_blocks_consecutive_scales() {
        let mut resource = swarm(1, 5, metric_trigger());
        resource.spec.scaling.cooldown_seconds = 3600;
        let fixture = setup(resource).await;

        fixture.metrics.report("load", 50.0);
        for _ in 0..4 {
            fixture.controller.reconcile(current(&fixture).await).await.unwrap();
        }

        // One scale happened; the cooldown pins the count afterwards.
        assert_eq!(current(&fixture).await.status.unwrap().current_replicas, 2);
    }

    #[tokio::test]
    async fn test_stabilization_delays_action() {
        let mut resource = swarm(1, 5, metric_trigger());
        resource.spec.scaling.stabilization_seconds = 3600;
        let fixture = setup(resource).await;

        fixture.metrics.report("load", 50.0);
        for _ in 0..3 {
            fixture.controller.reconcile(current(&fixture).await).await.unwrap();
        }

        // Candidate never held long enough.
        assert_eq!(current(&fixture).await.status.unwrap().current_replicas, 1);
    }

    #[tokio::test]
    async fn test_budget_gate_cancels_scale_up() {
        let mut resource = swarm(1, 5, metric_trigger());
        resource.spec.budget = Some(crate::domain::models::SwarmBudget { max_cost_per_hour: 1.0 });
        resource.spec.cell_template.budget = Some(crate::domain::models::CellBudget {
            max_total_cost: 10.0,
            max_cost_per_hour: Some(0.8),
        });
        let fixture = setup(resource).await;

        fixture.metrics.report("load", 50.0);
        for _ in 0..3 {
            fixture.controller.reconcile(current(&fixture).await).await.unwrap();
        }

        // 2 replicas × 0.8/h = 1.6 > 1.0: scale-up cancelled.
        assert_eq!(current(&fixture).await.status.unwrap().current_replicas, 1);
    }

    #[tokio::test]
    async fn test_suspended_skips_evaluation() {
        let mut resource = swarm(1, 5, metric_trigger());
        resource.spec.suspended = true;
        let fixture = setup(resource).await;

        fixture.metrics.report("load", 50.0);
        fixture.controller.reconcile(current(&fixture).await).await.unwrap();

        let status = current(&fixture).await.status.unwrap();
        assert_eq!(status.phase, SwarmPhase::Suspended);
        assert!(fixture.cells.list(Some("default")).await.unwrap().is_empty());
    }

    #[test]
    fn test_schedule_pattern_matching() {
        assert!(SwarmController::schedule_matches("*", 17));
        assert!(SwarmController::schedule_matches("*/5", 15));
        assert!(!SwarmController::schedule_matches("*/5", 17));
        assert!(!SwarmController::schedule_matches("*/0", 10));
        assert!(!SwarmController::schedule_matches("7", 7));
    }
}
