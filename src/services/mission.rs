//! Mission controller.
//!
//! Drives a Mission from Pending through Running to a terminal phase by
//! sending the objective to the entrypoint cell and repeatedly evaluating
//! completion checks. Terminal phases are absorbing. The transition table
//! lives in [`MissionController::reconcile_running`]; guards are evaluated
//! top to bottom and the first match wins.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use crate::domain::errors::ReconcileError;
use crate::domain::models::envelope::inbox_subject;
use crate::domain::models::{
    AttemptRecord, CheckStatus, Envelope, Mission, MissionPhase, MissionStatus, Resource,
    ReviewDecision, ReviewState,
};
use crate::domain::ports::{Bus, ResourceStore};
use crate::services::checks::CheckRunner;
use crate::services::reconciler::Reconcile;

pub struct MissionController {
    store: Arc<dyn ResourceStore<Mission>>,
    bus: Arc<dyn Bus>,
    checks: CheckRunner,
}

impl MissionController {
    pub fn new(store: Arc<dyn ResourceStore<Mission>>, bus: Arc<dyn Bus>) -> Self {
        let checks = CheckRunner::new(Arc::clone(&bus));
        Self { store, bus, checks }
    }

    async fn write_status(&self, mission: &Mission, status: MissionStatus) -> Result<(), ReconcileError> {
        let mut updated = mission.clone();
        updated.status = Some(status);
        self.store
            .set_status(updated)
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }

    /// Pending: deliver the objective and start (or restart) the attempt.
    async fn reconcile_pending(&self, mission: &Mission, mut status: MissionStatus) -> Result<(), ReconcileError> {
        let namespace = mission
            .spec
            .entrypoint
            .namespace
            .clone()
            .unwrap_or_else(|| mission.metadata.namespace.clone());

        let envelope = Envelope::message(
            format!("mission/{}", mission.metadata.name),
            &mission.spec.entrypoint.cell,
            &mission.spec.entrypoint.message,
        );
        self.bus
            .publish(&inbox_subject(&namespace, &mission.spec.entrypoint.cell), &envelope)
            .await
            .map_err(ReconcileError::transient)?;

        // A non-zero attempt counter means this Pending is a retry: record
        // the completed attempt before starting the next one.
        if status.attempt > 0 {
            let record = AttemptRecord {
                attempt: status.attempt,
                started_at: status.started_at,
                result: status.message.clone().unwrap_or_else(|| "retried".to_string()),
            };
            status.history.get_or_insert_with(Vec::new).push(record);
        }

        status.attempt += 1;
        status.started_at = Some(Utc::now());
        status.phase = MissionPhase::Running;
        status.checks = None;
        status.review = None;
        status.message = None;

        tracing::info!(
            mission = %mission.metadata.name,
            attempt = status.attempt,
            cell = %mission.spec.entrypoint.cell,
            "mission attempt started"
        );
        self.write_status(mission, status).await
    }

    /// Running: the transition table.
    async fn reconcile_running(&self, mission: &Mission, mut status: MissionStatus) -> Result<(), ReconcileError> {
        let max_attempts = mission.spec.completion.max_attempts;

        // Budget gate. Cost equal to the cap counts as exhausted.
        if let Some(budget) = &mission.spec.budget {
            if status.cost >= budget.max_cost {
                tracing::warn!(mission = %mission.metadata.name, cost = status.cost, "mission budget exhausted");
                status.phase = MissionPhase::Failed;
                status.message = Some(format!(
                    "Budget exhausted: cost {:.4} reached maxCost {:.4}",
                    status.cost, budget.max_cost
                ));
                return self.write_status(mission, status).await;
            }
        }

        // Timeout gate.
        if let (Some(raw), Some(started_at)) = (&mission.spec.completion.timeout, status.started_at) {
            if let Some(timeout) = crate::domain::models::mission::parse_duration(raw) {
                let elapsed = Utc::now().signed_duration_since(started_at);
                if elapsed.num_seconds() >= 0 && elapsed.to_std().unwrap_or_default() > timeout {
                    if status.attempt >= max_attempts {
                        tracing::warn!(mission = %mission.metadata.name, "mission timed out; attempts exhausted");
                        status.phase = MissionPhase::Failed;
                        status.message =
                            Some(format!("Timed out after {} attempt(s)", status.attempt));
                    } else {
                        tracing::info!(mission = %mission.metadata.name, "mission timed out; retrying");
                        status.phase = MissionPhase::Pending;
                        status.message = Some("Timed out, retrying".to_string());
                    }
                    return self.write_status(mission, status).await;
                }
            }
        }

        // Review verdicts take precedence over re-running checks: once a
        // review is requested the attempt is frozen awaiting the decision.
        if let Some(review) = &status.review {
            match review.status {
                ReviewDecision::Approved => {
                    tracing::info!(mission = %mission.metadata.name, "mission review approved");
                    status.phase = MissionPhase::Succeeded;
                    status.message = Some("Review approved".to_string());
                    return self.write_status(mission, status).await;
                }
                ReviewDecision::Rejected => {
                    let feedback = review.feedback.clone();
                    if status.attempt < max_attempts {
                        tracing::info!(mission = %mission.metadata.name, "mission review rejected; retrying");
                        status.phase = MissionPhase::Pending;
                        status.message = Some(match feedback {
                            Some(feedback) => format!("Review rejected: {feedback}"),
                            None => "Review rejected, retrying".to_string(),
                        });
                    } else {
                        tracing::warn!(mission = %mission.metadata.name, "mission review rejected; attempts exhausted");
                        status.phase = MissionPhase::Failed;
                        status.message = Some("Review rejected".to_string());
                    }
                    return self.write_status(mission, status).await;
                }
                ReviewDecision::Pending => return Ok(()),
            }
        }

        // Evaluate completion checks.
        let workspace = mission.spec.workspace_path.as_ref().map(PathBuf::from);
        let mut results = Vec::with_capacity(mission.spec.completion.checks.len());
        for check in &mission.spec.completion.checks {
            results.push(self.checks.run(check, workspace.as_deref()).await);
        }

        let all_passed =
            !results.is_empty() && results.iter().all(|r| r.status == CheckStatus::Passed);
        status.checks = Some(results);

        if all_passed {
            if mission.spec.review_enabled() {
                tracing::info!(mission = %mission.metadata.name, "mission checks passed; review requested");
                status.review = Some(ReviewState { status: ReviewDecision::Pending, feedback: None });
                status.message = Some("Awaiting review".to_string());
            } else {
                tracing::info!(mission = %mission.metadata.name, "mission completed");
                status.phase = MissionPhase::Succeeded;
                status.message = Some("All checks passed".to_string());
            }
        }

        self.write_status(mission, status).await
    }
}

#[async_trait]
impl Reconcile<Mission> for MissionController {
    async fn reconcile(&self, mission: Mission) -> Result<(), ReconcileError> {
        let status = mission.status.clone().unwrap_or_default();

        match status.phase {
            // Terminal phases emit no further transitions.
            MissionPhase::Succeeded | MissionPhase::Failed => Ok(()),
            MissionPhase::Pending => self.reconcile_pending(&mission, status).await,
            MissionPhase::Running => self.reconcile_running(&mission, status).await,
        }
    }

    async fn on_terminal_failure(&self, mission: Mission, error: &ReconcileError) {
        let mut status = mission.status.clone().unwrap_or_default();
        if status.phase.is_terminal() {
            return;
        }
        status.phase = MissionPhase::Failed;
        status.message = Some(format!("reconcile failed: {error}"));
        let mut updated = mission.clone();
        updated.status = Some(status);
        if let Err(err) = self.store.set_status(updated).await {
            tracing::error!(mission = %mission.key(), error = %err, "failed to record terminal failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bus::MemoryBus;
    use crate::adapters::store::MemoryStore;
    use crate::domain::models::{
        CheckSpec, CompletionSpec, Entrypoint, MissionBudget, MissionSpec, ObjectMeta, ReviewSpec,
    };
    use chrono::Duration as ChronoDuration;

    fn mission_with(checks: Vec<CheckSpec>, max_attempts: u32, timeout: Option<&str>) -> Mission {
        Mission::new(
            ObjectMeta::named("deploy", "default"),
            MissionSpec {
                entrypoint: Entrypoint {
                    cell: "lead".to_string(),
                    namespace: None,
                    message: "ship it".to_string(),
                },
                completion: CompletionSpec {
                    checks,
                    max_attempts,
                    timeout: timeout.map(String::from),
                },
                budget: None,
                review: None,
                workspace_path: None,
            },
        )
    }

    fn echo_check() -> CheckSpec {
        CheckSpec::Command {
            name: "smoke".to_string(),
            command: "echo ok".to_string(),
            success_pattern: Some("ok".to_string()),
            fail_pattern: None,
        }
    }

    async fn setup(mission: Mission) -> (Arc<MemoryStore<Mission>>, Arc<MemoryBus>, MissionController) {
        let store = Arc::new(MemoryStore::<Mission>::new());
        let bus = MemoryBus::new();
        store.create(mission).await.unwrap();
        let controller = MissionController::new(
            store.clone() as Arc<dyn ResourceStore<Mission>>,
            bus.clone() as Arc<dyn Bus>,
        );
        (store, bus, controller)
    }

    async fn get(store: &MemoryStore<Mission>) -> Mission {
        ResourceStore::get(store, "default", "deploy").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (store, bus, controller) = setup(mission_with(vec![echo_check()], 3, None)).await;
        let mut inbox = bus.subscribe("cell.default.lead.inbox").await.unwrap();

        // First reconcile: Pending -> Running, entrypoint message sent.
        controller.reconcile(get(&store).await).await.unwrap();
        let mission = get(&store).await;
        let status = mission.status.clone().unwrap();
        assert_eq!(status.phase, MissionPhase::Running);
        assert_eq!(status.attempt, 1);
        assert_eq!(inbox.next().await.unwrap().content(), "ship it");

        // Second reconcile: checks run and pass -> Succeeded.
        controller.reconcile(mission).await.unwrap();
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Succeeded);
        let checks = status.checks.unwrap();
        assert_eq!(checks[0].status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn test_timeout_retry_preserves_attempt_counter() {
        let (store, _, controller) = setup(mission_with(vec![echo_check()], 3, Some("30m"))).await;

        controller.reconcile(get(&store).await).await.unwrap();

        // Backdate the attempt start to 31 minutes ago.
        let mut mission = get(&store).await;
        let mut status = mission.status.clone().unwrap();
        status.started_at = Some(Utc::now() - ChronoDuration::minutes(31));
        status.cost = 1.0;
        mission.status = Some(status);
        store.set_status(mission.clone()).await.unwrap();

        controller.reconcile(get(&store).await).await.unwrap();
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Pending);
        assert_eq!(status.message.as_deref(), Some("Timed out, retrying"));
        assert_eq!(status.attempt, 1);

        // Next reconcile restarts with attempt 2 and records history.
        controller.reconcile(get(&store).await).await.unwrap();
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Running);
        assert_eq!(status.attempt, 2);
        let history = status.history.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[0].result, "Timed out, retrying");
        // Budget carries across attempts.
        assert!((status.cost - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_timeout_with_exhausted_attempts_fails() {
        let (store, _, controller) = setup(mission_with(vec![echo_check()], 1, Some("30m"))).await;

        controller.reconcile(get(&store).await).await.unwrap();

        let mut mission = get(&store).await;
        let mut status = mission.status.clone().unwrap();
        status.started_at = Some(Utc::now() - ChronoDuration::minutes(31));
        mission.status = Some(status);
        store.set_status(mission).await.unwrap();

        controller.reconcile(get(&store).await).await.unwrap();
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Failed);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_at_exact_cap() {
        let mut mission = mission_with(vec![echo_check()], 3, None);
        mission.spec.budget = Some(MissionBudget { max_cost: 2.0 });
        let (store, _, controller) = setup(mission).await;

        controller.reconcile(get(&store).await).await.unwrap();

        let mut mission = get(&store).await;
        let mut status = mission.status.clone().unwrap();
        status.cost = 2.0; // exactly the cap
        mission.status = Some(status);
        store.set_status(mission).await.unwrap();

        controller.reconcile(get(&store).await).await.unwrap();
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Failed);
        assert!(status.message.unwrap().starts_with("Budget exhausted"));
    }

    #[tokio::test]
    async fn test_review_flow() {
        let mut mission = mission_with(vec![echo_check()], 3, None);
        mission.spec.review = Some(ReviewSpec { enabled: true });
        let (store, _, controller) = setup(mission).await;

        controller.reconcile(get(&store).await).await.unwrap();
        controller.reconcile(get(&store).await).await.unwrap();

        // Checks passed but review pending: still Running.
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Running);
        assert_eq!(status.review.as_ref().unwrap().status, ReviewDecision::Pending);

        // Approve.
        let mut mission = get(&store).await;
        let mut status = mission.status.clone().unwrap();
        status.review = Some(ReviewState { status: ReviewDecision::Approved, feedback: None });
        mission.status = Some(status);
        store.set_status(mission).await.unwrap();

        controller.reconcile(get(&store).await).await.unwrap();
        assert_eq!(get(&store).await.status.unwrap().phase, MissionPhase::Succeeded);
    }

    #[tokio::test]
    async fn test_review_rejection_retries_then_fails() {
        let mut mission = mission_with(vec![echo_check()], 2, None);
        mission.spec.review = Some(ReviewSpec { enabled: true });
        let (store, _, controller) = setup(mission).await;

        for _ in 0..2 {
            // Run to review-pending, then reject.
            controller.reconcile(get(&store).await).await.unwrap();
            controller.reconcile(get(&store).await).await.unwrap();

            let mut mission = get(&store).await;
            let mut status = mission.status.clone().unwrap();
            status.review = Some(ReviewState {
                status: ReviewDecision::Rejected,
                feedback: Some("not good enough".to_string()),
            });
            mission.status = Some(status);
            store.set_status(mission).await.unwrap();

            controller.reconcile(get(&store).await).await.unwrap();
        }

        let status = get(&store).await.status.unwrap();
        // Second rejection happens at attempt == maxAttempts.
        assert_eq!(status.phase, MissionPhase::Failed);
        assert_eq!(status.message.as_deref(), Some("Review rejected"));
    }

    #[tokio::test]
    async fn test_terminal_phases_are_absorbing() {
        let (store, _, controller) = setup(mission_with(vec![echo_check()], 3, None)).await;

        let mut mission = get(&store).await;
        mission.status = Some(MissionStatus {
            phase: MissionPhase::Succeeded,
            attempt: 1,
            ..MissionStatus::default()
        });
        store.set_status(mission).await.unwrap();

        controller.reconcile(get(&store).await).await.unwrap();
        let status = get(&store).await.status.unwrap();
        assert_eq!(status.phase, MissionPhase::Succeeded);
        assert_eq!(status.attempt, 1);
    }

    #[tokio::test]
    async fn test_no_checks_keeps_running() {
        let (store, _, controller) = setup(mission_with(Vec::new(), 3, None)).await;

        controller.reconcile(get(&store).await).await.unwrap();
        controller.reconcile(get(&store).await).await.unwrap();

        // A mission with no checks cannot complete on its own.
        assert_eq!(get(&store).await.status.unwrap().phase, MissionPhase::Running);
    }
}
