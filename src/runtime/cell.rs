//! The per-cell agentic runtime.
//!
//! One logical execution per cell: inbox envelopes are drained serially,
//! and each message runs the think → tool → think loop to a terminal state
//! (responded, errored, paused, or iteration cap) before the next message
//! is picked up. All per-message errors are caught; only process-level
//! failures stop the drainer.

use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::models::envelope::{events_subject, inbox_subject, outbox_subject};
use crate::domain::models::{
    CellBudget, CellEvent, CellEventType, CellSpec, ChatMessage, Envelope, MemorySpec, Role,
    ThinkRequest, TraceContext,
};
use crate::domain::ports::{Bus, Mind};
use crate::services::config::RuntimeConfig;
use crate::services::topology::{topology_subject, RoutingTable};

use super::budget::BudgetTracker;
use super::memory::WorkingMemory;
use super::tools::{SendMessageTool, ToolRegistry};

#[derive(Debug, Clone)]
pub struct CellRuntimeOptions {
    pub cell_name: String,
    pub namespace: String,
    pub formation_ref: Option<String>,
    pub system_prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    pub tool_names: Vec<String>,
    pub memory: MemorySpec,
    pub budget: Option<CellBudget>,
    pub max_iterations: u32,
    pub ack_wait: Duration,
    pub durable_inbox: bool,
}

impl CellRuntimeOptions {
    /// Combine a cell spec with the process-level runtime config.
    pub fn from_spec(
        cell_name: impl Into<String>,
        namespace: impl Into<String>,
        spec: &CellSpec,
        runtime: &RuntimeConfig,
    ) -> Self {
        Self {
            cell_name: cell_name.into(),
            namespace: namespace.into(),
            formation_ref: spec.formation_ref.clone(),
            system_prompt: spec.system_prompt.clone(),
            model: Some(spec.mind.model.clone()),
            temperature: spec.mind.temperature,
            max_tokens: spec.mind.max_tokens,
            tool_names: spec.tools.clone(),
            memory: spec.memory.unwrap_or(MemorySpec {
                max_messages: runtime.max_messages,
                summarize_after: runtime.summarize_after,
            }),
            budget: spec.budget,
            max_iterations: runtime.max_iterations,
            ack_wait: Duration::from_secs(runtime.ack_wait_secs),
            durable_inbox: runtime.durable_inbox,
        }
    }
}

/// Running cell; stop drains the current message before returning.
pub struct CellHandle {
    stop: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl CellHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

pub struct CellRuntime {
    options: CellRuntimeOptions,
    bus: Arc<dyn Bus>,
    mind: Arc<dyn Mind>,
    tools: ToolRegistry,
    memory: tokio::sync::Mutex<WorkingMemory>,
    budget: Mutex<BudgetTracker>,
    processed: Mutex<HashSet<Uuid>>,
    paused: AtomicBool,
    /// Allowed destinations from the formation routing table; `None` means
    /// unrestricted (no table published for this cell).
    allowed_destinations: Arc<Mutex<Option<Vec<String>>>>,
}

impl CellRuntime {
    pub fn new(
        options: CellRuntimeOptions,
        bus: Arc<dyn Bus>,
        mind: Arc<dyn Mind>,
        base_tools: &ToolRegistry,
    ) -> Arc<Self> {
        let allowed_destinations = Arc::new(Mutex::new(None));

        let mut tools = base_tools.clone();
        tools.register(Arc::new(SendMessageTool::new(
            options.cell_name.clone(),
            options.namespace.clone(),
            Arc::clone(&bus),
            Arc::clone(&allowed_destinations),
        )));

        Arc::new(Self {
            memory: tokio::sync::Mutex::new(WorkingMemory::new(&options.memory)),
            budget: Mutex::new(BudgetTracker::new(options.budget.as_ref())),
            processed: Mutex::new(HashSet::new()),
            paused: AtomicBool::new(false),
            allowed_destinations,
            options,
            bus,
            mind,
            tools,
        })
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn total_cost(&self) -> f64 {
        self.budget.lock().map(|b| b.total_cost()).unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Spawn the drainer task.
    pub fn start(self: &Arc<Self>) -> CellHandle {
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let runtime = Arc::clone(self);
        let cell_name = runtime.options.cell_name.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = runtime.run(stop_rx).await {
                tracing::error!(cell = %cell_name, error = %err, "cell runtime stopped with error");
            }
        });
        CellHandle { stop: stop_tx, task }
    }

    async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        self.load_topology().await;

        let namespace = &self.options.namespace;
        let name = &self.options.cell_name;

        let mut control = self
            .bus
            .subscribe(&crate::domain::models::envelope::control_subject(namespace, name))
            .await?;

        self.emit(CellEventType::Started, json!({})).await;
        tracing::info!(cell = %name, namespace = %namespace, durable = self.options.durable_inbox, "cell started");

        let inbox = inbox_subject(namespace, name);
        if self.options.durable_inbox {
            let durable_name = format!("cell-{namespace}-{name}");
            let mut sub = self
                .bus
                .subscribe_durable(&inbox, &durable_name, self.options.ack_wait)
                .await?;

            loop {
                let delivery = tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() { break; }
                        continue;
                    }
                    envelope = control.next() => {
                        if let Some(envelope) = envelope {
                            if self.handle_control(&envelope) { break; }
                        }
                        continue;
                    }
                    delivery = sub.next() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };

                // Redelivery after restart: ack and skip anything already
                // fully processed.
                let seen = self
                    .processed
                    .lock()
                    .map(|set| set.contains(&delivery.envelope.id))
                    .unwrap_or(false);
                if seen {
                    delivery.ack().await;
                    continue;
                }

                self.handle_message(&delivery.envelope).await;

                if let Ok(mut set) = self.processed.lock() {
                    set.insert(delivery.envelope.id);
                }
                // Ack only after full processing; a crash before this point
                // leads to redelivery, deduplicated above.
                delivery.ack().await;
            }
        } else {
            let mut sub = self.bus.subscribe(&inbox).await?;
            loop {
                let envelope = tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() { break; }
                        continue;
                    }
                    envelope = control.next() => {
                        if let Some(envelope) = envelope {
                            if self.handle_control(&envelope) { break; }
                        }
                        continue;
                    }
                    envelope = sub.next() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                self.handle_message(&envelope).await;
            }
        }

        self.emit(CellEventType::Stopped, json!({})).await;
        tracing::info!(cell = %name, "cell stopped");
        Ok(())
    }

    /// Returns true when the runtime should shut down.
    fn handle_control(&self, envelope: &Envelope) -> bool {
        match envelope.control_action() {
            Some("drain") => {
                tracing::info!(cell = %self.options.cell_name, "drain requested");
                true
            }
            Some("pause") => {
                self.paused.store(true, Ordering::SeqCst);
                false
            }
            Some("resume") => {
                self.paused.store(false, Ordering::SeqCst);
                false
            }
            other => {
                tracing::warn!(cell = %self.options.cell_name, action = ?other, "unknown control action");
                false
            }
        }
    }

    /// Fetch this cell's routing entry from the retained topology artifact.
    async fn load_topology(&self) {
        let Some(formation) = &self.options.formation_ref else { return };
        let subject = topology_subject(&self.options.namespace, formation);

        let Ok(retained) = self.bus.retained(&subject).await else { return };
        let Some(latest) = retained.last() else { return };

        let Some(routes) = latest.payload.get("routes") else { return };
        let Ok(table) = serde_json::from_value::<RoutingTable>(routes.clone()) else {
            tracing::warn!(cell = %self.options.cell_name, "malformed topology artifact ignored");
            return;
        };

        if let Some(entry) = table.get(&self.options.cell_name) {
            if let Ok(mut allowed) = self.allowed_destinations.lock() {
                *allowed = Some(entry.destinations.clone());
            }
            tracing::info!(
                cell = %self.options.cell_name,
                destinations = entry.destinations.len(),
                "topology routing loaded"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Per-message state machine
    // -------------------------------------------------------------------------

    async fn handle_message(&self, envelope: &Envelope) {
        let trace_id = envelope
            .trace_context
            .as_ref()
            .and_then(TraceContext::parse)
            .map(|(trace_id, _)| trace_id)
            .or_else(|| envelope.trace_id.clone());

        let span = tracing::info_span!(
            "cell.handle_message",
            otel.kind = "server",
            cell_name = %self.options.cell_name,
            namespace = %self.options.namespace,
            envelope_id = %envelope.id,
            trace_id = trace_id.as_deref().unwrap_or(""),
        );
        self.process(envelope).instrument(span).await;
    }

    #[allow(clippy::too_many_lines)]
    async fn process(&self, envelope: &Envelope) {
        if self.is_paused() {
            self.publish_outbox(envelope, "Cell is paused (budget exhausted)").await;
            return;
        }

        {
            let mut memory = self.memory.lock().await;
            memory.push_text(Role::User, envelope.content());
        }

        for iteration in 0..self.options.max_iterations {
            // Budget gate ahead of every think call.
            let exceeded = self.budget.lock().map(|b| b.is_exceeded()).unwrap_or(false);
            if exceeded {
                self.paused.store(true, Ordering::SeqCst);
                let total = self.total_cost();
                {
                    let mut memory = self.memory.lock().await;
                    memory.push_text(Role::System, "Budget exceeded; cell paused.");
                }
                self.publish_outbox(envelope, "Budget exceeded; cell paused.").await;
                self.emit(CellEventType::BudgetExceeded, json!({ "totalCost": total })).await;
                return;
            }

            let request = {
                let memory = self.memory.lock().await;
                ThinkRequest {
                    system: Some(self.options.system_prompt.clone()),
                    messages: memory.messages(),
                    tools: self.tools.specs_for(&self.options.tool_names),
                    temperature: self.options.temperature,
                    max_tokens: self.options.max_tokens,
                    model: self.options.model.clone(),
                }
            };

            let llm_span = tracing::info_span!("cell.llm_call", iteration);
            let result = self.mind.think(request).instrument(llm_span).await;

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    // Per-message errors never kill the drainer.
                    tracing::warn!(cell = %self.options.cell_name, error = %err, "mind call failed");
                    {
                        let mut memory = self.memory.lock().await;
                        memory.push_text(Role::System, format!("LLM error: {err}"));
                    }
                    self.publish_outbox(envelope, &format!("Error: {err}")).await;
                    self.emit(CellEventType::Error, json!({ "error": err.to_string() })).await;
                    return;
                }
            };

            tracing::info!(
                cell = %self.options.cell_name,
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                cost = response.cost,
                stop_reason = %response.stop_reason,
                "mind call completed"
            );

            if let Ok(mut budget) = self.budget.lock() {
                budget.add_cost(response.cost);
            }

            if response.stop_reason == crate::domain::models::StopReason::ToolUse {
                let tool_calls: Vec<(String, String, serde_json::Value)> = response
                    .tool_calls()
                    .into_iter()
                    .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                    .collect();

                {
                    let mut memory = self.memory.lock().await;
                    memory.push(ChatMessage { role: Role::Assistant, content: response.content.clone() });
                }

                let mut results = Vec::with_capacity(tool_calls.len());
                for (tool_use_id, tool_name, input) in tool_calls {
                    let tool_span = tracing::info_span!("cell.tool_call", tool = %tool_name);
                    let outcome = self
                        .tools
                        .invoke(&tool_name, input)
                        .instrument(tool_span)
                        .await;
                    match outcome {
                        Ok(output) => results.push((tool_use_id, output, false)),
                        Err(err) => {
                            tracing::warn!(cell = %self.options.cell_name, tool = %tool_name, error = %err, "tool call failed");
                            results.push((tool_use_id, err.to_string(), true));
                        }
                    }
                }

                {
                    let mut memory = self.memory.lock().await;
                    memory.push_tool_results(results);
                    if memory.needs_summary() {
                        if let Err(err) = memory.summarize(self.mind.as_ref()).await {
                            tracing::warn!(cell = %self.options.cell_name, error = %err, "summarization failed");
                        }
                    }
                }
                continue;
            }

            // end_turn | max_tokens: respond and finish this message.
            let text = response.text();
            {
                let mut memory = self.memory.lock().await;
                memory.push_text(Role::Assistant, &text);
            }
            self.publish_outbox(envelope, &text).await;
            self.emit(
                CellEventType::Response,
                json!({
                    "content": text,
                    "inputTokens": response.usage.input_tokens,
                    "outputTokens": response.usage.output_tokens,
                    "cost": response.cost,
                    "iterations": iteration + 1,
                }),
            )
            .await;
            return;
        }

        self.publish_outbox(envelope, "Maximum tool call iterations reached").await;
        self.emit(
            CellEventType::MaxIterations,
            json!({ "maxIterations": self.options.max_iterations }),
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // Publication
    // -------------------------------------------------------------------------

    async fn publish_outbox(&self, source: &Envelope, content: &str) {
        let trace = source
            .trace_context
            .clone()
            .unwrap_or_else(|| {
                let trace_id = Uuid::new_v4().simple().to_string();
                let span_uuid = Uuid::new_v4().simple().to_string();
                TraceContext::from_ids(&trace_id, &span_uuid[..16])
            });

        let reply = Envelope::message(&self.options.cell_name, &source.from, content).with_trace(trace);

        let subject = outbox_subject(&self.options.namespace, &self.options.cell_name);
        if let Err(err) = self.bus.publish(&subject, &reply).await {
            tracing::error!(cell = %self.options.cell_name, error = %err, "outbox publish failed");
        }
    }

    async fn emit(&self, event_type: CellEventType, payload: serde_json::Value) {
        let event = CellEvent::new(
            event_type,
            &self.options.cell_name,
            &self.options.namespace,
            payload,
        );
        let envelope = Envelope::new(
            &self.options.cell_name,
            "events",
            crate::domain::models::EnvelopeType::Event,
            serde_json::to_value(&event).unwrap_or_default(),
        );
        let subject = events_subject(&self.options.namespace, &self.options.cell_name);
        if let Err(err) = self.bus.publish(&subject, &envelope).await {
            tracing::error!(cell = %self.options.cell_name, error = %err, "event publish failed");
        }
    }
}
