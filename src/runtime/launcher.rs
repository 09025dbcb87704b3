//! In-process cell launcher.
//!
//! Stands in for the container runtime: watches Cell resources and runs one
//! [`CellRuntime`] per cell inside this process, wiring the cell's Mind
//! provider and marking the resource Running. A deployment backed by a real
//! cluster replaces this with worker pods running `mitos worker`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::adapters::minds::MindRegistry;
use crate::domain::errors::ReconcileError;
use crate::domain::models::{Cell, CellPhase, CellStatus, Resource};
use crate::domain::ports::{Bus, ResourceStore};
use crate::services::config::RuntimeConfig;
use crate::services::reconciler::Reconcile;

use super::cell::{CellHandle, CellRuntime, CellRuntimeOptions};
use super::tools::ToolRegistry;

pub struct CellLauncher {
    cells: Arc<dyn ResourceStore<Cell>>,
    bus: Arc<dyn Bus>,
    minds: Arc<MindRegistry>,
    tools: ToolRegistry,
    runtime_config: RuntimeConfig,
    running: Mutex<HashMap<String, CellHandle>>,
}

impl CellLauncher {
    pub fn new(
        cells: Arc<dyn ResourceStore<Cell>>,
        bus: Arc<dyn Bus>,
        minds: Arc<MindRegistry>,
        tools: ToolRegistry,
        runtime_config: RuntimeConfig,
    ) -> Self {
        Self {
            cells,
            bus,
            minds,
            tools,
            runtime_config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Stop every running cell; used on process shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, CellHandle)> = {
            let mut running = self.running.lock().await;
            running.drain().collect()
        };
        for (key, handle) in handles {
            tracing::info!(cell = %key, "stopping cell runtime");
            handle.stop().await;
        }
    }
}

#[async_trait]
impl Reconcile<Cell> for CellLauncher {
    async fn reconcile(&self, cell: Cell) -> Result<(), ReconcileError> {
        let key = cell.key();

        {
            let running = self.running.lock().await;
            if running.contains_key(&key) {
                return Ok(());
            }
        }

        let mind = self
            .minds
            .create(&cell.spec.mind.provider)
            .map_err(ReconcileError::terminal)?;

        let options = CellRuntimeOptions::from_spec(
            &cell.metadata.name,
            &cell.metadata.namespace,
            &cell.spec,
            &self.runtime_config,
        );
        let runtime = CellRuntime::new(options, Arc::clone(&self.bus), mind, &self.tools);
        let handle = runtime.start();

        {
            let mut running = self.running.lock().await;
            running.insert(key, handle);
        }

        let mut updated = cell.clone();
        updated.status = Some(CellStatus {
            phase: CellPhase::Running,
            cost: cell.cost(),
            message: None,
        });
        self.cells
            .set_status(updated)
            .await
            .map_err(ReconcileError::transient)?;
        Ok(())
    }

    async fn cleanup(&self, cell: Cell) {
        let handle = {
            let mut running = self.running.lock().await;
            running.remove(&cell.key())
        };
        if let Some(handle) = handle {
            tracing::info!(cell = %cell.key(), "cell deleted; stopping runtime");
            handle.stop().await;
        }
    }

    async fn on_terminal_failure(&self, cell: Cell, error: &ReconcileError) {
        let mut updated = cell.clone();
        updated.status = Some(CellStatus {
            phase: CellPhase::Failed,
            cost: cell.cost(),
            message: Some(format!("launch failed: {error}")),
        });
        if let Err(err) = self.cells.set_status(updated).await {
            tracing::error!(cell = %cell.key(), error = %err, "failed to record launch failure");
        }
    }
}
