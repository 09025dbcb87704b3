//! Generic reconcile harness.
//!
//! One [`Controller`] per resource kind: it watches the store, queues events
//! per resource key, and drains each key serially: events for the same
//! resource never reconcile in parallel, events for different resources do.
//! Transient failures retry with exponential backoff (base · 2^attempt, at
//! most `max_retries` extra attempts); after exhaustion the reconciler's
//! failure hook runs so the resource can be terminally failed in status.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::errors::ReconcileError;
use crate::domain::models::Resource;
use crate::domain::ports::{ResourceStore, WatchEvent};

/// Per-key queue capacity. Reconciles are level-triggered, so coalescing
/// (dropping) excess events is safe: the next resync re-enqueues.
const KEY_QUEUE_CAPACITY: usize = 16;

/// Reconcile logic for one resource kind.
#[async_trait]
pub trait Reconcile<T: Resource>: Send + Sync {
    /// Drive the resource toward its desired state.
    async fn reconcile(&self, resource: T) -> Result<(), ReconcileError>;

    /// Called when a resource is deleted; cleanup for owned children.
    async fn cleanup(&self, _resource: T) {}

    /// Called after retries exhaust or a terminal error occurs.
    async fn on_terminal_failure(&self, _resource: T, _error: &ReconcileError) {}
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Re-enqueue every live resource at this interval (timeout and tick
    /// driven transitions depend on it).
    pub resync_interval: Option<Duration>,
    pub retry_base: Duration,
    pub max_retries: u32,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            resync_interval: Some(Duration::from_secs(10)),
            retry_base: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// Running controller; dropping the handle does not stop it.
pub struct ControllerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Signal stop and wait for in-flight reconciles to finish their step.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

pub struct Controller<T: Resource> {
    name: &'static str,
    store: Arc<dyn ResourceStore<T>>,
    reconciler: Arc<dyn Reconcile<T>>,
    options: ControllerOptions,
}

impl<T: Resource> Controller<T> {
    pub fn new(
        name: &'static str,
        store: Arc<dyn ResourceStore<T>>,
        reconciler: Arc<dyn Reconcile<T>>,
        options: ControllerOptions,
    ) -> Self {
        Self { name, store, reconciler, options }
    }

    /// Spawn the watch/dispatch loop. The watch stream is subscribed before
    /// this returns, so no event created afterwards can be missed.
    pub fn start(self) -> ControllerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let watcher = self.store.watch();
        let task = tokio::spawn(self.run(stop_rx, watcher));
        ControllerHandle { stop: stop_tx, task }
    }

    async fn run(
        self,
        mut stop: watch::Receiver<bool>,
        mut watcher: tokio::sync::broadcast::Receiver<WatchEvent<T>>,
    ) {
        let mut workers: HashMap<String, mpsc::Sender<T>> = HashMap::new();

        let mut resync = self
            .options
            .resync_interval
            .map(tokio::time::interval);
        // The first interval tick fires immediately; that doubles as the
        // initial list-and-reconcile pass.

        tracing::info!(controller = self.name, "controller started");

        loop {
            tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }

                event = watcher.recv() => {
                    match event {
                        Ok(WatchEvent::Applied(resource)) => {
                            self.dispatch(&mut workers, resource, &stop);
                        }
                        Ok(WatchEvent::Deleted(resource)) => {
                            workers.remove(&resource.key());
                            self.reconciler.cleanup(resource).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(controller = self.name, missed, "watch lagged; forcing resync");
                            self.resync_all(&mut workers, &stop).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = maybe_tick(&mut resync) => {
                    self.resync_all(&mut workers, &stop).await;
                }
            }
        }

        tracing::info!(controller = self.name, "controller stopped");
    }

    async fn resync_all(&self, workers: &mut HashMap<String, mpsc::Sender<T>>, stop: &watch::Receiver<bool>) {
        match self.store.list(None).await {
            Ok(resources) => {
                for resource in resources {
                    self.dispatch(workers, resource, stop);
                }
            }
            Err(err) => tracing::warn!(controller = self.name, error = %err, "resync list failed"),
        }
    }

    /// Route a resource to its per-key worker, creating it on first sight.
    fn dispatch(&self, workers: &mut HashMap<String, mpsc::Sender<T>>, resource: T, stop: &watch::Receiver<bool>) {
        let key = resource.key();

        if let Some(sender) = workers.get(&key) {
            if !sender.is_closed() {
                // Full queue = coalesce; the resync will requeue.
                let _ = sender.try_send(resource);
                return;
            }
            workers.remove(&key);
        }

        let (tx, rx) = mpsc::channel(KEY_QUEUE_CAPACITY);
        let _ = tx.try_send(resource);
        workers.insert(key.clone(), tx);

        let reconciler = Arc::clone(&self.reconciler);
        let options = self.options.clone();
        let name = self.name;
        let stop = stop.clone();
        tokio::spawn(Self::worker(name, key, rx, reconciler, options, stop));
    }

    /// Serial per-key drain loop.
    async fn worker(
        name: &'static str,
        key: String,
        mut rx: mpsc::Receiver<T>,
        reconciler: Arc<dyn Reconcile<T>>,
        options: ControllerOptions,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let resource = tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() { return; }
                    continue;
                }
                resource = rx.recv() => match resource {
                    Some(resource) => resource,
                    None => return,
                },
            };

            Self::reconcile_with_retry(name, &key, resource, &reconciler, &options).await;
        }
    }

    async fn reconcile_with_retry(
        name: &'static str,
        key: &str,
        resource: T,
        reconciler: &Arc<dyn Reconcile<T>>,
        options: &ControllerOptions,
    ) {
        for attempt in 0..=options.max_retries {
            match reconciler.reconcile(resource.clone()).await {
                Ok(()) => return,
                Err(err) if err.is_transient() && attempt < options.max_retries => {
                    let backoff = options.retry_base * 2_u32.saturating_pow(attempt);
                    tracing::warn!(
                        controller = name,
                        resource = key,
                        attempt = attempt + 1,
                        backoff_secs = backoff.as_secs(),
                        error = %err,
                        "reconcile failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    tracing::error!(controller = name, resource = key, error = %err, "reconcile failed terminally");
                    reconciler.on_terminal_failure(resource, &err).await;
                    return;
                }
            }
        }
    }
}

async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) -> tokio::time::Instant {
    match interval {
        Some(interval) => interval.tick().await,
        // No resync configured: never fire.
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::store::MemoryStore;
    use crate::domain::models::{Cell, CellSpec, ObjectMeta};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Recording {
        calls: AtomicU32,
        order: Mutex<Vec<String>>,
        fail_times: u32,
    }

    #[async_trait]
    impl Reconcile<Cell> for Recording {
        async fn reconcile(&self, resource: Cell) -> Result<(), ReconcileError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(resource.metadata.name.clone());
            if n < self.fail_times {
                return Err(ReconcileError::transient(anyhow::anyhow!("blip")));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_watch_event_triggers_reconcile() {
        let store = Arc::new(MemoryStore::<Cell>::new());
        let reconciler = Arc::new(Recording {
            calls: AtomicU32::new(0),
            order: Mutex::new(Vec::new()),
            fail_times: 0,
        });

        let controller = Controller::new(
            "test",
            store.clone() as Arc<dyn ResourceStore<Cell>>,
            reconciler.clone() as Arc<dyn Reconcile<Cell>>,
            ControllerOptions { resync_interval: None, retry_base: Duration::from_millis(10), max_retries: 0 },
        );
        let handle = controller.start();

        store
            .create(Cell::new(ObjectMeta::named("worker-0", "default"), CellSpec::default()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reconciler.calls.load(Ordering::SeqCst) >= 1);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let store = Arc::new(MemoryStore::<Cell>::new());
        let reconciler = Arc::new(Recording {
            calls: AtomicU32::new(0),
            order: Mutex::new(Vec::new()),
            fail_times: 2,
        });

        let controller = Controller::new(
            "test",
            store.clone() as Arc<dyn ResourceStore<Cell>>,
            reconciler.clone() as Arc<dyn Reconcile<Cell>>,
            ControllerOptions { resync_interval: None, retry_base: Duration::from_millis(5), max_retries: 3 },
        );
        let handle = controller.start();

        store
            .create(Cell::new(ObjectMeta::named("worker-0", "default"), CellSpec::default()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        // 2 failures + 1 success.
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);

        handle.stop().await;
    }
}
