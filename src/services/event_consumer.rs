//! Event consumer.
//!
//! Subscribes to every cell's events subject and persists the structured
//! records into `cell_events`, batching writes behind a small buffer with a
//! periodic flush.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::adapters::sqlite::CellEventRepo;
use crate::domain::models::envelope::all_events_subject;
use crate::domain::models::CellEvent;
use crate::domain::ports::Bus;

const BUFFER_SIZE: usize = 32;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

pub struct EventConsumer {
    bus: Arc<dyn Bus>,
    repo: CellEventRepo,
}

pub struct EventConsumerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EventConsumerHandle {
    /// Stop consuming; buffered events are flushed before returning.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

impl EventConsumer {
    pub fn new(bus: Arc<dyn Bus>, repo: CellEventRepo) -> Self {
        Self { bus, repo }
    }

    pub async fn start(self) -> Result<EventConsumerHandle, crate::domain::errors::BusError> {
        let mut subscription = self.bus.subscribe(&all_events_subject()).await?;
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let repo = self.repo;
        let task = tokio::spawn(async move {
            let mut buffer: Vec<CellEvent> = Vec::with_capacity(BUFFER_SIZE);
            let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    biased;

                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            Self::flush(&repo, &mut buffer).await;
                            return;
                        }
                    }

                    envelope = subscription.next() => {
                        let Some(envelope) = envelope else {
                            Self::flush(&repo, &mut buffer).await;
                            return;
                        };
                        match serde_json::from_value::<CellEvent>(envelope.payload.clone()) {
                            Ok(event) => {
                                buffer.push(event);
                                if buffer.len() >= BUFFER_SIZE {
                                    Self::flush(&repo, &mut buffer).await;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, from = %envelope.from, "unparseable event record dropped");
                            }
                        }
                    }

                    _ = flush_tick.tick() => {
                        Self::flush(&repo, &mut buffer).await;
                    }
                }
            }
        });

        Ok(EventConsumerHandle { stop: stop_tx, task })
    }

    async fn flush(repo: &CellEventRepo, buffer: &mut Vec<CellEvent>) {
        if buffer.is_empty() {
            return;
        }
        match repo.insert_batch(buffer).await {
            Ok(count) => tracing::debug!(count, "cell events persisted"),
            Err(err) => tracing::error!(error = %err, "failed to persist cell events"),
        }
        buffer.clear();
    }
}
