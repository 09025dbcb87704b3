//! In-process bus with durable-consumer semantics.
//!
//! Implements the [`Bus`] port the way the platform expects an external
//! messaging fabric to behave: per-subject publication order, named durable
//! consumers whose unacked deliveries are redelivered after `ack_wait`,
//! retained last-value messages, and a trailing-`>` subject wildcard.
//!
//! Queue depth reporting: subjects with a durable consumer report that
//! consumer's backlog plus unacked deliveries; subjects without one report
//! the count of publishes nobody received, which is what the swarm trigger
//! samples as backlog pressure.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::errors::BusError;
use crate::domain::models::Envelope;
use crate::domain::ports::{Bus, Delivery, DurableSubscription, Subscription};

/// Capacity of each subscription channel. A full channel makes the bus fall
/// back to the durable backlog (durable) or drop (best-effort).
const CHANNEL_CAPACITY: usize = 1024;

/// Retained messages kept per subject.
const RETAINED_LIMIT: usize = 100;

/// How often the sweeper scans for expired unacked deliveries.
const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

struct PlainSub {
    pattern: String,
    sender: mpsc::Sender<Envelope>,
}

struct PendingDelivery {
    envelope: Envelope,
    deadline: Instant,
}

struct DurableState {
    pattern: String,
    ack_wait: Duration,
    /// Published but not yet handed to an attached consumer, in order.
    backlog: VecDeque<Envelope>,
    /// Delivered, awaiting ack.
    pending: HashMap<Uuid, PendingDelivery>,
    /// Delivery channel of the currently attached consumer.
    sender: Option<mpsc::Sender<Delivery>>,
    /// Ack channel shared with outstanding deliveries.
    ack_tx: Option<mpsc::Sender<Uuid>>,
}

impl DurableState {
    fn depth(&self) -> u64 {
        (self.backlog.len() + self.pending.len()) as u64
    }
}

struct Inner {
    plain: Vec<PlainSub>,
    durables: HashMap<String, DurableState>,
    retained: HashMap<String, VecDeque<Envelope>>,
    /// Publishes that reached no subscriber, per subject.
    unreceived: HashMap<String, u64>,
    closed: bool,
}

/// In-process implementation of the [`Bus`] port.
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let bus = Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                plain: Vec::new(),
                durables: HashMap::new(),
                retained: HashMap::new(),
                unreceived: HashMap::new(),
                closed: false,
            })),
        });

        // Redelivery sweeper: expired unacked deliveries go back out (or to
        // backlog when the consumer is gone).
        let inner = Arc::clone(&bus.inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let mut guard = match inner.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                if guard.closed {
                    return;
                }
                Self::sweep(&mut guard);
            }
        });

        bus
    }

    fn sweep(inner: &mut Inner) {
        let now = Instant::now();
        for durable in inner.durables.values_mut() {
            let expired: Vec<Uuid> = durable
                .pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            for id in expired {
                let Some(pending) = durable.pending.remove(&id) else { continue };
                Self::deliver_durable(durable, pending.envelope, true);
            }

            // A consumer whose channel closed is detached; its messages wait
            // in the backlog for a reattach.
            if durable.sender.as_ref().is_some_and(mpsc::Sender::is_closed) {
                durable.sender = None;
                durable.ack_tx = None;
            }
        }
    }

    /// Hand one envelope to a durable consumer, tracking the ack deadline.
    /// Falls back to the backlog when no consumer is attached or its channel
    /// is saturated.
    fn deliver_durable(durable: &mut DurableState, envelope: Envelope, redelivered: bool) {
        let (sender, ack_tx) = match (durable.sender.clone(), durable.ack_tx.clone()) {
            (Some(sender), Some(ack_tx)) => (sender, ack_tx),
            _ => {
                if redelivered {
                    durable.backlog.push_front(envelope);
                } else {
                    durable.backlog.push_back(envelope);
                }
                return;
            }
        };

        let delivery = Delivery::new(envelope.clone(), redelivered, ack_tx);
        match sender.try_send(delivery) {
            Ok(()) => {
                durable.pending.insert(
                    envelope.id,
                    PendingDelivery { envelope, deadline: Instant::now() + durable.ack_wait },
                );
            }
            Err(_) => {
                if redelivered {
                    durable.backlog.push_front(envelope);
                } else {
                    durable.backlog.push_back(envelope);
                }
            }
        }
    }

    fn subject_matches(pattern: &str, subject: &str) -> bool {
        pattern.strip_suffix('>').map_or_else(
            || pattern == subject,
            |prefix| subject.starts_with(prefix),
        )
    }

    fn publish_inner(&self, subject: &str, envelope: &Envelope, retain: bool) -> Result<(), BusError> {
        if subject.is_empty() || subject.contains('>') {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }

        let mut inner = self.inner.lock().map_err(|_| BusError::Closed)?;
        if inner.closed {
            return Err(BusError::Closed);
        }

        if retain {
            let entry = inner.retained.entry(subject.to_string()).or_default();
            entry.push_back(envelope.clone());
            while entry.len() > RETAINED_LIMIT {
                entry.pop_front();
            }
        }

        let mut received = false;

        inner.plain.retain(|sub| !sub.sender.is_closed());
        for sub in &inner.plain {
            if Self::subject_matches(&sub.pattern, subject) {
                // Best-effort: a saturated subscriber just misses the message.
                if sub.sender.try_send(envelope.clone()).is_ok() {
                    received = true;
                }
            }
        }

        for durable in inner.durables.values_mut() {
            if Self::subject_matches(&durable.pattern, subject) {
                Self::deliver_durable(durable, envelope.clone(), false);
                received = true;
            }
        }

        if !received {
            *inner.unreceived.entry(subject.to_string()).or_insert(0) += 1;
        }

        Ok(())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, envelope: &Envelope) -> Result<(), BusError> {
        self.publish_inner(subject, envelope, false)
    }

    async fn publish_retained(&self, subject: &str, envelope: &Envelope) -> Result<(), BusError> {
        self.publish_inner(subject, envelope, true)
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().map_err(|_| BusError::Closed)?;
        if inner.closed {
            return Err(BusError::Closed);
        }
        inner.plain.push(PlainSub { pattern: subject.to_string(), sender: tx });
        Ok(Subscription::new(rx))
    }

    async fn subscribe_durable(
        &self,
        subject: &str,
        durable_name: &str,
        ack_wait: Duration,
    ) -> Result<DurableSubscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (ack_tx, mut ack_rx) = mpsc::channel::<Uuid>(CHANNEL_CAPACITY);

        {
            let mut inner = self.inner.lock().map_err(|_| BusError::Closed)?;
            if inner.closed {
                return Err(BusError::Closed);
            }

            let durable = inner
                .durables
                .entry(durable_name.to_string())
                .or_insert_with(|| DurableState {
                    pattern: subject.to_string(),
                    ack_wait,
                    backlog: VecDeque::new(),
                    pending: HashMap::new(),
                    sender: None,
                    ack_tx: None,
                });

            // Reattach: the new consumer takes over delivery.
            durable.pattern = subject.to_string();
            durable.ack_wait = ack_wait;
            durable.sender = Some(tx);
            durable.ack_tx = Some(ack_tx);

            // Flush the accumulated backlog to the fresh consumer in order.
            let backlog: Vec<Envelope> = durable.backlog.drain(..).collect();
            for envelope in backlog {
                Self::deliver_durable(durable, envelope, false);
            }
        }

        // Ack pump: remove acked deliveries from the pending set.
        let inner = Arc::clone(&self.inner);
        let name = durable_name.to_string();
        tokio::spawn(async move {
            while let Some(id) = ack_rx.recv().await {
                let Ok(mut guard) = inner.lock() else { return };
                if let Some(durable) = guard.durables.get_mut(&name) {
                    durable.pending.remove(&id);
                }
            }
        });

        Ok(DurableSubscription::new(rx))
    }

    async fn retained(&self, subject: &str) -> Result<Vec<Envelope>, BusError> {
        let inner = self.inner.lock().map_err(|_| BusError::Closed)?;
        Ok(inner
            .retained
            .get(subject)
            .map(|msgs| msgs.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn queue_depth(&self, subject: &str) -> Result<u64, BusError> {
        let inner = self.inner.lock().map_err(|_| BusError::Closed)?;

        let durable_depth = inner
            .durables
            .values()
            .filter(|d| Self::subject_matches(&d.pattern, subject))
            .map(DurableState::depth)
            .max();

        Ok(durable_depth.unwrap_or_else(|| inner.unreceived.get(subject).copied().unwrap_or(0)))
    }

    async fn drain(&self) -> Result<(), BusError> {
        let mut inner = self.inner.lock().map_err(|_| BusError::Closed)?;
        inner.closed = true;
        inner.plain.clear();
        for durable in inner.durables.values_mut() {
            durable.sender = None;
            durable.ack_tx = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::envelope;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("cell.default.a.inbox").await.unwrap();

        let env = Envelope::message("x", "a", "hi");
        bus.publish("cell.default.a.inbox", &env).await.unwrap();

        let got = sub.next().await.unwrap();
        assert_eq!(got.id, env.id);
        assert_eq!(got.content(), "hi");
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&envelope::all_events_subject()).await.unwrap();

        let env = Envelope::message("a", "events", "event");
        bus.publish("cell.events.default.a", &env).await.unwrap();
        assert!(sub.next().await.is_some());
    }

    #[tokio::test]
    async fn test_durable_backlog_survives_reattach() {
        let bus = MemoryBus::new();

        // Publish before any consumer exists for this durable.
        {
            let sub = bus
                .subscribe_durable("jobs", "jobs-worker", Duration::from_secs(10))
                .await
                .unwrap();
            drop(sub);
        }
        // Wait for the sweeper to notice the dropped consumer.
        tokio::time::sleep(Duration::from_millis(300)).await;

        bus.publish("jobs", &Envelope::message("x", "y", "one")).await.unwrap();
        bus.publish("jobs", &Envelope::message("x", "y", "two")).await.unwrap();

        let mut sub = bus
            .subscribe_durable("jobs", "jobs-worker", Duration::from_secs(10))
            .await
            .unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.envelope.content(), "one");
        first.ack().await;
        let second = sub.next().await.unwrap();
        assert_eq!(second.envelope.content(), "two");
        second.ack().await;
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered() {
        let bus = MemoryBus::new();
        let mut sub = bus
            .subscribe_durable("jobs", "jobs-worker", Duration::from_millis(250))
            .await
            .unwrap();

        let env = Envelope::message("x", "y", "retry-me");
        bus.publish("jobs", &env).await.unwrap();

        let first = sub.next().await.unwrap();
        assert!(!first.redelivered);
        drop(first); // no ack

        let second = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("redelivery within 2s")
            .unwrap();
        assert!(second.redelivered);
        assert_eq!(second.envelope.id, env.id);
        second.ack().await;
    }

    #[tokio::test]
    async fn test_retained_messages() {
        let bus = MemoryBus::new();
        let env = Envelope::message("ctl", "all", "topology-v1");
        bus.publish_retained("config.topology", &env).await.unwrap();

        let retained = bus.retained("config.topology").await.unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].content(), "topology-v1");
        assert!(bus.retained("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_depth_counts_unconsumed() {
        let bus = MemoryBus::new();
        for _ in 0..3 {
            bus.publish("work.items", &Envelope::message("a", "b", "job")).await.unwrap();
        }
        assert_eq!(bus.queue_depth("work.items").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards() {
        let bus = MemoryBus::new();
        let env = Envelope::message("a", "b", "x");
        assert!(bus.publish("cell.>", &env).await.is_err());
    }

    #[tokio::test]
    async fn test_drain_closes_bus() {
        let bus = MemoryBus::new();
        bus.drain().await.unwrap();
        let env = Envelope::message("a", "b", "x");
        assert!(matches!(bus.publish("s", &env).await, Err(BusError::Closed)));
    }
}
