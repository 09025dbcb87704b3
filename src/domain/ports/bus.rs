//! Bus port - interface for the persistent pub/sub fabric.
//!
//! Subjects are dot-separated; a trailing `>` wildcard matches any suffix.
//! Durable subscriptions deliver with explicit acks: a message that is not
//! acked within the consumer's `ack_wait` is redelivered, so handlers must
//! be idempotent on envelope id.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::errors::BusError;
use crate::domain::models::Envelope;

/// A plain (best-effort) subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Envelope>) -> Self {
        Self { receiver }
    }

    /// Next envelope, or `None` once the bus side is closed.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

/// One delivery on a durable subscription.
pub struct Delivery {
    pub envelope: Envelope,
    /// True when this envelope was delivered before and not acked.
    pub redelivered: bool,
    acker: mpsc::Sender<Uuid>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: mpsc::Sender<Uuid>) -> Self {
        Self { envelope, redelivered, acker }
    }

    /// Acknowledge full processing. Without this the bus redelivers after
    /// `ack_wait`.
    pub async fn ack(self) {
        let _ = self.acker.send(self.envelope.id).await;
    }
}

/// A durable subscription with explicit acks.
pub struct DurableSubscription {
    receiver: mpsc::Receiver<Delivery>,
}

impl DurableSubscription {
    pub fn new(receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { receiver }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// The messaging fabric every cross-cell interaction flows through.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish fire-and-forget.
    async fn publish(&self, subject: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Publish and retain as the subject's last value (readable later via
    /// [`retained`](Self::retained)).
    async fn publish_retained(&self, subject: &str, envelope: &Envelope) -> Result<(), BusError>;

    /// Best-effort subscription (no persistence, no acks).
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Durable subscription named `durable_name` with explicit acks and the
    /// given redelivery window.
    async fn subscribe_durable(
        &self,
        subject: &str,
        durable_name: &str,
        ack_wait: Duration,
    ) -> Result<DurableSubscription, BusError>;

    /// Retained messages currently held for `subject`.
    async fn retained(&self, subject: &str) -> Result<Vec<Envelope>, BusError>;

    /// Number of published-but-unconsumed messages on `subject`.
    async fn queue_depth(&self, subject: &str) -> Result<u64, BusError>;

    /// Flush pending publishes and close subscriptions.
    async fn drain(&self) -> Result<(), BusError>;
}
