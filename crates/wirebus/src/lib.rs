//! Destination-addressed pub/sub over a pluggable transport.
//!
//! Every service in the pipeline talks to its peers through a [`Bus`]:
//! producers publish opaque payloads to a destination string
//! (`/databus`, `/authorization`, `/otel`, ...) and consumers subscribe to
//! the same string. Delivery is at-least-once per destination with strict
//! per-subscriber arrival order and no ordering across destinations.
//!
//! Three transports exist: [`mqtt::MqttBus`] is the reference broker
//! transport, [`kafka::KafkaBus`] is the outbound-only transport used by the
//! Kafka pump, and [`memory::MemoryBus`] is a process-local transport for
//! tests.

pub mod kafka;
pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

pub use kafka::{KafkaBus, KafkaTlsConfig};
pub use memory::MemoryBus;
pub use mqtt::MqttBus;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("subscribe is not supported on this transport")]
    SubscribeUnsupported,
}

/// A destination-addressed message bus.
///
/// `publish` fails only on transport errors and never blocks on a slow
/// subscriber beyond the transport send itself.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<()>;

    /// Open a lazy, unbounded stream of payloads for `destination`.
    async fn subscribe(&self, destination: &str) -> Result<Subscription>;

    /// Tear down all subscriptions and the transport.
    async fn close(&self) -> Result<()>;
}

/// Depth of each subscriber queue. Fan-out backpressure is applied per
/// subscriber once this many payloads are waiting.
pub const SUBSCRIBER_QUEUE: usize = 10;

enum Inner {
    Queue(mpsc::Receiver<Vec<u8>>),
    Fanout(broadcast::Receiver<Vec<u8>>),
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// One live subscription. Dropping it (or calling [`Subscription::close`])
/// unsubscribes from the destination.
pub struct Subscription {
    inner: Inner,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    fn new(inner: Inner, unsubscribe: Option<Unsubscribe>) -> Self {
        Self { inner, unsubscribe }
    }

    pub(crate) fn queue(rx: mpsc::Receiver<Vec<u8>>, unsubscribe: Unsubscribe) -> Self {
        Self::new(Inner::Queue(rx), Some(unsubscribe))
    }

    pub(crate) fn fanout(rx: broadcast::Receiver<Vec<u8>>) -> Self {
        Self::new(Inner::Fanout(rx), None)
    }

    /// Next payload, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match &mut self.inner {
            Inner::Queue(rx) => rx.recv().await,
            Inner::Fanout(rx) => loop {
                match rx.recv().await {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagged behind, payloads dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    pub fn close(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}
