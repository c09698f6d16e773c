//! Process-local transport for tests: one broadcast channel per destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Bus, Result, Subscription};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, destination: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .expect("memory bus lock")
            .entry(destination.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<()> {
        // A send with no live subscribers is not an error: the payload is
        // simply dropped, matching broker semantics for an empty destination.
        let _ = self.sender(destination).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription> {
        Ok(Subscription::fanout(self.sender(destination).subscribe()))
    }

    async fn close(&self) -> Result<()> {
        self.topics.lock().expect("memory bus lock").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_receives_every_publish_in_order() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("/groups").await.unwrap();
        let mut second = bus.subscribe("/groups").await.unwrap();

        bus.publish("/groups", b"one").await.unwrap();
        bus.publish("/groups", b"two").await.unwrap();

        assert_eq!(first.recv().await.unwrap(), b"one");
        assert_eq!(first.recv().await.unwrap(), b"two");
        assert_eq!(second.recv().await.unwrap(), b"one");
        assert_eq!(second.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn destinations_are_isolated() {
        let bus = MemoryBus::new();
        let mut groups = bus.subscribe("/groups").await.unwrap();
        bus.publish("/other", b"elsewhere").await.unwrap();
        bus.publish("/groups", b"here").await.unwrap();
        assert_eq!(groups.recv().await.unwrap(), b"here");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = MemoryBus::new();
        bus.publish("/nobody", b"dropped").await.unwrap();
    }
}
