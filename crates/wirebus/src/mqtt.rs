//! MQTT transport, the reference broker transport.
//!
//! Destinations are used verbatim as topic strings; the broker side of the
//! deployment is any MQTT 3.1.1 listener (ActiveMQ exposes one alongside its
//! other protocols, so the broker container is unchanged).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{Bus, BusError, Result, Subscription, SUBSCRIBER_QUEUE};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_PACKET_SIZE: usize = 1024 * 1024;

type Routes = Arc<Mutex<HashMap<String, Vec<(u64, mpsc::Sender<Vec<u8>>)>>>>;

pub struct MqttBus {
    client: AsyncClient,
    routes: Routes,
    next_id: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Dial the broker and wait for the session acknowledgement.
    ///
    /// Fails if the broker does not acknowledge within a short deadline, so
    /// callers can drive their own retry policy.
    pub async fn connect(host: &str, port: u16, client_id: &str) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, eventloop.poll())
                .await
                .map_err(|_| {
                    BusError::Connect(format!("timed out connecting to {host}:{port}"))
                })?
                .map_err(|err| BusError::Connect(err.to_string()))?;
            if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                break;
            }
        }

        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&routes)));

        Ok(Self {
            client,
            routes,
            next_id: AtomicU64::new(0),
            driver: Mutex::new(Some(driver)),
        })
    }
}

/// Pump the event loop forever, routing inbound publishes to subscribers.
/// Poll errors are retried after a short sleep; the client reconnects and
/// re-establishes the session underneath us.
async fn drive(mut eventloop: EventLoop, routes: Routes) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let senders: Vec<(u64, mpsc::Sender<Vec<u8>>)> = routes
                    .lock()
                    .expect("mqtt routes lock")
                    .get(publish.topic.as_str())
                    .cloned()
                    .unwrap_or_default();

                let mut stale = Vec::new();
                for (id, tx) in &senders {
                    if tx.send(publish.payload.to_vec()).await.is_err() {
                        stale.push(*id);
                    }
                }
                if !stale.is_empty() {
                    let mut map = routes.lock().expect("mqtt routes lock");
                    if let Some(list) = map.get_mut(publish.topic.as_str()) {
                        list.retain(|(id, _)| !stale.contains(id));
                    }
                }
            }
            Ok(event) => {
                debug!(?event, "mqtt event");
            }
            Err(err) => {
                warn!(error = %err, "mqtt event loop error, retrying");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Bus for MqttBus {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<()> {
        self.client
            .publish(destination, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    async fn subscribe(&self, destination: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes
            .lock()
            .expect("mqtt routes lock")
            .entry(destination.to_string())
            .or_default()
            .push((id, tx));

        self.client
            .subscribe(destination, QoS::AtLeastOnce)
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let routes = Arc::clone(&self.routes);
        let client = self.client.clone();
        let dest = destination.to_string();
        let unsubscribe = Box::new(move || {
            let mut drained = false;
            if let Ok(mut map) = routes.lock() {
                if let Some(list) = map.get_mut(&dest) {
                    list.retain(|(sid, _)| *sid != id);
                    drained = list.is_empty();
                }
                if drained {
                    map.remove(&dest);
                }
            }
            if drained {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = client.unsubscribe(dest).await;
                    });
                }
            }
        });

        Ok(Subscription::queue(rx, unsubscribe))
    }

    async fn close(&self) -> Result<()> {
        if let Some(driver) = self.driver.lock().expect("mqtt driver lock").take() {
            driver.abort();
        }
        self.client
            .disconnect()
            .await
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}
