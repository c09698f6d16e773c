//! The telemetry bus: command surface and group fan-out.
//!
//! The ingest daemon runs a [`TelemetryBusService`]; pumps and the admin
//! surface talk to it through a [`TelemetryBusClient`]. Commands arrive on
//! the shared `/databus` queue, responses go to whatever queue the caller
//! named in its command.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use wirebus::{Bus, Subscription};

use crate::model::{DataGroup, DataProducer};
use crate::{Error, Result};

/// Queue the service listens for commands on.
pub const COMMAND_QUEUE: &str = "/databus";

/// The downstream topic tree. Every device monitor publishes every parsed
/// group to each topic with a registered receiver.
pub mod topics {
    pub const INFLUX: &str = "/influx";
    pub const KAFKA: &str = "/kafka";
    pub const OTEL: &str = "/otel";
    pub const SPLUNK: &str = "/splunk";
    pub const PROMETHEUS: &str = "/prometheus";
    pub const ELKSTACK: &str = "/elkstack";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Get,
    Subscribe,
    GetProducers,
    DeleteProducer,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    #[serde(default)]
    pub receive_queue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub command: CommandKind,
    pub data_type: String,
    pub data: Value,
}

/// Service half: owns the registered receiver list and fans groups out.
pub struct TelemetryBusService {
    bus: Arc<dyn Bus>,
    receivers: Mutex<Vec<String>>,
}

impl TelemetryBusService {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            receivers: Mutex::new(Vec::new()),
        }
    }

    pub fn receivers(&self) -> Vec<String> {
        self.receivers.lock().expect("receivers lock").clone()
    }

    /// Serialise the group once and publish it to every registered receiver.
    /// Order is strict per receiver, unspecified across receivers.
    pub async fn send_group(&self, group: &DataGroup) {
        let Ok(payload) = self.encode(CommandKind::Subscribe, "DataGroup", group) else {
            return;
        };
        for queue in self.receivers() {
            if let Err(err) = self.bus.publish(&queue, &payload).await {
                warn!(%queue, error = %err, "failed to fan out group");
            }
        }
    }

    /// Reply a single group to an explicit queue (snapshot `get`).
    pub async fn send_group_to(&self, group: &DataGroup, queue: &str) -> Result<()> {
        let payload = self.encode(CommandKind::Get, "DataGroup", group)?;
        self.bus.publish(queue, &payload).await?;
        Ok(())
    }

    pub async fn send_producers_to(&self, producers: &[DataProducer], queue: &str) -> Result<()> {
        let payload = self.encode(CommandKind::GetProducers, "DataProducer", &producers)?;
        self.bus.publish(queue, &payload).await?;
        Ok(())
    }

    /// Consume `/databus` forever, registering `subscribe` receivers in place
    /// and handing every other command to the caller.
    pub async fn receive_commands(&self, commands: mpsc::Sender<Command>) -> Result<()> {
        let mut sub = self.bus.subscribe(COMMAND_QUEUE).await?;
        while let Some(payload) = sub.recv().await {
            let command: Command = match serde_json::from_slice(&payload) {
                Ok(command) => command,
                Err(err) => {
                    warn!(error = %err, "discarding malformed bus command");
                    continue;
                }
            };
            if command.command == CommandKind::Subscribe {
                let mut receivers = self.receivers.lock().expect("receivers lock");
                if !receivers.contains(&command.receive_queue) {
                    receivers.push(command.receive_queue.clone());
                }
                continue;
            }
            if commands.send(command).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    fn encode<T: Serialize>(
        &self,
        command: CommandKind,
        data_type: &str,
        data: &T,
    ) -> Result<Vec<u8>> {
        let response = Response {
            command,
            data_type: data_type.to_string(),
            data: serde_json::to_value(data)?,
        };
        Ok(serde_json::to_vec(&response)?)
    }
}

/// Client half, used by every pump.
#[derive(Clone)]
pub struct TelemetryBusClient {
    bus: Arc<dyn Bus>,
}

impl TelemetryBusClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        self.bus
            .publish(COMMAND_QUEUE, &serde_json::to_vec(command)?)
            .await?;
        Ok(())
    }

    /// Register `queue` for the group fan-out.
    pub async fn subscribe(&self, queue: &str) -> Result<()> {
        self.send_command(&Command {
            command: CommandKind::Subscribe,
            receive_queue: queue.to_string(),
            service_ip: String::new(),
        })
        .await
    }

    /// Ask for a replay of the snapshot cache onto `queue`.
    pub async fn get(&self, queue: &str) -> Result<()> {
        self.send_command(&Command {
            command: CommandKind::Get,
            receive_queue: queue.to_string(),
            service_ip: String::new(),
        })
        .await
    }

    pub async fn delete_producer(&self, queue: &str, service_ip: &str) -> Result<()> {
        self.send_command(&Command {
            command: CommandKind::DeleteProducer,
            receive_queue: queue.to_string(),
            service_ip: service_ip.to_string(),
        })
        .await
    }

    /// Open the stream of groups arriving on `queue`.
    pub async fn group_stream(&self, queue: &str) -> Result<GroupStream> {
        let sub = self.bus.subscribe(queue).await?;
        Ok(GroupStream { sub })
    }

    /// One-shot producer listing.
    pub async fn get_producers(&self, queue: &str) -> Result<Vec<DataProducer>> {
        let mut sub = self.bus.subscribe(queue).await?;
        self.send_command(&Command {
            command: CommandKind::GetProducers,
            receive_queue: queue.to_string(),
            service_ip: String::new(),
        })
        .await?;
        let payload = sub.recv().await.ok_or(Error::StreamClosed)?;
        let response: Response = serde_json::from_slice(&payload)?;
        Ok(serde_json::from_value(response.data)?)
    }
}

/// Stream of decoded groups; malformed payloads are logged and skipped.
pub struct GroupStream {
    sub: Subscription,
}

impl GroupStream {
    pub async fn recv(&mut self) -> Option<DataGroup> {
        loop {
            let payload = self.sub.recv().await?;
            match serde_json::from_slice::<Response>(&payload)
                .and_then(|response| serde_json::from_value(response.data))
            {
                Ok(group) => return Some(group),
                Err(err) => warn!(error = %err, "discarding malformed group payload"),
            }
        }
    }

    pub fn close(self) {
        self.sub.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataValue;
    use wirebus::MemoryBus;

    fn group(id: &str) -> DataGroup {
        DataGroup {
            id: id.to_string(),
            system_id: "7GHX123".to_string(),
            values: vec![DataValue {
                id: "TemperatureReading".to_string(),
                value: "42".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn subscribe_registers_receiver_and_groups_fan_out() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let service = Arc::new(TelemetryBusService::new(Arc::clone(&bus)));
        let client = TelemetryBusClient::new(Arc::clone(&bus));

        let (tx, _rx) = mpsc::channel(4);
        let commands = Arc::clone(&service);
        tokio::spawn(async move { commands.receive_commands(tx).await });

        let mut stream = client.group_stream(topics::OTEL).await.unwrap();

        // re-send until the service task has picked the registration up
        for _ in 0..50 {
            client.subscribe(topics::OTEL).await.unwrap();
            if !service.receivers().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(service.receivers(), vec![topics::OTEL.to_string()]);

        service.send_group(&group("NICStatistics")).await;
        let received = stream.recv().await.unwrap();
        assert_eq!(received.id, "NICStatistics");
        assert_eq!(received.values.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_subscribes_register_once() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let service = Arc::new(TelemetryBusService::new(Arc::clone(&bus)));
        let client = TelemetryBusClient::new(Arc::clone(&bus));

        let (tx, _rx) = mpsc::channel(4);
        let commands = Arc::clone(&service);
        tokio::spawn(async move { commands.receive_commands(tx).await });

        for _ in 0..50 {
            client.subscribe(topics::INFLUX).await.unwrap();
            client.subscribe(topics::INFLUX).await.unwrap();
            if !service.receivers().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(service.receivers().len(), 1);
    }

    #[tokio::test]
    async fn non_subscribe_commands_reach_the_caller() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let service = Arc::new(TelemetryBusService::new(Arc::clone(&bus)));
        let client = TelemetryBusClient::new(Arc::clone(&bus));

        let (tx, mut rx) = mpsc::channel(4);
        let commands = Arc::clone(&service);
        tokio::spawn(async move { commands.receive_commands(tx).await });

        // re-send until the service task is live on the command queue
        let command = loop {
            client
                .delete_producer("/replies/ui", "10.35.0.12")
                .await
                .unwrap();
            let received =
                tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
            if let Ok(Some(command)) = received {
                break command;
            }
        };
        assert_eq!(command.command, CommandKind::DeleteProducer);
        assert_eq!(command.service_ip, "10.35.0.12");
    }

    #[test]
    fn command_kinds_use_wire_spellings() {
        let json = serde_json::to_string(&CommandKind::GetProducers).unwrap();
        assert_eq!(json, "\"getproducers\"");
        let json = serde_json::to_string(&CommandKind::DeleteProducer).unwrap();
        assert_eq!(json, "\"deleteproducer\"");
    }
}
