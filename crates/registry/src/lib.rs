//! Durable registry of monitored BMCs.
//!
//! One [`Service`] record per device. The service side (the registry daemon)
//! owns the durable store and publishes one event per record onto the event
//! queue on add and on `resend`; consumers (the ingest daemon) hold a
//! [`RegistryClient`] and treat the event queue as their source of truth.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use wirebus::{Bus, Subscription};

pub use store::{PgStore, ServiceStore};

pub const COMMAND_QUEUE: &str = "/authorization/command";
pub const EVENT_QUEUE: &str = "/authorization";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] wirebus::BusError),

    #[error("invalid registry payload: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("service {ip} rejected: {reason}")]
    InvalidService { ip: String, reason: String },
}

/// Kind of management endpoint a record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ServiceType {
    Unknown = 0,
    Msm = 1,
    Ec = 2,
    Idrac = 3,
}

impl From<ServiceType> for i32 {
    fn from(value: ServiceType) -> i32 {
        value as i32
    }
}

impl TryFrom<i32> for ServiceType {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Msm),
            2 => Ok(Self::Ec),
            3 => Ok(Self::Idrac),
            other => Err(format!("unknown service type code {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum AuthType {
    UsernamePassword = 1,
    XAuthToken = 2,
    BearerToken = 3,
}

impl From<AuthType> for i32 {
    fn from(value: AuthType) -> i32 {
        value as i32
    }
}

impl TryFrom<i32> for AuthType {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, String> {
        match value {
            1 => Ok(Self::UsernamePassword),
            2 => Ok(Self::XAuthToken),
            3 => Ok(Self::BearerToken),
            other => Err(format!("unknown auth type code {other}")),
        }
    }
}

impl AuthType {
    /// Credential keys a record of this type must carry.
    fn required_keys(self) -> &'static [&'static str] {
        match self {
            AuthType::UsernamePassword => &["username", "password"],
            AuthType::XAuthToken | AuthType::BearerToken => &["token"],
        }
    }
}

/// One registered BMC. `ip` is the primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "serviceType")]
    pub service_type: ServiceType,
    pub ip: String,
    #[serde(rename = "authType")]
    pub auth_type: AuthType,
    pub auth: HashMap<String, String>,
}

impl Service {
    /// Check the record invariants: non-empty ip and a credential map that
    /// matches the auth type.
    pub fn validate(&self) -> Result<()> {
        if self.ip.is_empty() {
            return Err(Error::InvalidService {
                ip: self.ip.clone(),
                reason: "empty ip".to_string(),
            });
        }
        for key in self.auth_type.required_keys() {
            if self.auth.get(*key).map(String::is_empty).unwrap_or(true) {
                return Err(Error::InvalidService {
                    ip: self.ip.clone(),
                    reason: format!("credential map missing {key}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Resend,
    AddService,
    DeleteService,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Service>,
}

/// Service half: publishes record events, consumes the command queue.
pub struct RegistryService {
    bus: Arc<dyn Bus>,
}

impl RegistryService {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    pub async fn send_service(&self, service: &Service) -> Result<()> {
        self.bus
            .publish(EVENT_QUEUE, &serde_json::to_vec(service)?)
            .await?;
        Ok(())
    }

    /// Consume the command queue forever, handing each decoded command to the
    /// caller. Malformed payloads are logged and skipped.
    pub async fn receive_commands(
        &self,
        commands: tokio::sync::mpsc::Sender<Command>,
    ) -> Result<()> {
        let mut sub = self.bus.subscribe(COMMAND_QUEUE).await?;
        while let Some(payload) = sub.recv().await {
            match serde_json::from_slice::<Command>(&payload) {
                Ok(command) => {
                    if commands.send(command).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "discarding malformed registry command"),
            }
        }
        Ok(())
    }
}

/// Client half, used by consumers of the record set.
#[derive(Clone)]
pub struct RegistryClient {
    bus: Arc<dyn Bus>,
}

impl RegistryClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        self.bus
            .publish(COMMAND_QUEUE, &serde_json::to_vec(command)?)
            .await?;
        Ok(())
    }

    /// Ask the registry daemon to re-publish every stored record.
    pub async fn resend_all(&self) -> Result<()> {
        self.send_command(&Command {
            command: CommandKind::Resend,
            service: None,
        })
        .await
    }

    pub async fn add_service(&self, service: Service) -> Result<()> {
        self.send_command(&Command {
            command: CommandKind::AddService,
            service: Some(service),
        })
        .await
    }

    pub async fn delete_service(&self, service: Service) -> Result<()> {
        self.send_command(&Command {
            command: CommandKind::DeleteService,
            service: Some(service),
        })
        .await
    }

    /// Open the stream of service events.
    pub async fn service_stream(&self) -> Result<ServiceStream> {
        let sub = self.bus.subscribe(EVENT_QUEUE).await?;
        Ok(ServiceStream { sub })
    }
}

pub struct ServiceStream {
    sub: Subscription,
}

impl ServiceStream {
    pub async fn recv(&mut self) -> Option<Service> {
        loop {
            let payload = self.sub.recv().await?;
            match serde_json::from_slice(&payload) {
                Ok(service) => return Some(service),
                Err(err) => warn!(error = %err, "discarding malformed service event"),
            }
        }
    }
}
