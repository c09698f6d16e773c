//! Per-pump configuration surface on the bus.
//!
//! Each pump owns a whitelist of named entries with defaults. The admin
//! surface drives them with `getprops | get | set | reset` commands on the
//! pump's config queue, passing a response queue with every command. One RW
//! lock serialises setters against readers inside the pump loop.
//!
//! Entries flagged as certificates do not store their payload in memory: the
//! PEM body is written under the mounted certificate directory and the file
//! name becomes the stored value, so pumps can reload the material from disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use wirebus::Bus;

use crate::{Error, Result};

/// Default mount point for certificate material supplied through `set`.
pub const DEFAULT_CERT_DIR: &str = "/extrabin/certs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Plain,
    /// `set` writes the payload to the cert directory and records the file
    /// name as the value.
    Certificate,
}

#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub default: String,
    pub kind: EntryKind,
}

impl ConfigEntry {
    pub fn plain(default: &str) -> Self {
        Self {
            default: default.to_string(),
            kind: EntryKind::Plain,
        }
    }

    pub fn certificate() -> Self {
        Self {
            default: String::new(),
            kind: EntryKind::Certificate,
        }
    }
}

/// The shared name/value map behind a pump's config surface.
#[derive(Clone)]
pub struct ConfigMap {
    entries: Arc<HashMap<String, ConfigEntry>>,
    values: Arc<RwLock<HashMap<String, String>>>,
    cert_dir: PathBuf,
}

impl ConfigMap {
    pub fn new(entries: HashMap<String, ConfigEntry>) -> Self {
        let cert_dir = std::env::var("CERT_DIR").unwrap_or_else(|_| DEFAULT_CERT_DIR.to_string());
        Self::with_cert_dir(entries, cert_dir.into())
    }

    pub fn with_cert_dir(entries: HashMap<String, ConfigEntry>, cert_dir: PathBuf) -> Self {
        let values = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.default.clone()))
            .collect();
        Self {
            entries: Arc::new(entries),
            values: Arc::new(RwLock::new(values)),
            cert_dir,
        }
    }

    fn entry(&self, name: &str) -> Result<&ConfigEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Result<String> {
        self.entry(name)?;
        Ok(self
            .values
            .read()
            .expect("config lock")
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    /// The value for pump-loop reads: empty string when unset.
    pub fn value(&self, name: &str) -> String {
        self.get(name).unwrap_or_default()
    }

    /// Set a property; returns the stored value (the file name for
    /// certificate entries).
    pub fn set(&self, name: &str, value: &str) -> Result<String> {
        let stored = match self.entry(name)?.kind {
            EntryKind::Plain => value.to_string(),
            EntryKind::Certificate => {
                let file_name = format!("{name}.pem");
                let path = self.cert_dir.join(&file_name);
                std::fs::create_dir_all(&self.cert_dir).map_err(|source| Error::CertWrite {
                    name: name.to_string(),
                    source,
                })?;
                std::fs::write(&path, value).map_err(|source| Error::CertWrite {
                    name: name.to_string(),
                    source,
                })?;
                file_name
            }
        };
        self.values
            .write()
            .expect("config lock")
            .insert(name.to_string(), stored.clone());
        Ok(stored)
    }

    pub fn reset(&self, name: &str) -> Result<String> {
        let default = self.entry(name)?.default.clone();
        self.values
            .write()
            .expect("config lock")
            .insert(name.to_string(), default.clone());
        Ok(default)
    }

    /// Absolute path of a certificate entry's file, empty when unset.
    pub fn cert_path(&self, name: &str) -> String {
        let file_name = self.value(name);
        if file_name.is_empty() {
            return String::new();
        }
        self.cert_dir.join(file_name).to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigVerb {
    GetProps,
    Get,
    Set,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCommand {
    pub command: ConfigVerb,
    #[serde(default)]
    pub response_queue: String,
    #[serde(default)]
    pub property: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigReply {
    pub command: ConfigVerb,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
}

/// Service half: drives a [`ConfigMap`] from the pump's config queue.
pub struct ConfigService {
    bus: Arc<dyn Bus>,
    command_queue: String,
    map: ConfigMap,
}

impl ConfigService {
    pub fn new(bus: Arc<dyn Bus>, command_queue: &str, map: ConfigMap) -> Self {
        Self {
            bus,
            command_queue: command_queue.to_string(),
            map,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let mut sub = self.bus.subscribe(&self.command_queue).await?;
        while let Some(payload) = sub.recv().await {
            let command: ConfigCommand = match serde_json::from_slice(&payload) {
                Ok(command) => command,
                Err(err) => {
                    warn!(queue = %self.command_queue, error = %err, "discarding malformed config command");
                    continue;
                }
            };
            let reply = self.handle(&command);
            if let Err(err) = self
                .bus
                .publish(&command.response_queue, &serde_json::to_vec(&reply)?)
                .await
            {
                warn!(queue = %command.response_queue, error = %err, "failed to send config reply");
            }
        }
        Ok(())
    }

    fn handle(&self, command: &ConfigCommand) -> ConfigReply {
        let mut reply = ConfigReply {
            command: command.command,
            property: command.property.clone(),
            value: None,
            error: None,
            properties: None,
        };
        let outcome = match command.command {
            ConfigVerb::GetProps => {
                reply.properties = Some(self.map.names());
                return reply;
            }
            ConfigVerb::Get => self.map.get(&command.property),
            ConfigVerb::Set => self
                .map
                .set(&command.property, command.value.as_deref().unwrap_or("")),
            ConfigVerb::Reset => self.map.reset(&command.property),
        };
        match outcome {
            Ok(value) => reply.value = Some(value),
            Err(err) => reply.error = Some(err.to_string()),
        }
        reply
    }
}

/// Client half, used by the admin surface.
pub struct ConfigClient {
    bus: Arc<dyn Bus>,
    command_queue: String,
    response_queue: String,
}

impl ConfigClient {
    pub fn new(bus: Arc<dyn Bus>, command_queue: &str, response_queue: &str) -> Self {
        Self {
            bus,
            command_queue: command_queue.to_string(),
            response_queue: response_queue.to_string(),
        }
    }

    async fn round_trip(&self, command: ConfigCommand) -> Result<ConfigReply> {
        let mut sub = self.bus.subscribe(&self.response_queue).await?;
        self.bus
            .publish(&self.command_queue, &serde_json::to_vec(&command)?)
            .await?;
        let payload = sub.recv().await.ok_or(Error::StreamClosed)?;
        Ok(serde_json::from_slice(&payload)?)
    }

    pub async fn properties(&self) -> Result<Vec<String>> {
        let reply = self
            .round_trip(ConfigCommand {
                command: ConfigVerb::GetProps,
                response_queue: self.response_queue.clone(),
                property: String::new(),
                value: None,
            })
            .await?;
        Ok(reply.properties.unwrap_or_default())
    }

    pub async fn get(&self, name: &str) -> Result<ConfigReply> {
        self.round_trip(ConfigCommand {
            command: ConfigVerb::Get,
            response_queue: self.response_queue.clone(),
            property: name.to_string(),
            value: None,
        })
        .await
    }

    pub async fn set(&self, name: &str, value: &str) -> Result<ConfigReply> {
        self.round_trip(ConfigCommand {
            command: ConfigVerb::Set,
            response_queue: self.response_queue.clone(),
            property: name.to_string(),
            value: Some(value.to_string()),
        })
        .await
    }

    pub async fn reset(&self, name: &str) -> Result<ConfigReply> {
        self.round_trip(ConfigCommand {
            command: ConfigVerb::Reset,
            response_queue: self.response_queue.clone(),
            property: name.to_string(),
            value: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirebus::MemoryBus;

    fn entries() -> HashMap<String, ConfigEntry> {
        HashMap::from([
            ("collectorUrl".to_string(), ConfigEntry::plain("")),
            ("topic".to_string(), ConfigEntry::plain("metrics")),
            ("caCert".to_string(), ConfigEntry::certificate()),
        ])
    }

    fn map_in(dir: &std::path::Path) -> ConfigMap {
        ConfigMap::with_cert_dir(entries(), dir.to_path_buf())
    }

    #[test]
    fn set_then_get_echoes_and_reset_restores_default() {
        let map = map_in(std::path::Path::new("/tmp/unused"));
        assert_eq!(map.get("topic").unwrap(), "metrics");
        map.set("topic", "telemetry").unwrap();
        assert_eq!(map.get("topic").unwrap(), "telemetry");
        assert_eq!(map.reset("topic").unwrap(), "metrics");
        assert_eq!(map.get("topic").unwrap(), "metrics");
    }

    #[test]
    fn unknown_properties_error_without_state_change() {
        let map = map_in(std::path::Path::new("/tmp/unused"));
        assert!(matches!(
            map.set("bogus", "x").unwrap_err(),
            Error::UnknownProperty(_)
        ));
        assert!(map.get("bogus").is_err());
        assert_eq!(map.names(), vec!["caCert", "collectorUrl", "topic"]);
    }

    #[test]
    fn certificate_sets_write_files_and_store_the_name() {
        let dir = std::env::temp_dir().join(format!("pumpkit-certs-{}", std::process::id()));
        let map = map_in(&dir);
        let stored = map.set("caCert", "-----BEGIN CERTIFICATE-----").unwrap();
        assert_eq!(stored, "caCert.pem");
        let on_disk = std::fs::read_to_string(dir.join("caCert.pem")).unwrap();
        assert_eq!(on_disk, "-----BEGIN CERTIFICATE-----");
        assert!(map.cert_path("caCert").ends_with("caCert.pem"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn the_four_verbs_round_trip_over_the_bus() {
        let bus: Arc<dyn Bus> = Arc::new(MemoryBus::new());
        let map = map_in(std::path::Path::new("/tmp/unused"));
        let service = ConfigService::new(Arc::clone(&bus), "/otelpump/config", map);
        tokio::spawn(async move { service.run().await });

        let client = ConfigClient::new(Arc::clone(&bus), "/otelpump/config", "/replies/test");

        // re-ask until the service task is live on its command queue
        let mut props = loop {
            let reply = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                client.properties(),
            )
            .await;
            if let Ok(Ok(props)) = reply {
                break props;
            }
        };
        props.sort();
        assert_eq!(props, vec!["caCert", "collectorUrl", "topic"]);

        let reply = client.set("collectorUrl", "http://otel:4318").await.unwrap();
        assert_eq!(reply.value.as_deref(), Some("http://otel:4318"));
        assert!(reply.error.is_none());

        let reply = client.get("collectorUrl").await.unwrap();
        assert_eq!(reply.value.as_deref(), Some("http://otel:4318"));

        let reply = client.get("nonsense").await.unwrap();
        assert!(reply.error.unwrap().contains("unknown property"));

        let reply = client.reset("collectorUrl").await.unwrap();
        assert_eq!(reply.value.as_deref(), Some(""));
    }
}
