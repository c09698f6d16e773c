//! Shared daemon bootstrap: environment settings, broker dial with retry,
//! minimum-configuration gating, and the outbound TLS client every HTTP pump
//! uses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use wirebus::{Bus, MqttBus};

use crate::config::ConfigMap;

/// Dial retry cadence for pumps (broker and sink alike).
pub const PUMP_RETRY: Duration = Duration::from_secs(60);

/// How long a pump waits between minimum-configuration checks.
pub const CONFIG_POLL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
struct RawBusSettings {
    #[serde(default = "default_bus_host")]
    messagebus_host: String,
    #[serde(default = "default_bus_port")]
    messagebus_port: u16,
}

fn default_bus_host() -> String {
    "activemq".to_string()
}

const fn default_bus_port() -> u16 {
    1883
}

impl BusSettings {
    pub fn from_env() -> Result<Self> {
        let raw: RawBusSettings =
            envy::from_env().context("failed to parse MESSAGEBUS_* environment variables")?;
        Ok(Self {
            host: raw.messagebus_host,
            port: raw.messagebus_port,
        })
    }
}

/// Dial the broker, retrying forever with the given cadence. Dial failures
/// are never fatal for a pump; the broker usually just is not up yet.
pub async fn connect_bus(settings: &BusSettings, client_id: &str, retry: Duration) -> Arc<dyn Bus> {
    loop {
        match MqttBus::connect(&settings.host, settings.port, client_id).await {
            Ok(bus) => {
                info!(host = %settings.host, port = settings.port, "connected to message bus");
                return Arc::new(bus);
            }
            Err(err) => {
                warn!(host = %settings.host, port = settings.port, error = %err, "could not connect to message bus, retrying");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// Block until every named config key holds a non-empty value. This is how a
/// pump waits for its minimum configuration; being unconfigured is never
/// fatal.
pub async fn wait_for_required(map: &ConfigMap, keys: &[&str]) {
    loop {
        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|key| map.value(key).is_empty())
            .collect();
        if missing.is_empty() {
            info!("minimum configuration available, continuing");
            return;
        }
        info!(?missing, "waiting for minimum configuration");
        tokio::time::sleep(CONFIG_POLL).await;
    }
}

/// Sink-side TLS material.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// PEM file with the sink's root CA. TLS verification stays off until a
    /// CA is configured (internal-collector assumption).
    pub ca_file: String,
    pub client_cert: String,
    pub client_key: String,
    pub skip_verify: bool,
}

/// Build the outbound HTTP client a pump delivers with.
pub fn outbound_client(tls: &TlsSettings, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if tls.ca_file.is_empty() {
        builder = builder.danger_accept_invalid_certs(true);
    } else {
        let ca = std::fs::read(&tls.ca_file)
            .with_context(|| format!("failed to read CA file {}", tls.ca_file))?;
        builder = builder.add_root_certificate(
            reqwest::Certificate::from_pem(&ca).context("failed to parse CA file")?,
        );
        if tls.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        match (tls.client_cert.is_empty(), tls.client_key.is_empty()) {
            (true, true) => {}
            (false, false) => {
                let mut pem = std::fs::read(&tls.client_cert)
                    .with_context(|| format!("failed to read client cert {}", tls.client_cert))?;
                pem.extend(
                    std::fs::read(&tls.client_key)
                        .with_context(|| format!("failed to read client key {}", tls.client_key))?,
                );
                builder = builder
                    .identity(reqwest::Identity::from_pem(&pem).context("invalid client pair")?);
            }
            _ => anyhow::bail!("client cert and key must both be set (or neither)"),
        }
    }

    builder.build().context("failed to build outbound client")
}

/// A unique response queue for one client instance.
pub fn reply_queue(prefix: &str) -> String {
    format!("{prefix}/{}", uuid::Uuid::new_v4())
}
