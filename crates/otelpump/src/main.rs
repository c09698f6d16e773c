//! OTLP egress pump.
//!
//! Subscribes to the `/otel` topic, converts metric groups to
//! `ResourceMetrics` and alert groups to `ResourceLogs` through the YAML
//! mapping manifest, and POSTs protobuf to the collector.

mod convert;
mod export;
mod mapping;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use pumpkit::{BusSettings, ConfigEntry, ConfigMap, ConfigService, EntryKind, TlsSettings};
use telebus::{topics, TelemetryBusClient};

use crate::export::HttpExporter;
use crate::mapping::MappingTable;

const CONFIG_QUEUE: &str = "/otelpump/config";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    otel_collector: String,
    #[serde(default)]
    otel_cacert: String,
    #[serde(default)]
    otel_client_cert: String,
    #[serde(default)]
    otel_client_key: String,
    #[serde(default)]
    otel_skip_verify: String,
    #[serde(default = "default_mapping_path")]
    otel_mapping: String,
}

fn default_mapping_path() -> String {
    "/extrabin/redfish-otel.yaml".to_string()
}

fn config_entries(raw: &RawSettings) -> HashMap<String, ConfigEntry> {
    HashMap::from([
        (
            "otelCollector".to_string(),
            ConfigEntry::plain(&raw.otel_collector),
        ),
        (
            "otelCACert".to_string(),
            ConfigEntry {
                default: raw.otel_cacert.clone(),
                kind: EntryKind::Certificate,
            },
        ),
        (
            "otelClientCert".to_string(),
            ConfigEntry {
                default: raw.otel_client_cert.clone(),
                kind: EntryKind::Certificate,
            },
        ),
        (
            "otelClientKey".to_string(),
            ConfigEntry {
                default: raw.otel_client_key.clone(),
                kind: EntryKind::Certificate,
            },
        ),
        (
            "otelSkipVerify".to_string(),
            ConfigEntry::plain(&raw.otel_skip_verify),
        ),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawSettings =
        envy::from_env().context("failed to parse OTEL_* environment variables")?;
    let settings = BusSettings::from_env()?;

    let bus = pumpkit::connect_bus(&settings, "otelpump", pumpkit::PUMP_RETRY).await;

    let config = ConfigMap::new(config_entries(&raw));
    {
        let service = ConfigService::new(bus.clone(), CONFIG_QUEUE, config.clone());
        tokio::spawn(async move {
            if let Err(err) = service.run().await {
                warn!(error = %err, "config service ended");
            }
        });
    }

    let client = TelemetryBusClient::new(bus.clone());
    let mut groups = client
        .group_stream(topics::OTEL)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::OTEL).await?;
    client.get(topics::OTEL).await?;

    pumpkit::wait_for_required(&config, &["otelCollector"]).await;

    let tls = TlsSettings {
        ca_file: config.cert_path("otelCACert"),
        client_cert: config.cert_path("otelClientCert"),
        client_key: config.cert_path("otelClientKey"),
        skip_verify: config.value("otelSkipVerify") == "true",
    };
    let http = pumpkit::outbound_client(&tls, EXPORT_TIMEOUT)?;
    let exporter = HttpExporter::new(&config.value("otelCollector"), http);

    // A broken manifest leaves every group unmappable; restarting with a
    // fixed mount is the only way out, so this is allowed to be fatal.
    let table = MappingTable::load(&raw.otel_mapping)
        .with_context(|| format!("failed to load mapping manifest {}", raw.otel_mapping))?;
    info!(mappings = table.len(), "mapping manifest loaded");

    info!("entering processing loop");
    while let Some(group) = groups.recv().await {
        if !group.values.is_empty() {
            let resource_metrics = convert::to_resource_metrics(&group, &table);
            if !resource_metrics.scope_metrics.is_empty() {
                if let Err(err) = exporter.export_metrics(resource_metrics).await {
                    warn!(report = %group.id, error = %err, "failed to deliver metrics to collector");
                }
            }
        }
        if !group.events.is_empty() {
            let resource_logs = convert::to_resource_logs(&group);
            if !resource_logs.scope_logs.is_empty() {
                if let Err(err) = exporter.export_logs(resource_logs).await {
                    warn!(report = %group.id, error = %err, "failed to deliver logs to collector");
                }
            }
        }
    }
    Ok(())
}
