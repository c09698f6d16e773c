//! VictoriaMetrics push pump: the same gauge registry as the scrape pump,
//! pushed in Prometheus exposition format after every group.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use prompump::GaugeRegistry;
use pumpkit::{BusSettings, ConfigEntry, ConfigMap, ConfigService};
use telebus::{topics, TelemetryBusClient};

const CONFIG_QUEUE: &str = "/victoriapump/config";
const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_victoria_url")]
    victoria_metrics_url: String,
    #[serde(default)]
    victoria_username: String,
    #[serde(default)]
    victoria_password: String,
}

fn default_victoria_url() -> String {
    "http://localhost:8428/api/v1/import/prometheus".to_string()
}

fn config_entries(raw: &RawSettings) -> HashMap<String, ConfigEntry> {
    HashMap::from([
        (
            "victoriaURL".to_string(),
            ConfigEntry::plain(&raw.victoria_metrics_url),
        ),
        (
            "victoriaUsername".to_string(),
            ConfigEntry::plain(&raw.victoria_username),
        ),
        (
            "victoriaPassword".to_string(),
            ConfigEntry::plain(&raw.victoria_password),
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
        envy::from_env().context("failed to parse VICTORIA_* environment variables")?;
    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "victoriapump", pumpkit::PUMP_RETRY).await;

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
        .group_stream(topics::PROMETHEUS)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::PROMETHEUS).await?;
    client.get(topics::PROMETHEUS).await?;

    pumpkit::wait_for_required(&config, &["victoriaURL"]).await;

    let http = reqwest::Client::builder()
        .timeout(PUSH_TIMEOUT)
        .build()
        .context("failed to build push client")?;

    let mut registry = GaugeRegistry::new();
    info!("entering processing loop");
    while let Some(group) = groups.recv().await {
        registry.observe_group(&group.values);

        let body = registry.render();
        if body.is_empty() {
            continue;
        }
        let mut request = http
            .post(config.value("victoriaURL"))
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body);
        let username = config.value("victoriaUsername");
        let password = config.value("victoriaPassword");
        if !username.is_empty() && !password.is_empty() {
            request = request.basic_auth(username, Some(password));
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "victoriametrics rejected push");
            }
            Err(err) => warn!(error = %err, "failed to push metrics"),
        }
    }
    Ok(())
}
