//! InfluxDB v2 egress pump: one line-protocol point per value, written with
//! a token over the v2 write API.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use pumpkit::{BusSettings, ConfigEntry, ConfigMap, ConfigService};
use telebus::{topics, DataGroup, DataValue, TelemetryBusClient};

const CONFIG_QUEUE: &str = "/influxpump/config";
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    influxdb_url: String,
    #[serde(default)]
    influx_token: String,
    #[serde(default)]
    influx_org: String,
    #[serde(default)]
    influx_bucket: String,
}

fn config_entries(raw: &RawSettings) -> HashMap<String, ConfigEntry> {
    HashMap::from([
        ("influxURL".to_string(), ConfigEntry::plain(&raw.influxdb_url)),
        ("influxToken".to_string(), ConfigEntry::plain(&raw.influx_token)),
        ("influxOrg".to_string(), ConfigEntry::plain(&raw.influx_org)),
        ("influxBucket".to_string(), ConfigEntry::plain(&raw.influx_bucket)),
    ])
}

/// Measurement naming: an FQDD-like context (it contains a `.`) tags the
/// point and leaves the measurement as the bare id; a plain context prefixes
/// the measurement instead.
fn line_for(value: &DataValue) -> Option<String> {
    let Some(timestamp) = value.parsed_timestamp() else {
        warn!(metric = %value.id, timestamp = %value.timestamp, "dropping point with unparseable timestamp");
        return None;
    };
    let nanos = timestamp.timestamp_nanos_opt()?;
    let reading = value.float_value().unwrap_or(0.0);

    let mut line = String::new();
    if value.context.contains('.') {
        line.push_str(&escape_measurement(&value.id));
        line.push_str(",ServiceTag=");
        line.push_str(&escape_tag(&value.system_id));
        line.push_str(",FQDD=");
        line.push_str(&escape_tag(&value.context));
    } else {
        line.push_str(&escape_measurement(&format!(
            "{}_{}",
            value.context, value.id
        )));
        line.push_str(",ServiceTag=");
        line.push_str(&escape_tag(&value.system_id));
    }
    line.push_str(&format!(" value={reading} {nanos}"));
    Some(line)
}

fn lines_for(group: &DataGroup) -> String {
    group
        .values
        .iter()
        .filter_map(line_for)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawSettings =
        envy::from_env().context("failed to parse INFLUX* environment variables")?;
    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "influxpump", pumpkit::PUMP_RETRY).await;

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
        .group_stream(topics::INFLUX)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::INFLUX).await?;
    client.get(topics::INFLUX).await?;

    pumpkit::wait_for_required(
        &config,
        &["influxURL", "influxToken", "influxOrg", "influxBucket"],
    )
    .await;

    let http = reqwest::Client::builder()
        .timeout(WRITE_TIMEOUT)
        .build()
        .context("failed to build influx client")?;
    let url = format!(
        "{}/api/v2/write?org={}&bucket={}&precision=ns",
        config.value("influxURL").trim_end_matches('/'),
        config.value("influxOrg"),
        config.value("influxBucket"),
    );
    let token = config.value("influxToken");

    info!("entering processing loop");
    while let Some(group) = groups.recv().await {
        let body = lines_for(&group);
        if body.is_empty() {
            continue;
        }
        let response = http
            .post(&url)
            .header("Authorization", format!("Token {token}"))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(%status, body = %body.trim(), "influx rejected batch");
            }
            Err(err) => warn!(error = %err, "failed to write to influx"),
        }
    }
    Ok(())
}
