//! Elasticsearch egress pump: one bulk-indexed document per value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use pumpkit::{BusSettings, ConfigEntry, ConfigMap, ConfigService};
use telebus::{topics, DataGroup, DataValue, TelemetryBusClient};

const CONFIG_QUEUE: &str = "/elasticpump/config";
const BULK_TIMEOUT: Duration = Duration::from_secs(30);

static INDEXED: AtomicU64 = AtomicU64::new(0);
static REJECTED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_elastic_url")]
    elasticsearch_url: String,
    #[serde(default = "default_index")]
    elastic_index: String,
}

fn default_elastic_url() -> String {
    "http://elasticsearch:9200".to_string()
}

fn default_index() -> String {
    "redfish_telemetry_metrics".to_string()
}

fn config_entries(raw: &RawSettings) -> HashMap<String, ConfigEntry> {
    HashMap::from([
        (
            "elasticURL".to_string(),
            ConfigEntry::plain(&raw.elasticsearch_url),
        ),
        (
            "elasticIndex".to_string(),
            ConfigEntry::plain(&raw.elastic_index),
        ),
    ])
}

/// The indexed document: the value verbatim plus a numeric mirror that
/// aggregations can run over.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Document<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    context: &'a str,
    label: &'a str,
    value: &'a str,
    system: &'a str,
    timestamp: &'a str,
    value_aggregatable: f64,
}

fn aggregatable(value: &str) -> f64 {
    if let Ok(int) = value.trim().parse::<i64>() {
        return int as f64;
    }
    match value.trim().parse::<f64>() {
        Ok(float) if float.is_finite() => float,
        _ => 0.0,
    }
}

fn bulk_body(group: &DataGroup) -> String {
    let mut body = String::new();
    for value in &group.values {
        if value.value.is_empty() {
            continue;
        }
        body.push_str(&bulk_entry(value));
    }
    body
}

fn bulk_entry(value: &DataValue) -> String {
    let meta = serde_json::json!({"index": {"_id": format!("{}-{}", value.id, value.timestamp)}});
    let document = Document {
        id: &value.id,
        context: &value.context,
        label: &value.label,
        value: &value.value,
        system: &value.system_id,
        timestamp: &value.timestamp,
        value_aggregatable: aggregatable(&value.value),
    };
    format!(
        "{}\n{}\n",
        meta,
        serde_json::to_string(&document).unwrap_or_default()
    )
}

/// Tally a bulk response; per-item rejections are counted and logged, never
/// escalated.
fn tally_response(body: &Value) {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        return;
    };
    for item in items {
        let status = item
            .pointer("/index/status")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if (200..300).contains(&status) {
            INDEXED.fetch_add(1, Ordering::Relaxed);
        } else {
            REJECTED.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %item.pointer("/index/_id").and_then(|v| v.as_str()).unwrap_or(""),
                status,
                reason = %item.pointer("/index/error/reason").and_then(|v| v.as_str()).unwrap_or(""),
                "document rejected"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawSettings =
        envy::from_env().context("failed to parse ELASTIC* environment variables")?;
    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "elasticpump", pumpkit::PUMP_RETRY).await;

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
        .group_stream(topics::ELKSTACK)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::ELKSTACK).await?;
    client.get(topics::ELKSTACK).await?;

    pumpkit::wait_for_required(&config, &["elasticURL", "elasticIndex"]).await;

    let http = reqwest::Client::builder()
        .timeout(BULK_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
        .context("failed to build elasticsearch client")?;
    let url = format!(
        "{}/{}/_bulk",
        config.value("elasticURL").trim_end_matches('/'),
        config.value("elasticIndex"),
    );

    info!("entering processing loop");
    while let Some(group) = groups.recv().await {
        let body = bulk_body(&group);
        if body.is_empty() {
            continue;
        }
        let response = http
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<Value>().await {
                    Ok(body) => tally_response(&body),
                    Err(err) => warn!(error = %err, "failed to decode bulk response"),
                }
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(%status, body = %body.trim(), "bulk request rejected");
            }
            Err(err) => warn!(error = %err, "failed to index batch"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(reading: &str) -> DataValue {
        DataValue {
            id: "TemperatureReading".to_string(),
            context: "CPU.Socket.1".to_string(),
            label: "CPU1 Temp".to_string(),
            value: reading.to_string(),
            system_id: "7GHX123".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn bulk_entries_are_meta_then_document() {
        let entry = bulk_entry(&value("42"));
        let mut lines = entry.lines();
        let meta: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(
            meta["index"]["_id"],
            "TemperatureReading-2024-01-01T00:00:00Z"
        );
        let document: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(document["ID"], "TemperatureReading");
        assert_eq!(document["Value"], "42");
        assert_eq!(document["ValueAggregatable"], 42.0);
        assert_eq!(document["System"], "7GHX123");
    }

    #[test]
    fn aggregatable_prefers_int_then_finite_float() {
        assert_eq!(aggregatable("17"), 17.0);
        assert_eq!(aggregatable("17.5"), 17.5);
        assert_eq!(aggregatable("NaN"), 0.0);
        assert_eq!(aggregatable("Operational"), 0.0);
    }

    #[test]
    fn empty_values_are_skipped() {
        let group = DataGroup {
            values: vec![value(""), value("1")],
            ..Default::default()
        };
        let body = bulk_body(&group);
        assert_eq!(body.lines().count(), 2);
        assert!(body.ends_with('\n'));
    }
}
