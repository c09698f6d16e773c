//! Splunk HTTP Event Collector egress pump.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::Serialize;
use tracing::{info, warn};

use pumpkit::{BusSettings, ConfigEntry, ConfigMap, ConfigService};
use telebus::{topics, DataGroup, TelemetryBusClient};

const CONFIG_QUEUE: &str = "/splunkpump/config";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_hec_url")]
    splunk_hec_url: String,
    #[serde(default)]
    splunk_hec_key: String,
    #[serde(default)]
    splunk_hec_index: String,
}

fn default_hec_url() -> String {
    "http://splunkhost:8088".to_string()
}

fn config_entries(raw: &RawSettings) -> HashMap<String, ConfigEntry> {
    HashMap::from([
        ("splunkURL".to_string(), ConfigEntry::plain(&raw.splunk_hec_url)),
        ("splunkKey".to_string(), ConfigEntry::plain(&raw.splunk_hec_key)),
        ("splunkIndex".to_string(), ConfigEntry::plain(&raw.splunk_hec_index)),
    ])
}

#[derive(Debug, Serialize, PartialEq)]
struct HecFields {
    #[serde(rename = "_value")]
    value: f64,
    metric_name: String,
    source: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct HecEvent {
    time: i64,
    event: &'static str,
    host: String,
    fields: HecFields,
}

fn events_for(group: &DataGroup, index: &str) -> Vec<HecEvent> {
    let mut events = Vec::with_capacity(group.values.len());
    for value in &group.values {
        let Some(timestamp) = value.parsed_timestamp() else {
            warn!(metric = %value.id, timestamp = %value.timestamp, "dropping event with unparseable timestamp");
            continue;
        };
        events.push(HecEvent {
            time: timestamp.timestamp(),
            event: "metric",
            host: value.system_id.clone(),
            fields: HecFields {
                value: value.float_value().unwrap_or(0.0),
                metric_name: format!("{}_{}", value.context, value.id),
                source: format!("http:{index}"),
            },
        });
    }
    events
}

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawSettings =
        envy::from_env().context("failed to parse SPLUNK_HEC_* environment variables")?;
    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "splunkpump", pumpkit::PUMP_RETRY).await;

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
        .group_stream(topics::SPLUNK)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::SPLUNK).await?;
    client.get(topics::SPLUNK).await?;

    pumpkit::wait_for_required(&config, &["splunkURL", "splunkKey"]).await;

    let http = reqwest::Client::builder()
        .timeout(SEND_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()
        .context("failed to build HEC client")?;

    info!("entering processing loop");
    while let Some(group) = groups.recv().await {
        let events = events_for(&group, &config.value("splunkIndex"));
        if events.is_empty() {
            continue;
        }
        let url = format!(
            "{}/services/collector",
            config.value("splunkURL").trim_end_matches('/')
        );
        let response = http
            .post(&url)
            .header(
                "Authorization",
                format!("Splunk {}", config.value("splunkKey")),
            )
            .json(&events)
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                info!(count = events.len(), "sent events to splunk");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(%status, body = %body.trim(), "splunk rejected batch");
            }
            Err(err) => warn!(error = %err, "failed to send to splunk"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telebus::DataValue;

    fn group() -> DataGroup {
        DataGroup {
            values: vec![DataValue {
                id: "RxBytes".to_string(),
                context: "NIC.Integrated.1-1".to_string(),
                value: "1234".to_string(),
                system_id: "7GHX123".to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn events_carry_unix_seconds_and_metric_name() {
        let events = events_for(&group(), "poweredge");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.time, 1_704_067_200);
        assert_eq!(event.event, "metric");
        assert_eq!(event.host, "7GHX123");
        assert_eq!(event.fields.value, 1234.0);
        assert_eq!(event.fields.metric_name, "NIC.Integrated.1-1_RxBytes");
        assert_eq!(event.fields.source, "http:poweredge");
    }

    #[test]
    fn the_value_field_serialises_with_its_wire_name() {
        let events = events_for(&group(), "");
        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["fields"]["_value"], 1234.0);
        assert_eq!(json["fields"]["metric_name"], "NIC.Integrated.1-1_RxBytes");
    }

    #[test]
    fn legacy_offsets_parse_and_garbage_drops() {
        let mut g = group();
        g.values[0].timestamp = "2024-01-01T00:00:00+0000".to_string();
        assert_eq!(events_for(&g, "").len(), 1);
        g.values[0].timestamp = "garbage".to_string();
        assert!(events_for(&g, "").is_empty());
    }
}
