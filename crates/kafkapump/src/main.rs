//! Kafka egress pump: one JSON record per group onto the configured topic.
//!
//! Delivery goes through the outbound Kafka transport, which enforces the
//! 10 s write deadline and exits the process on fatal broker errors so the
//! supervisor restarts us; upstream re-emits, so nothing is rebuilt by hand
//! here.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pumpkit::{BusSettings, ConfigEntry, ConfigMap, ConfigService, EntryKind};
use telebus::{topics, DataGroup, TelemetryBusClient};
use wirebus::{Bus, KafkaBus, KafkaTlsConfig};

const CONFIG_QUEUE: &str = "/kafkapump/config";
const BROKER_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    kafka_broker: String,
    #[serde(default)]
    kafka_topic: String,
    #[serde(default = "default_partition")]
    kafka_partition: String,
    #[serde(default)]
    kafka_cacert: String,
    #[serde(default)]
    kafka_client_cert: String,
    #[serde(default)]
    kafka_client_key: String,
    #[serde(default)]
    kafka_skip_verify: String,
}

fn default_partition() -> String {
    "0".to_string()
}

fn config_entries(raw: &RawSettings) -> HashMap<String, ConfigEntry> {
    HashMap::from([
        ("kafkaBroker".to_string(), ConfigEntry::plain(&raw.kafka_broker)),
        ("kafkaTopic".to_string(), ConfigEntry::plain(&raw.kafka_topic)),
        (
            "kafkaPartition".to_string(),
            ConfigEntry::plain(&raw.kafka_partition),
        ),
        (
            "kafkaCACert".to_string(),
            ConfigEntry {
                default: raw.kafka_cacert.clone(),
                kind: EntryKind::Certificate,
            },
        ),
        (
            "kafkaClientCert".to_string(),
            ConfigEntry {
                default: raw.kafka_client_cert.clone(),
                kind: EntryKind::Certificate,
            },
        ),
        (
            "kafkaClientKey".to_string(),
            ConfigEntry {
                default: raw.kafka_client_key.clone(),
                kind: EntryKind::Certificate,
            },
        ),
        (
            "kafkaSkipVerify".to_string(),
            ConfigEntry::plain(&raw.kafka_skip_verify),
        ),
    ])
}

#[derive(Debug, Serialize, PartialEq)]
struct KafkaFields {
    #[serde(rename = "_value")]
    value: f64,
    metric_name: String,
    source: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct KafkaRecord {
    time: i64,
    event: &'static str,
    host: String,
    fields: KafkaFields,
}

fn records_for(group: &DataGroup) -> Vec<KafkaRecord> {
    let mut records = Vec::with_capacity(group.values.len());
    for value in &group.values {
        let Some(timestamp) = value.parsed_timestamp() else {
            warn!(metric = %value.id, timestamp = %value.timestamp, "dropping record with unparseable timestamp");
            continue;
        };
        records.push(KafkaRecord {
            time: timestamp.timestamp(),
            event: "metric",
            host: value.system_id.clone(),
            fields: KafkaFields {
                value: value.float_value().unwrap_or(0.0),
                metric_name: format!("{}_{}", value.context, value.id),
                source: "telemetry".to_string(),
            },
        });
    }
    records
}

#[tokio::main]
async fn main() -> Result<()> {
    pumpkit::telemetry::init_tracing();
    run().await
}

async fn run() -> Result<()> {
    let raw: RawSettings =
        envy::from_env().context("failed to parse KAFKA_* environment variables")?;
    let settings = BusSettings::from_env()?;
    let bus = pumpkit::connect_bus(&settings, "kafkapump", pumpkit::PUMP_RETRY).await;

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
        .group_stream(topics::KAFKA)
        .await
        .context("failed to open group stream")?;
    client.subscribe(topics::KAFKA).await?;
    client.get(topics::KAFKA).await?;

    pumpkit::wait_for_required(&config, &["kafkaBroker", "kafkaTopic"]).await;

    let partition: i32 = config.value("kafkaPartition").parse().unwrap_or(0);
    let tls = KafkaTlsConfig {
        ca_location: config.cert_path("kafkaCACert"),
        client_cert: config.cert_path("kafkaClientCert"),
        client_key: config.cert_path("kafkaClientKey"),
        skip_verify: config.value("kafkaSkipVerify") == "true",
    };

    let broker = config.value("kafkaBroker");
    let producer = loop {
        match KafkaBus::connect(&broker, partition, Some(&tls)) {
            Ok(producer) => break producer,
            Err(err) => {
                warn!(%broker, error = %err, "could not connect to kafka broker, retrying");
                tokio::time::sleep(BROKER_RETRY).await;
            }
        }
    };
    info!(%broker, partition, "connected to kafka broker");

    let topic = config.value("kafkaTopic");
    info!("entering processing loop");
    while let Some(group) = groups.recv().await {
        let records = records_for(&group);
        if records.is_empty() {
            continue;
        }
        let payload = serde_json::to_vec(&records)?;
        if let Err(err) = producer.publish(&topic, &payload).await {
            warn!(%topic, error = %err, "failed to write records to kafka");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telebus::DataValue;

    #[test]
    fn one_json_array_per_group() {
        let group = DataGroup {
            values: vec![
                DataValue {
                    id: "RxBytes".to_string(),
                    context: "NIC.Integrated.1-1".to_string(),
                    value: "10".to_string(),
                    system_id: "7GHX123".to_string(),
                    timestamp: "2024-01-01T00:00:00Z".to_string(),
                    ..Default::default()
                },
                DataValue {
                    id: "TxBytes".to_string(),
                    context: "NIC.Integrated.1-1".to_string(),
                    value: "20".to_string(),
                    system_id: "7GHX123".to_string(),
                    timestamp: "2024-01-01T00:00:00Z".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let records = records_for(&group);
        assert_eq!(records.len(), 2);
        let json = serde_json::to_value(&records).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["fields"]["_value"], 10.0);
        assert_eq!(json[1]["fields"]["metric_name"], "NIC.Integrated.1-1_TxBytes");
        assert_eq!(json[0]["time"], 1_704_067_200);
    }

    #[test]
    fn bad_timestamps_drop_only_their_record() {
        let group = DataGroup {
            values: vec![
                DataValue {
                    id: "Bad".to_string(),
                    timestamp: "nope".to_string(),
                    ..Default::default()
                },
                DataValue {
                    id: "Good".to_string(),
                    value: "1".to_string(),
                    timestamp: "2024-01-01T00:00:00Z".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(records_for(&group).len(), 1);
    }
}
