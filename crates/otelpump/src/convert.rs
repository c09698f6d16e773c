//! Pure conversion from canonical groups to OTLP messages.
//!
//! Conversion is a function of `(group, mapping table)` only. Values are
//! grouped by FQDD and metric id in sorted order and attribute sets come
//! from ordered maps, so two equal inputs always serialise to byte-identical
//! protobuf.

use std::collections::BTreeMap;

use chrono::DateTime;
use tracing::warn;

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs, SeverityNumber};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
};
use opentelemetry_proto::tonic::resource::v1::Resource;

use telebus::{DataGroup, DataValue};

use crate::mapping::{MappingTable, MetricMapping, ValueType};

const SCOPE_NAME: &str = "redfishreceiver";
const SCOPE_VERSION: &str = "1.0.0";
const LOG_SCOPE_NAME: &str = "Lifecycle Logs";
const LOG_SCOPE_VERSION: &str = "1.0.0";

/// Convert a metric group into one `ResourceMetrics`: one `ScopeMetrics` per
/// FQDD, one gauge `Metric` per distinct metric id.
pub fn to_resource_metrics(group: &DataGroup, table: &MappingTable) -> ResourceMetrics {
    let mut by_fqdd: BTreeMap<&str, BTreeMap<&str, Vec<&DataValue>>> = BTreeMap::new();
    for value in &group.values {
        by_fqdd
            .entry(value.context.as_str())
            .or_default()
            .entry(value.id.as_str())
            .or_default()
            .push(value);
    }

    let report_nanos = epoch_nanos(&group.timestamp).unwrap_or(0);

    let mut scope_metrics = Vec::new();
    for (fqdd, by_metric) in &by_fqdd {
        let mut scope_attributes = BTreeMap::new();
        let mut metrics = Vec::new();

        for (metric_id, samples) in by_metric {
            let Some(mapping) = table.lookup(&group.id, metric_id) else {
                warn!(report = %group.id, metric = %metric_id, "no otel mapping for metric id, dropping");
                continue;
            };
            for (key, template) in &mapping.scope_attributes {
                scope_attributes.insert(key.clone(), substitute(template, fqdd, report_nanos));
            }

            let data_points: Vec<NumberDataPoint> = samples
                .iter()
                .filter_map(|sample| data_point(sample, mapping))
                .collect();
            if data_points.is_empty() {
                continue;
            }
            metrics.push(Metric {
                name: mapping.name.clone(),
                description: mapping.description.clone(),
                unit: mapping.unit.clone(),
                data: Some(metric::Data::Gauge(Gauge { data_points })),
                ..Default::default()
            });
        }

        if metrics.is_empty() {
            continue;
        }
        scope_metrics.push(ScopeMetrics {
            scope: Some(InstrumentationScope {
                name: SCOPE_NAME.to_string(),
                version: SCOPE_VERSION.to_string(),
                attributes: kv_list(&scope_attributes),
                ..Default::default()
            }),
            metrics,
            ..Default::default()
        });
    }

    ResourceMetrics {
        resource: Some(Resource {
            attributes: resource_attributes(group),
            ..Default::default()
        }),
        scope_metrics,
        ..Default::default()
    }
}

/// Convert an alert group into one `ResourceLogs` with a single `ScopeLogs`.
/// Records with unparseable timestamps are dropped; when none survive the
/// scope list stays empty.
pub fn to_resource_logs(group: &DataGroup) -> ResourceLogs {
    let mut log_records = Vec::new();
    for event in &group.events {
        let Some(nanos) = epoch_nanos(&event.event_timestamp) else {
            warn!(event = %event.event_id, timestamp = %event.event_timestamp, "dropping event with unparseable timestamp");
            continue;
        };
        let body = serde_json::to_string(event).unwrap_or_default();
        log_records.push(LogRecord {
            time_unix_nano: nanos,
            observed_time_unix_nano: nanos,
            severity_text: event.message_severity.clone(),
            severity_number: severity_number(&event.message_severity) as i32,
            body: Some(AnyValue {
                value: Some(any_value::Value::StringValue(body)),
            }),
            attributes: vec![
                kv("event.data.type", "telemetry"),
                kv("event.object.type", &event.event_type),
                kv("event.object.id", &event.event_id),
            ],
            ..Default::default()
        });
    }

    let scope_logs = if log_records.is_empty() {
        Vec::new()
    } else {
        vec![ScopeLogs {
            scope: Some(InstrumentationScope {
                name: LOG_SCOPE_NAME.to_string(),
                version: LOG_SCOPE_VERSION.to_string(),
                ..Default::default()
            }),
            log_records,
            ..Default::default()
        }]
    };

    ResourceLogs {
        resource: Some(Resource {
            attributes: resource_attributes(group),
            ..Default::default()
        }),
        scope_logs,
        ..Default::default()
    }
}

fn data_point(sample: &DataValue, mapping: &MetricMapping) -> Option<NumberDataPoint> {
    let Some(nanos) = epoch_nanos(&sample.timestamp) else {
        warn!(metric = %sample.id, timestamp = %sample.timestamp, "dropping point with unparseable timestamp");
        return None;
    };

    // Parse the reading once; what fails as a float may still be an enum.
    let reading = sample.value.trim();
    let parsed = reading.parse::<f64>().ok();

    let value = match mapping.value_type {
        ValueType::Double => number_data_point::Value::AsDouble(parsed.or_else(|| {
            warn!(metric = %sample.id, value = %sample.value, "dropping non-numeric reading");
            None
        })?),
        ValueType::Int => {
            let float = parsed.or_else(|| {
                warn!(metric = %sample.id, value = %sample.value, "dropping non-numeric reading");
                None
            })?;
            if float.fract() == 0.0 {
                number_data_point::Value::AsInt(float as i64)
            } else {
                number_data_point::Value::AsDouble(float)
            }
        }
        ValueType::String => match mapping.enum_values.get(&reading.to_lowercase()) {
            Some(code) => number_data_point::Value::AsInt(*code),
            None => {
                warn!(metric = %sample.id, value = %sample.value, "reading absent from enum map, dropping point");
                return None;
            }
        },
    };

    Some(NumberDataPoint {
        attributes: kv_list(&mapping.attributes),
        start_time_unix_nano: nanos,
        time_unix_nano: nanos,
        value: Some(value),
        ..Default::default()
    })
}

fn resource_attributes(group: &DataGroup) -> Vec<KeyValue> {
    let attributes = BTreeMap::from([
        ("host.id".to_string(), group.sku.clone()),
        ("host.model".to_string(), group.model.clone()),
        ("host.name".to_string(), group.fqdn.clone()),
        ("host.type".to_string(), "PowerEdge".to_string()),
    ]);
    kv_list(&attributes)
}

fn severity_number(severity: &str) -> SeverityNumber {
    match severity.to_lowercase().as_str() {
        "ok" => SeverityNumber::Info,
        "warning" => SeverityNumber::Warn,
        "critical" => SeverityNumber::Error,
        _ => SeverityNumber::Unspecified,
    }
}

fn substitute(template: &str, fqdd: &str, report_nanos: u64) -> String {
    template
        .replace("var-FQDD", fqdd)
        .replace("var-Timestamp", &report_nanos.to_string())
}

fn epoch_nanos(timestamp: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(timestamp).ok()?;
    parsed.timestamp_nanos_opt().map(|nanos| nanos as u64)
}

fn kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.to_string())),
        }),
    }
}

fn kv_list(attributes: &BTreeMap<String, String>) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| kv(key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;
    use telebus::EventValue;

    const TS: &str = "2024-01-01T00:00:00Z";
    const TS_NANOS: u64 = 1_704_067_200_000_000_000;

    fn table() -> MappingTable {
        MappingTable::parse(include_str!("../mapping/redfish-otel.yaml")).unwrap()
    }

    fn value(id: &str, context: &str, reading: &str) -> DataValue {
        DataValue {
            id: id.to_string(),
            context: context.to_string(),
            value: reading.to_string(),
            timestamp: TS.to_string(),
            system_id: "host123".to_string(),
            host_name: "myhost".to_string(),
            ..Default::default()
        }
    }

    fn metric_group(id: &str, values: Vec<DataValue>) -> DataGroup {
        DataGroup {
            id: id.to_string(),
            timestamp: TS.to_string(),
            sku: "7GHX123".to_string(),
            model: "PowerEdge R750".to_string(),
            fqdn: "r750-rack4.lab".to_string(),
            values,
            ..Default::default()
        }
    }

    fn attr<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a str> {
        attributes
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| match &v.value {
                Some(any_value::Value::StringValue(s)) => Some(s.as_str()),
                _ => None,
            })
    }

    #[test]
    fn gauge_happy_path() {
        let group = metric_group(
            "GPUMetrics",
            vec![value("GPUMemoryUsage", "SystemBoard", "123.45")],
        );
        let rm = to_resource_metrics(&group, &table());

        assert_eq!(rm.scope_metrics.len(), 1);
        let scope = &rm.scope_metrics[0];
        assert_eq!(scope.metrics.len(), 1);
        let metric = &scope.metrics[0];
        assert_eq!(metric.name, "hw.gpu.memory.usage");

        let Some(metric::Data::Gauge(gauge)) = &metric.data else {
            panic!("expected a gauge");
        };
        assert_eq!(gauge.data_points.len(), 1);
        let point = &gauge.data_points[0];
        assert_eq!(point.time_unix_nano, TS_NANOS);
        assert_eq!(
            point.value,
            Some(number_data_point::Value::AsDouble(123.45))
        );

        let resource = rm.resource.as_ref().unwrap();
        assert_eq!(attr(&resource.attributes, "host.type"), Some("PowerEdge"));
        assert_eq!(attr(&resource.attributes, "host.id"), Some("7GHX123"));
        assert_eq!(attr(&resource.attributes, "host.name"), Some("r750-rack4.lab"));
        assert_eq!(
            attr(&resource.attributes, "host.model"),
            Some("PowerEdge R750")
        );
    }

    #[test]
    fn scope_attributes_substitute_fqdd_and_timestamp() {
        let group = metric_group(
            "GPUMetrics",
            vec![value("GPUMemoryUsage", "Video.Slot.7", "10")],
        );
        let rm = to_resource_metrics(&group, &table());
        let scope = rm.scope_metrics[0].scope.as_ref().unwrap();
        assert_eq!(attr(&scope.attributes, "hw.parent"), Some("Video.Slot.7"));
        assert_eq!(
            attr(&scope.attributes, "telemetry.report.time"),
            Some(TS_NANOS.to_string().as_str())
        );
    }

    #[test]
    fn values_group_by_fqdd_into_scopes() {
        let group = metric_group(
            "CPUSensor",
            vec![
                value("TemperatureReading", "CPU.Socket.1", "41"),
                value("TemperatureReading", "CPU.Socket.2", "44"),
            ],
        );
        let rm = to_resource_metrics(&group, &table());
        assert_eq!(rm.scope_metrics.len(), 2);
        let parents: Vec<_> = rm
            .scope_metrics
            .iter()
            .map(|sm| {
                attr(&sm.scope.as_ref().unwrap().attributes, "hw.parent")
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(parents, vec!["CPU.Socket.1", "CPU.Socket.2"]);
    }

    #[test]
    fn repeated_metric_ids_resolve_through_the_report_prefix() {
        let group = metric_group(
            "NICSensor",
            vec![value("TemperatureReading", "SystemBoard", "123.45")],
        );
        let rm = to_resource_metrics(&group, &table());
        assert_eq!(rm.scope_metrics[0].metrics[0].name, "hw.nic.temperature");
    }

    #[test]
    fn int_typed_integral_readings_emit_as_int() {
        let group = metric_group(
            "NICStatistics",
            vec![value("TxBytes", "NIC.Integrated.1-1", "52480")],
        );
        let rm = to_resource_metrics(&group, &table());
        let Some(metric::Data::Gauge(gauge)) = &rm.scope_metrics[0].metrics[0].data else {
            panic!("expected a gauge");
        };
        assert_eq!(
            gauge.data_points[0].value,
            Some(number_data_point::Value::AsInt(52480))
        );
    }

    #[test]
    fn enum_readings_map_to_int() {
        let down = metric_group(
            "NICStatistics",
            vec![value("LinkStatus", "NIC.Integrated.1-1", "Down")],
        );
        let rm = to_resource_metrics(&down, &table());
        let Some(metric::Data::Gauge(gauge)) = &rm.scope_metrics[0].metrics[0].data else {
            panic!("expected a gauge");
        };
        assert_eq!(
            gauge.data_points[0].value,
            Some(number_data_point::Value::AsInt(0))
        );

        let not_applicable = metric_group(
            "FCPortStatistics",
            vec![value("FCStatOSDriverState", "FC.Slot.2-1", "Not Applicable")],
        );
        let rm = to_resource_metrics(&not_applicable, &table());
        let Some(metric::Data::Gauge(gauge)) = &rm.scope_metrics[0].metrics[0].data else {
            panic!("expected a gauge");
        };
        assert_eq!(
            gauge.data_points[0].value,
            Some(number_data_point::Value::AsInt(1))
        );
    }

    #[test]
    fn enum_misses_drop_the_point_but_not_the_group() {
        let group = metric_group(
            "NICStatistics",
            vec![
                value("LinkStatus", "NIC.Integrated.1-1", "Purple"),
                value("TxBytes", "NIC.Integrated.1-1", "100"),
            ],
        );
        let rm = to_resource_metrics(&group, &table());
        assert_eq!(rm.scope_metrics.len(), 1);
        let metrics = &rm.scope_metrics[0].metrics;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "hw.network.io.transmit");
    }

    #[test]
    fn unmapped_metric_ids_drop_with_no_scope() {
        let group = metric_group(
            "MysteryReport",
            vec![value("NobodyKnowsThisOne", "SystemBoard", "1")],
        );
        let rm = to_resource_metrics(&group, &table());
        assert!(rm.scope_metrics.is_empty());
    }

    #[test]
    fn bad_sample_timestamps_drop_the_point() {
        let mut bad = value("GPUMemoryUsage", "SystemBoard", "5");
        bad.timestamp = "not-a-timestamp".to_string();
        let group = metric_group("GPUMetrics", vec![bad]);
        let rm = to_resource_metrics(&group, &table());
        assert!(rm.scope_metrics.is_empty());
    }

    #[test]
    fn conversion_is_deterministic() {
        let group = metric_group(
            "PowerMetrics",
            vec![
                value("SystemInputPower", "System.Chassis.1", "380"),
                value("TotalCPUPower", "System.Chassis.1", "210"),
                value("SystemOutputPower", "System.Chassis.1", "350"),
            ],
        );
        let table = table();
        let first = to_resource_metrics(&group, &table).encode_to_vec();
        let second = to_resource_metrics(&group, &table).encode_to_vec();
        assert_eq!(first, second);
    }

    fn event(severity: &str, timestamp: &str) -> EventValue {
        EventValue {
            event_timestamp: timestamp.to_string(),
            message_severity: severity.to_string(),
            event_id: "PSU1".to_string(),
            event_type: "Alert".to_string(),
            message: "Power supply failure".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn log_conversion_maps_severity_attributes_and_body() {
        let group = DataGroup {
            events: vec![event("Critical", TS)],
            ..Default::default()
        };
        let rl = to_resource_logs(&group);
        assert_eq!(rl.scope_logs.len(), 1);
        let scope = rl.scope_logs[0].scope.as_ref().unwrap();
        assert_eq!(scope.name, "Lifecycle Logs");
        assert_eq!(scope.version, "1.0.0");

        let record = &rl.scope_logs[0].log_records[0];
        assert_eq!(record.time_unix_nano, TS_NANOS);
        assert_eq!(record.observed_time_unix_nano, TS_NANOS);
        assert_eq!(record.severity_text, "Critical");
        assert_eq!(record.severity_number, SeverityNumber::Error as i32);
        assert_eq!(attr(&record.attributes, "event.data.type"), Some("telemetry"));
        assert_eq!(attr(&record.attributes, "event.object.type"), Some("Alert"));
        assert_eq!(attr(&record.attributes, "event.object.id"), Some("PSU1"));

        let Some(any_value::Value::StringValue(body)) =
            record.body.as_ref().and_then(|b| b.value.as_ref())
        else {
            panic!("log body is not a string");
        };
        let expected = serde_json::to_string(&group.events[0]).unwrap();
        assert_eq!(body, &expected);
    }

    #[test]
    fn severity_mapping_covers_the_vocabulary() {
        assert_eq!(severity_number("OK"), SeverityNumber::Info);
        assert_eq!(severity_number("Warning"), SeverityNumber::Warn);
        assert_eq!(severity_number("Critical"), SeverityNumber::Error);
        assert_eq!(severity_number("Informational"), SeverityNumber::Unspecified);
    }

    #[test]
    fn bad_event_timestamps_leave_scope_logs_empty() {
        let group = DataGroup {
            events: vec![event("OK", "not-a-timestamp")],
            ..Default::default()
        };
        let rl = to_resource_logs(&group);
        assert!(rl.scope_logs.is_empty());
    }
}
