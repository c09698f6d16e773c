//! Parsers from Redfish payloads to the canonical representation.
//!
//! Both parsers are pure functions over the decoded JSON tree; the monitor
//! resolves any `@odata.id` indirection (notably `MetricValues`) before
//! handing the document over.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use thiserror::Error;

use telebus::{DataGroup, DataValue, EventValue};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document has no Id")]
    MissingId,

    #[error("document has no {0}")]
    Missing(&'static str),
}

/// Host descriptors stamped onto every group a device produces.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescriptors {
    pub system_id: String,
    pub host_name: String,
    pub model: String,
    pub sku: String,
    pub fqdn: String,
    pub firmware_version: String,
    pub image_id: String,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn text(value: &Value, name: &str) -> String {
    value.get(name).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn stamp(group: &mut DataGroup, device: &DeviceDescriptors) {
    group.system_id = device.system_id.clone();
    group.host_name = device.host_name.clone();
    group.model = device.model.clone();
    group.sku = device.sku.clone();
    group.fqdn = device.fqdn.clone();
    group.firmware_version = device.firmware_version.clone();
    group.image_id = device.image_id.clone();
}

/// Parse a `MetricReport` document into one group of values.
pub fn metric_report(report: &Value, device: &DeviceDescriptors) -> Result<DataGroup, ParseError> {
    let mut group = DataGroup {
        id: report
            .get("Id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or(ParseError::MissingId)?
            .to_string(),
        label: text(report, "Name"),
        sequence: text(report, "ReportSequence"),
        timestamp: report
            .get("Timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(now_rfc3339),
        ..Default::default()
    };
    stamp(&mut group, device);

    let values = report
        .get("MetricValues")
        .and_then(Value::as_array)
        .ok_or(ParseError::Missing("MetricValues"))?;

    for (index, value) in values.iter().enumerate() {
        // Entries without a sampled value carry nothing downstream.
        let Some(metric_value) = value.get("MetricValue").and_then(Value::as_str) else {
            continue;
        };
        let id = value_id(value, index);
        let (context, label) = context_and_label(value, &id);
        group.values.push(DataValue {
            id,
            context,
            label,
            value: metric_value.to_string(),
            system_id: device.system_id.clone(),
            host_name: device.host_name.clone(),
            timestamp: value
                .get("Timestamp")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(now_rfc3339),
        });
    }
    Ok(group)
}

/// Parse an alert document's `Events[]` into one group of events.
pub fn alert(payload: &Value, device: &DeviceDescriptors) -> Result<DataGroup, ParseError> {
    let mut group = DataGroup {
        id: payload
            .get("Id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .unwrap_or("Alert")
            .to_string(),
        label: text(payload, "Name"),
        timestamp: now_rfc3339(),
        ..Default::default()
    };
    stamp(&mut group, device);

    let events = payload
        .get("Events")
        .and_then(Value::as_array)
        .ok_or(ParseError::Missing("Events"))?;

    for entry in events {
        group.events.push(EventValue {
            event_type: text(entry, "EventType"),
            event_id: text(entry, "EventId"),
            event_timestamp: entry
                .get("EventTimestamp")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(now_rfc3339),
            member_id: text(entry, "MemberId"),
            message_severity: text(entry, "MessageSeverity"),
            message: text(entry, "Message"),
            message_id: text(entry, "MessageId"),
            message_args: entry
                .get("MessageArgs")
                .and_then(Value::as_array)
                .map(|args| {
                    args.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            origin_of_condition: entry
                .pointer("/OriginOfCondition/@odata.id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(group)
}

/// Metric id fallback chain: `MetricId`, else the last `MetricProperty`
/// segment with `#` flattened to `_`, else a positional name.
fn value_id(value: &Value, index: usize) -> String {
    if let Some(id) = value
        .get("MetricId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
    {
        return id.to_string();
    }
    if let Some(property) = value
        .get("MetricProperty")
        .and_then(Value::as_str)
        .filter(|property| !property.is_empty())
    {
        let tail = property.rsplit('/').next().unwrap_or(property);
        return tail.replace('#', "_");
    }
    format!("Metric{index}")
}

/// Dell OEM context/label when present, else `(empty, id)`.
fn context_and_label(value: &Value, id: &str) -> (String, String) {
    if let Some(dell) = value.pointer("/Oem/Dell") {
        if let (Some(context), Some(label)) = (
            dell.get("ContextID").and_then(Value::as_str),
            dell.get("Label").and_then(Value::as_str),
        ) {
            return (context.to_string(), label.to_string());
        }
    }
    (String::new(), id.to_string())
}
