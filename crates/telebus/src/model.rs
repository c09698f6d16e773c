//! Canonical in-process representation of device telemetry.
//!
//! Every metric report and lifecycle alert a device emits is normalised into
//! a [`DataGroup`] before fan-out. Field casing on the wire follows the
//! Redfish style the payloads arrive in.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// One sampled metric. Lives for a single fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DataValue {
    #[serde(rename = "ID")]
    pub id: String,
    /// FQDD or sub-context the sample belongs to. Empty when the BMC sent no
    /// OEM context.
    pub context: String,
    pub label: String,
    /// The sampled value, preserved verbatim as the BMC sent it.
    pub value: String,
    /// Owning device's system id.
    #[serde(rename = "System")]
    pub system_id: String,
    pub host_name: String,
    /// RFC3339; either BMC-supplied or the parse time.
    pub timestamp: String,
}

impl DataValue {
    /// RFC3339 parse tolerating the bare `+0000` offset spelling some
    /// firmware emits.
    pub fn parsed_timestamp(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .or_else(|_| DateTime::parse_from_rfc3339(&self.timestamp.replace("+0000", "Z")))
            .ok()
    }

    /// The reading as a float, when it is one.
    pub fn float_value(&self) -> Option<f64> {
        self.value.trim().parse().ok()
    }
}

/// One lifecycle alert entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventValue {
    pub event_type: String,
    pub event_id: String,
    pub event_timestamp: String,
    pub member_id: String,
    /// OK | Warning | Critical | ...
    pub message_severity: String,
    pub message: String,
    pub message_id: String,
    pub message_args: Vec<String>,
    /// Flattened `@odata.id` of the originating resource.
    pub origin_of_condition: String,
}

/// One parsed report or alert batch, stamped with the owning device's host
/// descriptors. Published exactly once to every registered topic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DataGroup {
    #[serde(rename = "ID")]
    pub id: String,
    pub label: String,
    pub sequence: String,
    #[serde(rename = "System")]
    pub system_id: String,
    pub host_name: String,
    pub model: String,
    #[serde(rename = "SKU")]
    pub sku: String,
    #[serde(rename = "FQDN")]
    pub fqdn: String,
    pub firmware_version: String,
    pub image_id: String,
    pub timestamp: String,
    pub values: Vec<DataValue>,
    pub events: Vec<EventValue>,
}

/// Lifecycle of a device monitor, as surfaced to the admin UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerState {
    Starting,
    Running,
    #[serde(rename = "Telemetry Service Not Found")]
    TelemetryNotFound,
    #[serde(rename = "Connection Failed")]
    ConnectionFailed,
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::Starting
    }
}

/// One live device monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataProducer {
    pub host_name: String,
    pub username: String,
    pub state: ProducerState,
    pub last_event: DateTime<Utc>,
}
