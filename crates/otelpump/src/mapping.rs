//! The Redfish-to-OTLP mapping manifest.
//!
//! Loaded once at startup from YAML. For every metric report and Redfish
//! `MetricId` it supplies the OTLP metric name, value type, unit,
//! description, the scope-attribute template for the report (placeholders
//! `var-FQDD` and `var-Timestamp`), fixed data-point attributes, and, for
//! enumerated readings, the string-to-int map.
//!
//! Metric ids listed under `repeatedMetricIds` recur across reports with
//! different meanings, so they are stored only under
//! `{lower(report id)}:{metric id}` and never under the bare id.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to read mapping manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid mapping manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Double,
    String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Manifest {
    #[serde(default)]
    repeated_metric_ids: Vec<String>,
    #[serde(default)]
    metric_reports: BTreeMap<String, ReportMapping>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReportMapping {
    #[serde(default)]
    scope_attributes: BTreeMap<String, String>,
    #[serde(default)]
    metrics: Vec<MetricEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MetricEntry {
    redfish_name: String,
    otel_name: String,
    otel_type: ValueType,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default, rename = "enum")]
    enum_values: BTreeMap<String, i64>,
}

/// One resolved mapping entry.
#[derive(Debug, Clone)]
pub struct MetricMapping {
    pub name: String,
    pub value_type: ValueType,
    pub unit: String,
    pub description: String,
    /// Scope-attribute template of the owning report.
    pub scope_attributes: BTreeMap<String, String>,
    /// Fixed data-point attributes.
    pub attributes: BTreeMap<String, String>,
    /// Lower-cased reading string to gauge integer.
    pub enum_values: BTreeMap<String, i64>,
}

pub struct MappingTable {
    entries: HashMap<String, MetricMapping>,
}

impl MappingTable {
    pub fn load(path: &str) -> Result<Self, MappingError> {
        let raw = std::fs::read_to_string(path).map_err(|source| MappingError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(yaml: &str) -> Result<Self, MappingError> {
        let manifest: Manifest = serde_yaml::from_str(yaml)?;
        let mut entries = HashMap::new();

        for (report, mapping) in &manifest.metric_reports {
            for metric in &mapping.metrics {
                let key = if manifest.repeated_metric_ids.contains(&metric.redfish_name) {
                    format!("{}:{}", report.to_lowercase(), metric.redfish_name)
                } else {
                    metric.redfish_name.clone()
                };
                entries.insert(
                    key,
                    MetricMapping {
                        name: metric.otel_name.clone(),
                        value_type: metric.otel_type,
                        unit: metric.unit.clone(),
                        description: metric.description.clone(),
                        scope_attributes: mapping.scope_attributes.clone(),
                        attributes: metric.attributes.clone(),
                        enum_values: metric
                            .enum_values
                            .iter()
                            .map(|(reading, code)| (reading.to_lowercase(), *code))
                            .collect(),
                    },
                );
            }
        }
        Ok(Self { entries })
    }

    /// Look a metric id up, retrying under the report-prefixed key for ids
    /// that recur across reports.
    pub fn lookup(&self, report_id: &str, metric_id: &str) -> Option<&MetricMapping> {
        self.entries.get(metric_id).or_else(|| {
            self.entries
                .get(&format!("{}:{}", report_id.to_lowercase(), metric_id))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shipped() -> MappingTable {
        MappingTable::parse(include_str!("../mapping/redfish-otel.yaml")).unwrap()
    }

    #[test]
    fn shipped_manifest_parses() {
        let table = shipped();
        assert!(!table.is_empty());
        let gpu = table.lookup("GPUMetrics", "GPUMemoryUsage").unwrap();
        assert_eq!(gpu.name, "hw.gpu.memory.usage");
        assert_eq!(gpu.value_type, ValueType::Double);
    }

    #[test]
    fn enum_readings_are_lowercased() {
        let table = shipped();
        let link = table.lookup("NICStatistics", "LinkStatus").unwrap();
        assert_eq!(link.enum_values.get("down"), Some(&0));
        assert_eq!(link.enum_values.get("up"), Some(&1));
        assert!(link.enum_values.get("Down").is_none());

        let driver = table
            .lookup("FCPortStatistics", "FCStatOSDriverState")
            .unwrap();
        assert_eq!(driver.enum_values.get("not applicable"), Some(&1));

        let plain = table.lookup("NICStatistics", "RxBytes").unwrap();
        assert!(plain.enum_values.is_empty());
    }

    #[test]
    fn repeated_ids_are_stored_only_under_the_report_prefix() {
        let table = shipped();
        assert!(table.contains("nicsensor:TemperatureReading"));
        assert!(!table.contains("TemperatureReading"));
        // And resolve through the fallback path.
        assert!(table.lookup("NICSensor", "TemperatureReading").is_some());
        assert!(table.lookup("CPUSensor", "TemperatureReading").is_some());
        assert!(table.lookup("GPUMetrics", "TemperatureReading").is_none());
    }

    #[test]
    fn scope_templates_ride_along() {
        let table = shipped();
        let mapping = table.lookup("NICSensor", "TemperatureReading").unwrap();
        assert_eq!(
            mapping.scope_attributes.get("hw.parent").map(String::as_str),
            Some("var-FQDD")
        );
    }
}
