//! Gauge registry shared by the Prometheus scrape pump and the
//! VictoriaMetrics push pump.
//!
//! Values with an FQDD-like context (it contains a `.`) become
//! `PowerEdge_{id}{ServiceTag, FQDD}`; plain contexts become subsystemed
//! gauges `PowerEdge_{context}_{id}{ServiceTag}` with spaces stripped from
//! the context.

use std::collections::HashMap;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use tracing::warn;

use telebus::DataValue;

const NAMESPACE: &str = "PowerEdge";

/// Readings that are not numbers fall back onto the status vocabulary:
/// `Up`/`Operational` gauge to 1, everything else to 0.
pub fn float_reading(value: &str) -> f64 {
    match value.trim().parse::<f64>() {
        Ok(float) => float,
        Err(_) => match value.trim() {
            "Up" | "Operational" => 1.0,
            _ => 0.0,
        },
    }
}

pub struct GaugeRegistry {
    registry: Registry,
    fqdd: HashMap<String, GaugeVec>,
    subsystem: HashMap<String, HashMap<String, GaugeVec>>,
}

impl Default for GaugeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl GaugeRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            fqdd: HashMap::new(),
            subsystem: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Set the gauge for one value, creating and registering it on first
    /// sight.
    pub fn observe(&mut self, value: &DataValue) {
        if value.context.contains('.') {
            self.observe_fqdd(value);
        } else {
            self.observe_subsystem(value);
        }
    }

    pub fn observe_group(&mut self, values: &[DataValue]) {
        for value in values {
            self.observe(value);
        }
    }

    fn observe_fqdd(&mut self, value: &DataValue) {
        let name = sanitize(&value.id);
        if !self.fqdd.contains_key(&name) {
            let opts = Opts::new(name.clone(), format!("{} reading", value.id))
                .namespace(NAMESPACE);
            let gauge = match GaugeVec::new(opts, &["ServiceTag", "FQDD"]) {
                Ok(gauge) => gauge,
                Err(err) => {
                    warn!(metric = %value.id, error = %err, "failed to create gauge");
                    return;
                }
            };
            if let Err(err) = self.registry.register(Box::new(gauge.clone())) {
                warn!(metric = %value.id, error = %err, "failed to register gauge");
                return;
            }
            self.fqdd.insert(name.clone(), gauge);
        }
        self.fqdd[&name]
            .with_label_values(&[&value.system_id, &value.context])
            .set(float_reading(&value.value));
    }

    fn observe_subsystem(&mut self, value: &DataValue) {
        let context = value.context.replace(' ', "");
        let name = sanitize(&value.id);
        let by_id = self.subsystem.entry(context.clone()).or_default();
        if !by_id.contains_key(&name) {
            let opts = Opts::new(name.clone(), format!("{} reading", value.id))
                .namespace(NAMESPACE)
                .subsystem(sanitize(&context));
            let gauge = match GaugeVec::new(opts, &["ServiceTag"]) {
                Ok(gauge) => gauge,
                Err(err) => {
                    warn!(metric = %value.id, error = %err, "failed to create gauge");
                    return;
                }
            };
            if let Err(err) = self.registry.register(Box::new(gauge.clone())) {
                warn!(metric = %value.id, error = %err, "failed to register gauge");
                return;
            }
            by_id.insert(name.clone(), gauge);
        }
        self.subsystem[&context][&name]
            .with_label_values(&[&value.system_id])
            .set(float_reading(&value.value));
    }

    /// The whole registry in text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!(error = %err, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Metric identifiers occasionally carry characters the exposition format
/// does not allow.
fn sanitize(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == ':' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(id: &str, context: &str, reading: &str) -> DataValue {
        DataValue {
            id: id.to_string(),
            context: context.to_string(),
            value: reading.to_string(),
            system_id: "7GHX123".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn fqdd_contexts_label_and_plain_contexts_subsystem() {
        let mut gauges = GaugeRegistry::new();
        gauges.observe(&value("Temperature", "CPU.Socket.1", "42"));
        gauges.observe(&value("Temperature", "Subsystem", "21"));

        let rendered = gauges.render();
        assert!(
            rendered.contains("PowerEdge_Temperature{FQDD=\"CPU.Socket.1\",ServiceTag=\"7GHX123\"} 42"),
            "missing FQDD gauge in:\n{rendered}"
        );
        assert!(
            rendered.contains("PowerEdge_Subsystem_Temperature{ServiceTag=\"7GHX123\"} 21"),
            "missing subsystem gauge in:\n{rendered}"
        );
    }

    #[test]
    fn repeated_observations_update_in_place() {
        let mut gauges = GaugeRegistry::new();
        gauges.observe(&value("Temperature", "CPU.Socket.1", "42"));
        gauges.observe(&value("Temperature", "CPU.Socket.1", "43"));
        let rendered = gauges.render();
        assert!(rendered.contains("} 43"));
        assert!(!rendered.contains("} 42"));
    }

    #[test]
    fn status_vocabulary_maps_to_binary() {
        assert_eq!(float_reading("42.5"), 42.5);
        assert_eq!(float_reading("Up"), 1.0);
        assert_eq!(float_reading("Operational"), 1.0);
        assert_eq!(float_reading("Down"), 0.0);
        assert_eq!(float_reading("Degraded"), 0.0);
    }

    #[test]
    fn spaces_are_stripped_from_subsystem_contexts() {
        let mut gauges = GaugeRegistry::new();
        gauges.observe(&value("Usage", "System Board", "3"));
        assert!(gauges.render().contains("PowerEdge_SystemBoard_Usage"));
    }

    #[test]
    fn awkward_identifiers_are_sanitized() {
        assert_eq!(sanitize("RxBytes"), "RxBytes");
        assert_eq!(sanitize("Sensors__Reading"), "Sensors__Reading");
        assert_eq!(sanitize("1Voltage"), "_1Voltage");
        assert_eq!(sanitize("Power-Draw"), "Power_Draw");
    }
}
