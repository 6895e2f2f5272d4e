//! Eventer configuration
//!
//! All types deserialize from camelCase JSON and are validated once, when
//! the eventer is built.

use crate::error::{EventError, Result};
use crate::types::EventType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where a sink writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    #[default]
    Stderr,
    File,
}

/// Record format a sink consumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    #[default]
    Json,
}

impl SinkFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkFormat::Json => "json",
        }
    }
}

/// Whether a send must reach every sink of its type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryGuarantee {
    /// Sink failures are logged as warnings
    #[default]
    BestEffort,
    /// Every subscribed sink must accept the event
    Enforced,
}

/// One sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SinkConfig {
    pub name: String,

    /// Subscribed event types; `*` subscribes to all of them
    pub event_types: Vec<EventType>,

    pub sink_type: SinkType,

    pub format: SinkFormat,

    /// Directory of a file sink
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// File name of a file sink
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file_name: String,

    /// Rotate the file before it exceeds this size (0 = no limit)
    pub rotate_bytes: u64,

    /// Rotate the file once it is this old
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate_duration_secs: Option<u64>,

    /// Rotated files to keep (0 = keep all)
    pub rotate_max_files: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            event_types: vec![EventType::Every],
            sink_type: SinkType::Stderr,
            format: SinkFormat::Json,
            path: String::new(),
            file_name: String::new(),
            rotate_bytes: 0,
            rotate_duration_secs: None,
            rotate_max_files: 0,
        }
    }
}

impl SinkConfig {
    /// A stderr sink subscribed to every event type
    pub fn default_sink() -> Self {
        Self::default()
    }

    /// A file sink for `event_types`
    pub fn file(
        name: impl Into<String>,
        event_types: Vec<EventType>,
        path: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event_types,
            sink_type: SinkType::File,
            path: path.into(),
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn rotate_duration(&self) -> Option<Duration> {
        self.rotate_duration_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Whether the sink subscribes to the concrete type `t`
    pub fn subscribes_to(&self, t: EventType) -> bool {
        self.event_types.iter().any(|s| s.expand().contains(&t))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EventError::Config("sink name is required".to_string()));
        }
        if self.event_types.is_empty() {
            return Err(EventError::Config(format!(
                "sink '{}' has no event types",
                self.name
            )));
        }
        match self.sink_type {
            SinkType::File => {
                if self.path.is_empty() {
                    return Err(EventError::Config(format!(
                        "file sink '{}' is missing a path",
                        self.name
                    )));
                }
                if self.file_name.is_empty() {
                    return Err(EventError::Config(format!(
                        "file sink '{}' is missing a file name",
                        self.name
                    )));
                }
            }
            SinkType::Stderr => {
                if !self.path.is_empty() || !self.file_name.is_empty() {
                    return Err(EventError::Config(format!(
                        "stderr sink '{}' cannot set a path or file name",
                        self.name
                    )));
                }
                if self.rotate_bytes > 0
                    || self.rotate_duration_secs.is_some()
                    || self.rotate_max_files > 0
                {
                    return Err(EventError::Config(format!(
                        "stderr sink '{}' cannot set rotation",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Limits on how long and how many correlations a gate holds open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GateConfig {
    /// Release a correlation this long after its first event (0 = never)
    pub expiration_secs: u64,

    /// Maximum simultaneously open correlations per gate (0 = unbounded)
    pub max_open: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 10,
            max_open: 1024,
        }
    }
}

impl GateConfig {
    pub fn expiration(&self) -> Option<Duration> {
        (self.expiration_secs > 0).then(|| Duration::from_secs(self.expiration_secs))
    }
}

/// Eventer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventerConfig {
    pub audit_enabled: bool,
    pub observations_enabled: bool,
    pub sys_events_enabled: bool,

    pub audit_delivery: DeliveryGuarantee,
    pub observation_delivery: DeliveryGuarantee,
    pub sys_delivery: DeliveryGuarantee,

    /// Sinks; an empty list means one stderr sink for every type
    pub sinks: Vec<SinkConfig>,

    pub gate: GateConfig,
}

impl Default for EventerConfig {
    fn default() -> Self {
        Self {
            audit_enabled: false,
            observations_enabled: true,
            sys_events_enabled: true,
            audit_delivery: DeliveryGuarantee::BestEffort,
            observation_delivery: DeliveryGuarantee::BestEffort,
            sys_delivery: DeliveryGuarantee::BestEffort,
            sinks: vec![SinkConfig::default_sink()],
            gate: GateConfig::default(),
        }
    }
}

impl EventerConfig {
    pub fn validate(&self) -> Result<()> {
        for sink in &self.sinks {
            sink.validate()?;
        }
        Ok(())
    }

    /// Delivery guarantee for a concrete type; errors are always enforced
    pub fn delivery(&self, t: EventType) -> DeliveryGuarantee {
        match t {
            EventType::Audit => self.audit_delivery,
            EventType::Observation => self.observation_delivery,
            EventType::System => self.sys_delivery,
            EventType::Error | EventType::Every => DeliveryGuarantee::Enforced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = EventerConfig::default();
        assert!(!c.audit_enabled);
        assert!(c.observations_enabled);
        assert!(c.sys_events_enabled);
        assert_eq!(c.sinks.len(), 1);
        assert_eq!(c.sinks[0].sink_type, SinkType::Stderr);
        assert_eq!(c.sinks[0].event_types, vec![EventType::Every]);
        assert_eq!(c.delivery(EventType::Error), DeliveryGuarantee::Enforced);
        assert_eq!(c.delivery(EventType::Audit), DeliveryGuarantee::BestEffort);
        c.validate().unwrap();
    }

    #[test]
    fn test_deserialize_camel_case() {
        let json = r#"{
            "auditEnabled": true,
            "auditDelivery": "enforced",
            "sinks": [{
                "name": "audit-file",
                "eventTypes": ["audit", "info"],
                "sinkType": "file",
                "path": "/var/log/eventer",
                "fileName": "audit.log",
                "rotateBytes": 1048576,
                "rotateDurationSecs": 3600,
                "rotateMaxFiles": 5
            }],
            "gate": { "maxOpen": 10 }
        }"#;

        let c: EventerConfig = serde_json::from_str(json).unwrap();
        assert!(c.audit_enabled);
        assert!(c.observations_enabled);
        assert_eq!(c.audit_delivery, DeliveryGuarantee::Enforced);
        assert_eq!(c.observation_delivery, DeliveryGuarantee::BestEffort);

        let s = &c.sinks[0];
        assert_eq!(s.event_types, vec![EventType::Audit, EventType::Observation]);
        assert_eq!(s.rotate_duration(), Some(Duration::from_secs(3600)));
        assert_eq!(s.format, SinkFormat::Json);

        assert_eq!(c.gate.max_open, 10);
        assert_eq!(c.gate.expiration_secs, 10);
        c.validate().unwrap();
    }

    #[test]
    fn test_subscribes_to() {
        let every = SinkConfig::default_sink();
        for t in EventType::CONCRETE {
            assert!(every.subscribes_to(t));
        }

        let audit_only = SinkConfig::file("a", vec![EventType::Audit], "/tmp", "a.log");
        assert!(audit_only.subscribes_to(EventType::Audit));
        assert!(!audit_only.subscribes_to(EventType::Error));
    }

    #[test]
    fn test_validation_failures() {
        let mut s = SinkConfig::file("f", vec![EventType::Audit], "", "a.log");
        assert!(matches!(s.validate(), Err(EventError::Config(_))));

        s.path = "/tmp".to_string();
        s.file_name = String::new();
        assert!(s.validate().is_err());

        let mut s = SinkConfig::default_sink();
        s.event_types.clear();
        assert!(s.validate().is_err());

        let mut s = SinkConfig::default_sink();
        s.file_name = "x.log".to_string();
        assert!(s.validate().is_err());

        let mut s = SinkConfig::default_sink();
        s.rotate_max_files = 3;
        assert!(s.validate().is_err());

        let mut s = SinkConfig::default_sink();
        s.name = " ".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_gate_expiration() {
        assert_eq!(GateConfig::default().expiration(), Some(Duration::from_secs(10)));
        let never = GateConfig {
            expiration_secs: 0,
            max_open: 0,
        };
        assert_eq!(never.expiration(), None);
    }
}
