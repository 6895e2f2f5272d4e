//! Core event types for the audit-eventer pipeline
//!
//! Payloads serialize with snake_case field names, matching the records the
//! sinks write. Configuration types live in [`crate::config`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Operation name field in an event
pub const OP_FIELD: &str = "op";
/// Request info field in an event header
pub const REQUEST_INFO_FIELD: &str = "request_info";
/// Version field in an event header
pub const VERSION_FIELD: &str = "version";
/// Details field in an event
pub const DETAILS_FIELD: &str = "details";
/// Header field in an event
pub const HEADER_FIELD: &str = "header";
/// Id field in an event
pub const ID_FIELD: &str = "id";
/// Created-at field in a formatted record
pub const CREATED_AT_FIELD: &str = "created_at";
/// Type field in a formatted record
pub const TYPE_FIELD: &str = "type";

/// Schema version stamped into events
pub const EVENT_VERSION: &str = "v0.1";

/// Free-form key/value detail map carried by every payload
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Routing key for pipelines
///
/// `Every` is only meaningful in sink configuration, where it subscribes a
/// sink to all four concrete types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Audit,
    #[serde(alias = "info")]
    Observation,
    Error,
    System,
    #[serde(rename = "*", alias = "every")]
    Every,
}

impl EventType {
    /// The concrete types, in routing order
    pub const CONCRETE: [EventType; 4] = [
        EventType::Audit,
        EventType::Observation,
        EventType::Error,
        EventType::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Audit => "audit",
            EventType::Observation => "observation",
            EventType::Error => "error",
            EventType::System => "system",
            EventType::Every => "*",
        }
    }

    /// Expand a type to the concrete types it subscribes to
    pub fn expand(&self) -> &'static [EventType] {
        match self {
            EventType::Audit => &[EventType::Audit],
            EventType::Observation => &[EventType::Observation],
            EventType::Error => &[EventType::Error],
            EventType::System => &[EventType::System],
            EventType::Every => &EventType::CONCRETE,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information about the request that produced an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Request id, usually shared by every sub-event of one request
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl RequestInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// An audit record; a multi-step operation emits several under one id and
/// marks the last one with `flush`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Audit {
    pub id: String,
    pub version: String,
    pub op: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<RequestInfo>,
    #[serde(skip_serializing_if = "Details::is_empty")]
    pub details: Details,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flush: bool,
}

impl Audit {
    /// Create an audit record for correlation `id`
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: EVENT_VERSION.to_string(),
            op: op.into(),
            timestamp: Utc::now(),
            request_info: None,
            details: Details::new(),
            flush: false,
        }
    }

    pub fn with_request_info(mut self, info: RequestInfo) -> Self {
        self.request_info = Some(info);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Mark this record as the last one of its correlation
    pub fn flushing(mut self) -> Self {
        self.flush = true;
        self
    }
}

/// An observation (info) record
///
/// `op`, `version` and `request_info` are not serialized directly; the
/// eventer stamps them into `header`/`detail` on a copy right before sending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub id: String,
    #[serde(skip)]
    pub version: String,
    #[serde(skip)]
    pub op: String,
    #[serde(skip)]
    pub request_info: Option<RequestInfo>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Details::is_empty")]
    pub header: Details,
    #[serde(skip_serializing_if = "Details::is_empty")]
    pub detail: Details,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub flush: bool,
}

impl Observation {
    pub fn new(id: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: EVENT_VERSION.to_string(),
            op: op.into(),
            request_info: None,
            timestamp: Utc::now(),
            header: Details::new(),
            detail: Details::new(),
            flush: false,
        }
    }

    pub fn with_request_info(mut self, info: RequestInfo) -> Self {
        self.request_info = Some(info);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    pub fn flushing(mut self) -> Self {
        self.flush = true;
        self
    }

    /// Copy with request info and version stamped into the header and the
    /// operation name into the detail map
    pub fn stamped(&self) -> Result<Self, serde_json::Error> {
        let mut out = self.clone();
        let info = match &self.request_info {
            Some(info) => serde_json::to_value(info)?,
            None => serde_json::Value::Null,
        };
        out.header.insert(REQUEST_INFO_FIELD.to_string(), info);
        out.header
            .insert(VERSION_FIELD.to_string(), self.version.clone().into());
        out.detail.insert(OP_FIELD.to_string(), self.op.clone().into());
        Ok(out)
    }
}

/// An error record; always delivered with the guaranteed threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub id: String,
    pub version: String,
    pub op: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<RequestInfo>,
    #[serde(skip_serializing_if = "Details::is_empty")]
    pub info: Details,
}

impl ErrorEvent {
    pub fn new(op: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            id: format!("err-{}", uuid::Uuid::new_v4()),
            version: EVENT_VERSION.to_string(),
            op: op.into(),
            timestamp: Utc::now(),
            error: error.to_string(),
            request_info: None,
            info: Details::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_request_info(mut self, info: RequestInfo) -> Self {
        self.request_info = Some(info);
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }
}

/// A system record (lifecycle, configuration changes)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SysEvent {
    pub id: String,
    pub version: String,
    pub op: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Details::is_empty")]
    pub data: Details,
}

impl SysEvent {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            id: format!("sys-{}", uuid::Uuid::new_v4()),
            version: EVENT_VERSION.to_string(),
            op: op.into(),
            timestamp: Utc::now(),
            data: Details::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// The ordered sub-events of one correlation, emitted by a gate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatedBatch {
    pub id: String,
    pub events: Vec<Payload>,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Audit(Audit),
    Observation(Observation),
    Error(ErrorEvent),
    System(SysEvent),
    Batch(GatedBatch),
}

impl Payload {
    /// Correlation id used by gates; `None` means the payload is not gateable.
    ///
    /// Sub-events of one request share `request_info.id`; the event's own id
    /// is used when there is no request id.
    pub fn correlation_id(&self) -> Option<&str> {
        let (id, info) = match self {
            Payload::Audit(a) => (&a.id, &a.request_info),
            Payload::Observation(o) => (&o.id, &o.request_info),
            _ => return None,
        };
        match info {
            Some(info) if !info.id.is_empty() => Some(&info.id),
            _ => Some(id),
        }
    }

    /// Whether this payload closes its correlation
    pub fn is_terminal(&self) -> bool {
        match self {
            Payload::Audit(a) => a.flush,
            Payload::Observation(o) => o.flush,
            _ => false,
        }
    }

    /// Operation name, if the payload has one
    pub fn op(&self) -> Option<&str> {
        match self {
            Payload::Audit(a) => Some(&a.op),
            Payload::Observation(o) => Some(&o.op),
            Payload::Error(e) => Some(&e.op),
            Payload::System(s) => Some(&s.op),
            Payload::Batch(_) => None,
        }
    }
}

impl From<Audit> for Payload {
    fn from(v: Audit) -> Self {
        Payload::Audit(v)
    }
}

impl From<Observation> for Payload {
    fn from(v: Observation) -> Self {
        Payload::Observation(v)
    }
}

impl From<ErrorEvent> for Payload {
    fn from(v: ErrorEvent) -> Self {
        Payload::Error(v)
    }
}

impl From<SysEvent> for Payload {
    fn from(v: SysEvent) -> Self {
        Payload::System(v)
    }
}

impl From<GatedBatch> for Payload {
    fn from(v: GatedBatch) -> Self {
        Payload::Batch(v)
    }
}

/// The envelope threaded through a pipeline
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,

    /// Stamped by the broker's clock when the send starts
    pub created_at: DateTime<Utc>,

    pub payload: Payload,

    /// Serialized records keyed by format name, filled in by formatters
    formatted: HashMap<String, Bytes>,
}

impl Event {
    pub fn new(event_type: EventType, created_at: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            event_type,
            created_at,
            payload,
            formatted: HashMap::new(),
        }
    }

    /// Formatted record for `format`, if a formatter has produced one
    pub fn formatted(&self, format: &str) -> Option<&Bytes> {
        self.formatted.get(format)
    }

    pub fn set_formatted(&mut self, format: impl Into<String>, data: Bytes) {
        self.formatted.insert(format.into(), data);
    }
}

/// What happened to one sink during a send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// The sink durably wrote the record
    Delivered,
    /// A node earlier in the chain held the event back (a gate buffering)
    Filtered,
    /// The chain or the sink failed
    Failed(String),
}

impl SinkOutcome {
    /// Filtered counts as success: the event is accounted for by the gate
    pub fn is_success(&self) -> bool {
        !matches!(self, SinkOutcome::Failed(_))
    }
}

/// Result of one send across every pipeline of an event type
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// Outcome per sink node id
    pub sinks: BTreeMap<String, SinkOutcome>,

    /// Non-fatal problems: sink failures tolerated by the threshold
    pub warnings: Vec<String>,
}

impl Status {
    /// Number of sinks whose outcome counts towards the success threshold
    pub fn succeeded(&self) -> usize {
        self.sinks.values().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> Vec<String> {
        self.sinks
            .iter()
            .filter_map(|(id, o)| match o {
                SinkOutcome::Failed(reason) => Some(format!("{}: {}", id, reason)),
                _ => None,
            })
            .collect()
    }
}
