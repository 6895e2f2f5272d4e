//! JSON formatter node

use super::{Node, NodeKind};
use crate::error::Result;
use crate::types::{Event, EventType, Payload};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Format name under which the JSON record is stored on the event
pub const JSON_FORMAT: &str = "json";

/// One line of a JSON sink
#[derive(Serialize)]
struct Record<'a> {
    created_at: &'a DateTime<Utc>,
    #[serde(rename = "type")]
    event_type: EventType,
    payload: &'a Payload,
}

/// Serializes events to newline-terminated JSON
///
/// Stateless; one instance is shared by every pipeline of an eventer.
#[derive(Debug, Default, Clone)]
pub struct JsonFormatter;

impl JsonFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(&self, event: &Event) -> Result<Bytes> {
        let mut line = serde_json::to_vec(&Record {
            created_at: &event.created_at,
            event_type: event.event_type,
            payload: &event.payload,
        })?;
        line.push(b'\n');
        Ok(Bytes::from(line))
    }
}

#[async_trait]
impl Node for JsonFormatter {
    async fn process(&self, mut event: Event) -> Result<Vec<Event>> {
        let data = self.format(&event)?;
        event.set_formatted(JSON_FORMAT, data);
        Ok(vec![event])
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Formatter
    }
}
