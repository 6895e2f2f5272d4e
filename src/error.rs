//! Error types for audit-eventer

use crate::types::EventType;
use thiserror::Error;

/// Errors that can occur in the event pipeline
#[derive(Debug, Error)]
pub enum EventError {
    /// Missing or conflicting argument, or a construction-time defect
    /// (duplicate node, unknown pipeline, threshold above sink count)
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration rejected by validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fewer sinks accepted the event than the success threshold requires
    #[error(
        "Failed to deliver {event_type} event: {succeeded} of {required} required sinks succeeded{}",
        format_failures(.failures)
    )]
    Delivery {
        event_type: EventType,
        succeeded: usize,
        required: usize,
        failures: Vec<String>,
    },

    /// A sink could not write a record
    #[error("Sink '{node}' failed: {reason}")]
    Sink {
        node: String,
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The randomness source failed while generating an identifier
    #[error("Failed to generate id: {0}")]
    Id(String),

    /// The caller's cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A typed write failed after retries; `op` names the writer
    #[error("{op}: {source}")]
    Write {
        op: &'static str,
        #[source]
        source: Box<EventError>,
    },
}

impl EventError {
    /// Whether the retry wrapper should try the send again.
    ///
    /// Only delivery-level failures are transient. Parameter and
    /// configuration defects will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EventError::Delivery { .. } | EventError::Sink { .. } | EventError::Io(_) => true,
            EventError::Write { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, an invalid-parameter error
    pub fn is_invalid_parameter(&self) -> bool {
        match self {
            EventError::InvalidParameter(_) => true,
            EventError::Write { source, .. } => source.is_invalid_parameter(),
            _ => false,
        }
    }
}

fn format_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(" ({})", failures.join("; "))
    }
}

/// Result type alias for event operations
pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let delivery = EventError::Delivery {
            event_type: EventType::Error,
            succeeded: 1,
            required: 2,
            failures: vec!["disk full".to_string()],
        };
        assert!(delivery.is_retryable());
        assert!(EventError::Sink {
            node: "stderr_abc".to_string(),
            reason: "closed".to_string()
        }
        .is_retryable());
        assert!(!EventError::InvalidParameter("missing op".to_string()).is_retryable());
        assert!(!EventError::Cancelled.is_retryable());
        assert!(!EventError::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_write_wrapper_keeps_classification() {
        let err = EventError::Write {
            op: "Eventer::write_audit",
            source: Box::new(EventError::InvalidParameter("missing op".to_string())),
        };
        assert!(err.is_invalid_parameter());
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("Eventer::write_audit: Invalid parameter"));
    }

    #[test]
    fn test_delivery_message_lists_failures() {
        let err = EventError::Delivery {
            event_type: EventType::Audit,
            succeeded: 0,
            required: 1,
            failures: vec!["file_a: denied".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("audit"));
        assert!(msg.contains("0 of 1"));
        assert!(msg.contains("file_a: denied"));
    }
}
