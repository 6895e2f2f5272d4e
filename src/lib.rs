//! # audit-eventer
//!
//! In-process audit and observability event pipeline.
//!
//! ## Overview
//!
//! `audit-eventer` routes typed events (audit, observation, error, system)
//! through pipelines of nodes: a gate that merges the sub-events of one
//! operation, a JSON formatter, and a sink (stderr or a rotating file).
//! Per-type delivery guarantees decide whether a sink failure is an error
//! or a warning; transient failures are retried with exponential backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audit_eventer::{Eventer, EventerConfig, SysEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> audit_eventer::Result<()> {
//! // One stderr sink subscribed to every event type
//! let eventer = Eventer::new(EventerConfig::default())?;
//!
//! let ctx = CancellationToken::new();
//! eventer
//!     .write_sys_event(&ctx, SysEvent::new("server.Start").with_data("port", 9200))
//!     .await?;
//!
//! // Release buffered audit/observation correlations before exit
//! eventer.flush_nodes(&ctx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Node** trait: formatter, gate, and sink stages
//! - **Broker** trait: node/pipeline registry and concurrent send
//! - **Eventer**: builds pipelines from config, typed writes with retry
//! - **sys**: the process-wide eventer and free write helpers

pub mod broker;
pub mod config;
pub mod error;
pub mod eventer;
pub mod id;
pub mod node;
pub mod retry;
pub mod sys;
pub mod types;

// Re-export core types
pub use broker::{Broker, Pipeline, PipelineBroker};
pub use config::{DeliveryGuarantee, EventerConfig, GateConfig, SinkConfig, SinkFormat, SinkType};
pub use error::{EventError, Result};
pub use eventer::{Eventer, EventerBuilder};
pub use id::new_id;
pub use node::{FileSink, GatedFilter, JsonFormatter, Node, NodeId, NodeKind, SerializedWriter, WriterSink};
pub use retry::{retry_send, BackoffPolicy, STD_RETRY_COUNT};
pub use sys::{init_sys_eventer, sys_eventer, InitOptions};
pub use types::{
    Audit, ErrorEvent, Event, EventType, GatedBatch, Observation, Payload, RequestInfo, SinkOutcome,
    Status, SysEvent,
};
