//! Eventer: typed event writes over a pipeline broker
//!
//! Construction turns an [`EventerConfig`] into broker nodes and pipelines:
//! one shared JSON formatter, one sink node per configured sink, and one
//! pipeline per (sink, subscribed type). Audit and observation pipelines
//! run through a per-sink gate (`gate -> formatter -> sink`) so multi-step
//! operations become one record; error and system pipelines are
//! `formatter -> sink`.
//!
//! Construct at most one `Eventer` per process: stderr sinks of different
//! eventers do not share a lock.

use crate::broker::{Broker, Pipeline, PipelineBroker};
use crate::config::{DeliveryGuarantee, EventerConfig, SinkConfig, SinkType};
use crate::error::{EventError, Result};
use crate::id::new_id;
use crate::node::{FileSink, GatedFilter, JsonFormatter, Node, NodeId, SerializedWriter, WriterSink};
use crate::retry::{retry_send, BackoffPolicy, STD_RETRY_COUNT};
use crate::types::{Audit, ErrorEvent, EventType, Observation, Payload, SysEvent};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builder for [`Eventer`]
pub struct EventerBuilder {
    config: EventerConfig,
    now: Option<DateTime<Utc>>,
    broker: Option<Arc<dyn Broker>>,
    console: Option<SerializedWriter>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl EventerBuilder {
    /// Freeze the broker clock at `now`
    pub fn now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Use `broker` instead of a fresh [`PipelineBroker`]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Writer shared by every stderr sink (defaults to process stderr)
    pub fn console_writer(mut self, writer: SerializedWriter) -> Self {
        self.console = Some(writer);
        self
    }

    pub fn retry(mut self, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        self.max_attempts = max_attempts;
        self.backoff = backoff;
        self
    }

    /// Validate the configuration and register every node and pipeline
    ///
    /// Any failure aborts construction; no partially wired eventer is
    /// returned.
    pub fn build(self) -> Result<Eventer> {
        let mut config = self.config;
        config.validate()?;
        if config.sinks.is_empty() {
            config.sinks.push(SinkConfig::default_sink());
        }
        if self.max_attempts == 0 {
            return Err(EventError::InvalidParameter(
                "max attempts must be at least 1".to_string(),
            ));
        }

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(PipelineBroker::new()));
        if let Some(now) = self.now {
            broker.stop_time_at(now);
        }
        let console = self.console.unwrap_or_else(SerializedWriter::stderr);

        let fmt_id = new_id("json")?;
        broker.register_node(fmt_id.clone(), Arc::new(JsonFormatter::new()))?;

        let mut file_destinations = HashSet::new();
        let mut sinks: Vec<(NodeId, &SinkConfig)> = Vec::with_capacity(config.sinks.len());
        for sink in &config.sinks {
            let (id, node) = match sink.sink_type {
                SinkType::Stderr => {
                    let id = new_id("stderr")?;
                    let node: Arc<dyn Node> =
                        Arc::new(WriterSink::new(id.clone(), sink.format.as_str(), console.clone()));
                    (id, node)
                }
                SinkType::File => {
                    let dest = PathBuf::from(&sink.path).join(&sink.file_name);
                    if !file_destinations.insert(dest.clone()) {
                        return Err(EventError::Config(format!(
                            "duplicate file sink: {}",
                            dest.display()
                        )));
                    }
                    let node: Arc<dyn Node> = Arc::new(
                        FileSink::new(sink.format.as_str(), &sink.path, sink.file_name.as_str())
                            .with_max_bytes(sink.rotate_bytes)
                            .with_max_duration(sink.rotate_duration())
                            .with_max_files(sink.rotate_max_files),
                    );
                    (new_id("file")?, node)
                }
            };
            broker.register_node(id.clone(), node)?;
            tracing::debug!(sink = %sink.name, node = %id, sink_type = ?sink.sink_type, "Sink registered");
            sinks.push((id, sink));
        }

        let subscribed = |t: EventType| {
            sinks
                .iter()
                .filter(|(_, s)| s.subscribes_to(t))
                .map(|(id, _)| id)
                .collect::<Vec<_>>()
        };
        for (t, enabled) in [
            (EventType::Audit, config.audit_enabled),
            (EventType::Observation, config.observations_enabled),
            (EventType::System, config.sys_events_enabled),
        ] {
            if enabled && subscribed(t).is_empty() {
                return Err(EventError::InvalidParameter(format!(
                    "{} events enabled but no sink defined for them",
                    t
                )));
            }
        }

        let mut pipelines: BTreeMap<EventType, Vec<Pipeline>> = BTreeMap::new();
        let mut gates = Vec::new();
        for t in EventType::CONCRETE {
            for sink_id in subscribed(t) {
                let node_ids = match t {
                    EventType::Audit | EventType::Observation => {
                        let gate_id = new_id(&format!("gated-{}", t))?;
                        broker.register_node(gate_id.clone(), Arc::new(GatedFilter::new(config.gate.clone())))?;
                        gates.push(gate_id.clone());
                        vec![gate_id, fmt_id.clone(), sink_id.clone()]
                    }
                    _ => vec![fmt_id.clone(), sink_id.clone()],
                };
                let pipeline = Pipeline {
                    event_type: t,
                    pipeline_id: new_id(&format!("{}-pipeline", t))?,
                    node_ids,
                };
                broker.register_pipeline(pipeline.clone())?;
                pipelines.entry(t).or_default().push(pipeline);
            }

            let sink_count = pipelines.get(&t).map(Vec::len).unwrap_or(0);
            let threshold = match config.delivery(t) {
                DeliveryGuarantee::Enforced => sink_count,
                DeliveryGuarantee::BestEffort => 0,
            };
            broker.set_success_threshold(t, threshold)?;
        }

        tracing::info!(
            sinks = config.sinks.len(),
            gates = gates.len(),
            audit_enabled = config.audit_enabled,
            observations_enabled = config.observations_enabled,
            sys_events_enabled = config.sys_events_enabled,
            "Eventer initialized"
        );

        Ok(Eventer {
            broker,
            audit_enabled: AtomicBool::new(config.audit_enabled),
            observations_enabled: AtomicBool::new(config.observations_enabled),
            sys_events_enabled: AtomicBool::new(config.sys_events_enabled),
            config,
            gates,
            pipelines,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
        })
    }
}

/// Entry point for writing audit, observation, error and system events
pub struct Eventer {
    broker: Arc<dyn Broker>,
    config: EventerConfig,
    audit_enabled: AtomicBool,
    observations_enabled: AtomicBool,
    sys_events_enabled: AtomicBool,
    /// Gate node ids, flushed at shutdown
    gates: Vec<NodeId>,
    pipelines: BTreeMap<EventType, Vec<Pipeline>>,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl Eventer {
    pub fn new(config: EventerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: EventerConfig) -> EventerBuilder {
        EventerBuilder {
            config,
            now: None,
            broker: None,
            console: None,
            max_attempts: STD_RETRY_COUNT,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Write an audit event; a no-op while audit events are disabled
    pub async fn write_audit(&self, ctx: &CancellationToken, event: Audit) -> Result<()> {
        const OP: &str = "Eventer::write_audit";
        require_op(OP, &event.op)?;
        if !self.audit_enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.send(ctx, OP, EventType::Audit, event.into()).await
    }

    /// Write an observation; request info, version and op are stamped into
    /// a copy at send time
    pub async fn write_observation(&self, ctx: &CancellationToken, event: Observation) -> Result<()> {
        const OP: &str = "Eventer::write_observation";
        require_op(OP, &event.op)?;
        if !self.observations_enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let stamped = event.stamped().map_err(|e| EventError::Write {
            op: OP,
            source: Box::new(e.into()),
        })?;
        self.send(ctx, OP, EventType::Observation, stamped.into()).await
    }

    /// Write an error event; never disabled, always delivered to every
    /// error sink
    pub async fn write_error(&self, ctx: &CancellationToken, event: ErrorEvent) -> Result<()> {
        const OP: &str = "Eventer::write_error";
        require_op(OP, &event.op)?;
        self.send(ctx, OP, EventType::Error, event.into()).await
    }

    pub async fn write_sys_event(&self, ctx: &CancellationToken, event: SysEvent) -> Result<()> {
        const OP: &str = "Eventer::write_sys_event";
        require_op(OP, &event.op)?;
        if !self.sys_events_enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.send(ctx, OP, EventType::System, event.into()).await
    }

    async fn send(&self, ctx: &CancellationToken, op: &'static str, event_type: EventType, payload: Payload) -> Result<()> {
        let broker = &self.broker;
        let result = retry_send(ctx, self.max_attempts, &self.backoff, || {
            broker.send(ctx, event_type, payload.clone())
        })
        .await;

        match result {
            Ok(status) => {
                for warning in &status.warnings {
                    tracing::warn!(op, event_type = %event_type, warning = %warning, "Event delivered with sink failures");
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(op, event_type = %event_type, error = %e, "Failed to send event");
                Err(EventError::Write {
                    op,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Reopen every node; call on SIGHUP after external log rotation
    pub async fn reopen(&self, ctx: &CancellationToken) -> Result<()> {
        self.broker.reopen(ctx).await
    }

    /// Release every gate's buffered correlations downstream
    ///
    /// Call at shutdown. Every gate is attempted; the first error is
    /// returned.
    pub async fn flush_nodes(&self, ctx: &CancellationToken) -> Result<()> {
        let mut first_err = None;
        for gate in &self.gates {
            if let Err(e) = self.broker.flush_node(ctx, gate).await {
                tracing::error!(node = %gate, error = %e, "Failed to flush gate");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(EventError::Write {
                op: "Eventer::flush_nodes",
                source: Box::new(e),
            }),
            None => Ok(()),
        }
    }

    pub fn set_audit_enabled(&self, enabled: bool) {
        self.audit_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_observations_enabled(&self, enabled: bool) {
        self.observations_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_sys_events_enabled(&self, enabled: bool) {
        self.sys_events_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn audit_delivery_guaranteed(&self) -> bool {
        self.config.audit_delivery == DeliveryGuarantee::Enforced
    }

    pub fn observation_delivery_guaranteed(&self) -> bool {
        self.config.observation_delivery == DeliveryGuarantee::Enforced
    }

    /// The configuration in effect, including toggled enable flags
    pub fn config(&self) -> EventerConfig {
        EventerConfig {
            audit_enabled: self.audit_enabled.load(Ordering::Relaxed),
            observations_enabled: self.observations_enabled.load(Ordering::Relaxed),
            sys_events_enabled: self.sys_events_enabled.load(Ordering::Relaxed),
            ..self.config.clone()
        }
    }

    /// Pipelines registered for `event_type`
    pub fn pipelines(&self, event_type: EventType) -> &[Pipeline] {
        self.pipelines
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Ids of the gate nodes
    pub fn gates(&self) -> &[NodeId] {
        &self.gates
    }
}

impl std::fmt::Debug for Eventer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventer")
            .field("config", &self.config())
            .field("gates", &self.gates)
            .field("pipelines", &self.pipelines)
            .finish_non_exhaustive()
    }
}

fn require_op(op: &'static str, event_op: &str) -> Result<()> {
    if event_op.trim().is_empty() {
        return Err(EventError::Write {
            op,
            source: Box::new(EventError::InvalidParameter(
                "missing operation".to_string(),
            )),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::CaptureWriter;
    use crate::types::RequestInfo;
    use std::time::Duration;

    struct Harness {
        eventer: Eventer,
        broker: Arc<PipelineBroker>,
        console: CaptureWriter,
    }

    fn harness(config: EventerConfig) -> Harness {
        let broker = Arc::new(PipelineBroker::new());
        let console = CaptureWriter::default();
        let eventer = Eventer::builder(config)
            .broker(broker.clone())
            .console_writer(SerializedWriter::new(console.clone()))
            .retry(
                STD_RETRY_COUNT,
                BackoffPolicy {
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(5),
                },
            )
            .build()
            .unwrap();
        Harness {
            eventer,
            broker,
            console,
        }
    }

    fn all_enabled() -> EventerConfig {
        EventerConfig {
            audit_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_wiring() {
        let h = harness(EventerConfig::default());

        for t in EventType::CONCRETE {
            assert_eq!(h.eventer.pipelines(t).len(), 1, "{} pipelines", t);
        }
        assert_eq!(h.eventer.pipelines(EventType::Audit)[0].node_ids.len(), 3);
        assert!(h.eventer.pipelines(EventType::Audit)[0].node_ids[0].starts_with("gated-audit_"));
        assert_eq!(h.eventer.pipelines(EventType::Error)[0].node_ids.len(), 2);
        assert!(h.eventer.pipelines(EventType::System)[0].node_ids[1].starts_with("stderr_"));
        assert_eq!(h.eventer.gates().len(), 2);

        assert_eq!(h.broker.success_threshold(EventType::Error), 1);
        assert_eq!(h.broker.success_threshold(EventType::Audit), 0);
        assert!(!h.eventer.audit_delivery_guaranteed());
    }

    #[test]
    fn test_empty_sink_list_defaults_to_stderr() {
        let h = harness(EventerConfig {
            sinks: Vec::new(),
            ..Default::default()
        });
        assert_eq!(h.eventer.pipelines(EventType::System).len(), 1);
    }

    #[test]
    fn test_enforced_delivery_sets_threshold_to_sink_count() {
        let h = harness(EventerConfig {
            audit_enabled: true,
            audit_delivery: DeliveryGuarantee::Enforced,
            sinks: vec![
                SinkConfig::default_sink(),
                SinkConfig {
                    name: "audit-console".to_string(),
                    event_types: vec![EventType::Audit],
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        assert!(h.eventer.audit_delivery_guaranteed());
        assert_eq!(h.eventer.pipelines(EventType::Audit).len(), 2);
        assert_eq!(h.broker.success_threshold(EventType::Audit), 2);
        assert_eq!(h.broker.success_threshold(EventType::Error), 1);
    }

    #[test]
    fn test_enabled_type_without_sink_is_rejected() {
        let config = EventerConfig {
            audit_enabled: true,
            sinks: vec![SinkConfig {
                event_types: vec![EventType::Error, EventType::System, EventType::Observation],
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = Eventer::builder(config)
            .console_writer(SerializedWriter::new(CaptureWriter::default()))
            .build()
            .unwrap_err();
        assert!(err.is_invalid_parameter());
    }

    #[test]
    fn test_duplicate_file_sink_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        let config = EventerConfig {
            sinks: vec![
                SinkConfig::file("a", vec![EventType::Every], path.clone(), "events.log"),
                SinkConfig::file("b", vec![EventType::Error], path, "events.log"),
            ],
            ..Default::default()
        };
        let err = Eventer::new(config).unwrap_err();
        assert!(matches!(err, EventError::Config(_)));
    }

    #[tokio::test]
    async fn test_sys_event_reaches_console() {
        let h = harness(EventerConfig::default());
        let ctx = CancellationToken::new();

        h.eventer
            .write_sys_event(&ctx, SysEvent::new("server.Start").with_data("port", 9200))
            .await
            .unwrap();

        let lines = h.console.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "system");
        assert_eq!(lines[0]["payload"]["op"], "server.Start");
        assert_eq!(lines[0]["payload"]["data"]["port"], 9200);
    }

    #[tokio::test]
    async fn test_observation_is_stamped() {
        let h = harness(EventerConfig::default());
        let ctx = CancellationToken::new();

        let obs = Observation::new("req-1", "auth.Authenticate")
            .with_request_info(RequestInfo::new("req-1"))
            .with_detail("user", "alice")
            .flushing();
        h.eventer.write_observation(&ctx, obs).await.unwrap();

        let lines = h.console.lines();
        assert_eq!(lines.len(), 1);
        let inner = &lines[0]["payload"]["events"][0];
        assert_eq!(inner["detail"]["op"], "auth.Authenticate");
        assert_eq!(inner["header"]["version"], crate::types::EVENT_VERSION);
        assert_eq!(inner["header"]["request_info"]["id"], "req-1");
    }

    #[tokio::test]
    async fn test_missing_op_is_rejected_before_send() {
        let h = harness(all_enabled());
        let ctx = CancellationToken::new();

        let err = h.eventer.write_audit(&ctx, Audit::new("req", "")).await.unwrap_err();
        assert!(err.is_invalid_parameter());
        assert!(err.to_string().starts_with("Eventer::write_audit"));

        let err = h.eventer.write_error(&ctx, ErrorEvent::new("", "boom")).await.unwrap_err();
        assert!(err.is_invalid_parameter());
        assert!(h.console.contents().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_types_are_noops() {
        let h = harness(EventerConfig::default());
        let ctx = CancellationToken::new();

        h.eventer
            .write_audit(&ctx, Audit::new("req", "op").flushing())
            .await
            .unwrap();
        assert!(h.console.contents().is_empty());

        h.eventer.set_audit_enabled(true);
        h.eventer
            .write_audit(&ctx, Audit::new("req", "op").flushing())
            .await
            .unwrap();
        assert_eq!(h.console.lines().len(), 1);

        h.eventer.set_sys_events_enabled(false);
        h.eventer.write_sys_event(&ctx, SysEvent::new("op")).await.unwrap();
        assert_eq!(h.console.lines().len(), 1);

        h.eventer
            .write_error(&ctx, ErrorEvent::new("op", "boom"))
            .await
            .unwrap();
        assert_eq!(h.console.lines().len(), 2);

        let config = h.eventer.config();
        assert!(config.audit_enabled);
        assert!(!config.sys_events_enabled);
    }

    #[tokio::test]
    async fn test_flush_nodes_releases_open_correlations() {
        let h = harness(all_enabled());
        let ctx = CancellationToken::new();

        h.eventer.write_audit(&ctx, Audit::new("req-7", "step.one")).await.unwrap();
        h.eventer.write_audit(&ctx, Audit::new("req-7", "step.two")).await.unwrap();
        assert!(h.console.contents().is_empty());

        h.eventer.flush_nodes(&ctx).await.unwrap();
        let lines = h.console.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "audit");
        assert_eq!(lines[0]["payload"]["id"], "req-7");
        assert_eq!(lines[0]["payload"]["events"].as_array().unwrap().len(), 2);

        h.eventer.flush_nodes(&ctx).await.unwrap();
        assert_eq!(h.console.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_best_effort_sink_failure_is_not_an_error() {
        let h = harness(EventerConfig::default());
        h.console.fail.store(true, Ordering::SeqCst);
        let ctx = CancellationToken::new();

        h.eventer.write_sys_event(&ctx, SysEvent::new("op")).await.unwrap();

        let err = h
            .eventer
            .write_error(&ctx, ErrorEvent::new("op", "boom"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("Eventer::write_error"));
    }

    #[tokio::test]
    async fn test_frozen_clock_stamps_records() {
        let frozen = DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let console = CaptureWriter::default();
        let eventer = Eventer::builder(EventerConfig::default())
            .now(frozen)
            .console_writer(SerializedWriter::new(console.clone()))
            .build()
            .unwrap();

        eventer
            .write_sys_event(&CancellationToken::new(), SysEvent::new("op"))
            .await
            .unwrap();
        assert_eq!(console.lines()[0]["created_at"], "2024-05-06T07:08:09Z");
    }
}
