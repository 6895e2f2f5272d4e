//! Broker: node registry, pipelines, and send-time routing
//!
//! Every pipeline registered for an event type runs on each send of that
//! type. Pipelines run concurrently; nodes within a pipeline run strictly
//! in order. The send succeeds when at least the configured success
//! threshold of sinks accepted (or a gate held back) the event.
//!
//! The threshold is an aggregate: with several sinks per type a failed
//! send reports how many sinks succeeded and the failure reasons, not a
//! per-sink guarantee.
//!
//! When a chain fails after a filter released events, those events are
//! handed back to the filter with `Node::restore`. A retried send (or the
//! next flush) releases them again, so delivery is at least once.

use crate::error::{EventError, Result};
use crate::node::{Node, NodeId, NodeKind};
use crate::types::{Event, EventType, Payload, SinkOutcome, Status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Pipeline identifier, unique within a broker
pub type PipelineId = String;

/// An ordered node chain bound to one event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub event_type: EventType,
    pub pipeline_id: PipelineId,
    pub node_ids: Vec<NodeId>,
}

/// Broker operations the eventer depends on
///
/// `PipelineBroker` is the implementation; tests substitute their own to
/// script send outcomes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Route `payload` through every pipeline of `event_type`
    async fn send(&self, ctx: &CancellationToken, event_type: EventType, payload: Payload) -> Result<Status>;

    /// Reopen every registered node
    async fn reopen(&self, ctx: &CancellationToken) -> Result<()>;

    /// Flush node `id` and forward what it releases down its pipelines
    async fn flush_node(&self, ctx: &CancellationToken, id: &str) -> Result<Status>;

    /// Freeze the clock used to stamp events
    fn stop_time_at(&self, now: DateTime<Utc>);

    fn register_node(&self, id: NodeId, node: Arc<dyn Node>) -> Result<()>;

    fn register_pipeline(&self, def: Pipeline) -> Result<()>;

    fn set_success_threshold(&self, event_type: EventType, threshold: usize) -> Result<()>;
}

type Chain = Vec<(NodeId, Arc<dyn Node>)>;

#[derive(Default)]
struct Registry {
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    pipelines: BTreeMap<EventType, Vec<Pipeline>>,
    pipeline_ids: HashSet<PipelineId>,
    thresholds: HashMap<EventType, usize>,
}

impl Registry {
    fn resolve(&self, pipeline: &Pipeline) -> Result<Chain> {
        pipeline
            .node_ids
            .iter()
            .map(|id| {
                self.nodes
                    .get(id)
                    .map(|n| (id.clone(), n.clone()))
                    .ok_or_else(|| {
                        EventError::InvalidParameter(format!(
                            "pipeline '{}' references unregistered node '{}'",
                            pipeline.pipeline_id, id
                        ))
                    })
            })
            .collect()
    }

    /// Distinct sinks reachable from the pipelines of `event_type`
    fn sink_count(&self, event_type: EventType) -> usize {
        self.pipelines
            .get(&event_type)
            .map(|ps| {
                ps.iter()
                    .filter_map(|p| p.node_ids.last())
                    .collect::<BTreeSet<_>>()
                    .len()
            })
            .unwrap_or(0)
    }
}

/// The in-process broker
#[derive(Default)]
pub struct PipelineBroker {
    registry: RwLock<Registry>,
    frozen_now: RwLock<Option<DateTime<Utc>>>,
}

impl PipelineBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time, or the frozen time after `stop_time_at`
    pub fn now(&self) -> DateTime<Utc> {
        let frozen = *self.frozen_now.read().unwrap_or_else(PoisonError::into_inner);
        frozen.unwrap_or_else(Utc::now)
    }

    /// Pipelines registered for `event_type`
    pub fn pipelines(&self, event_type: EventType) -> Vec<Pipeline> {
        self.read()
            .pipelines
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn success_threshold(&self, event_type: EventType) -> usize {
        self.read().thresholds.get(&event_type).copied().unwrap_or(0)
    }

    pub fn node(&self, id: &str) -> Option<Arc<dyn Node>> {
        self.read().nodes.get(id).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve chains up front so no lock is held across node I/O
    fn chains(&self, event_type: EventType) -> Result<(Vec<Chain>, usize)> {
        let registry = self.read();
        let pipelines = registry
            .pipelines
            .get(&event_type)
            .filter(|ps| !ps.is_empty())
            .ok_or_else(|| {
                EventError::InvalidParameter(format!(
                    "no pipelines registered for {} events",
                    event_type
                ))
            })?;
        let chains = pipelines
            .iter()
            .map(|p| registry.resolve(p))
            .collect::<Result<Vec<_>>>()?;
        let threshold = registry.thresholds.get(&event_type).copied().unwrap_or(0);
        Ok((chains, threshold))
    }
}

/// Run `events` through `chain`, returning the sink id and its outcome
///
/// Cancellation is checked before each node; a node that has started is
/// never interrupted, so a record is never half-written. A failure, panic
/// or cancellation after a filter hands the filter's output back to it.
async fn run_chain(ctx: &CancellationToken, chain: &[(NodeId, Arc<dyn Node>)], events: Vec<Event>) -> Result<SinkOutcome> {
    let mut released: Vec<(&NodeId, &Arc<dyn Node>, Vec<Event>)> = Vec::new();
    let mut current = events;
    for (id, node) in chain {
        if current.is_empty() {
            return Ok(SinkOutcome::Filtered);
        }
        if ctx.is_cancelled() {
            restore_released(released).await;
            return Err(EventError::Cancelled);
        }
        let mut next = Vec::new();
        for event in current {
            let result = AssertUnwindSafe(node.process(event))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(EventError::Sink {
                        node: id.clone(),
                        reason: "node panicked".to_string(),
                    })
                });
            match result {
                Ok(out) => next.extend(out),
                Err(e) => {
                    restore_released(released).await;
                    return Ok(SinkOutcome::Failed(format!("{}: {}", id, e)));
                }
            }
        }
        match node.kind() {
            NodeKind::Sink => return Ok(SinkOutcome::Delivered),
            NodeKind::Filter if !next.is_empty() => released.push((id, node, next.clone())),
            _ => {}
        }
        current = next;
    }
    restore_released(released).await;
    Ok(SinkOutcome::Failed("pipeline ended without a sink".to_string()))
}

/// Hand undelivered events back to the filters that released them, last
/// filter first
async fn restore_released(released: Vec<(&NodeId, &Arc<dyn Node>, Vec<Event>)>) {
    for (id, node, events) in released.into_iter().rev() {
        if let Err(e) = node.restore(events).await {
            tracing::warn!(node = %id, error = %e, "Failed to restore undelivered events");
        }
    }
}

/// Run several chains concurrently, isolating panics to their own chain
async fn run_chains(ctx: &CancellationToken, runs: Vec<(NodeId, &[(NodeId, Arc<dyn Node>)], Vec<Event>)>) -> Result<Status> {
    let pending = runs.into_iter().map(|(sink_id, chain, events)| async move {
        let outcome = AssertUnwindSafe(run_chain(ctx, chain, events))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Ok(SinkOutcome::Failed("node panicked".to_string())));
        (sink_id, outcome)
    });

    let mut status = Status::default();
    let mut cancelled = false;
    for (sink_id, outcome) in join_all(pending).await {
        match outcome {
            Ok(outcome) => {
                merge_outcome(&mut status, sink_id, outcome);
            }
            Err(_) => cancelled = true,
        }
    }
    if cancelled {
        return Err(EventError::Cancelled);
    }
    Ok(status)
}

async fn restore_flushed(id: &str, node: &Arc<dyn Node>, released: Vec<Event>) {
    if let Err(e) = node.restore(released).await {
        tracing::warn!(node = %id, error = %e, "Failed to restore undelivered events");
    }
}

/// Two pipelines may share a sink; the sink fails if either run failed
fn merge_outcome(status: &mut Status, sink_id: NodeId, outcome: SinkOutcome) {
    let merged = match (status.sinks.remove(&sink_id), outcome) {
        (Some(SinkOutcome::Failed(r)), _) | (_, SinkOutcome::Failed(r)) => SinkOutcome::Failed(r),
        (Some(SinkOutcome::Delivered), _) | (_, SinkOutcome::Delivered) => SinkOutcome::Delivered,
        _ => SinkOutcome::Filtered,
    };
    status.sinks.insert(sink_id, merged);
}

#[async_trait]
impl Broker for PipelineBroker {
    async fn send(&self, ctx: &CancellationToken, event_type: EventType, payload: Payload) -> Result<Status> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        if event_type == EventType::Every {
            return Err(EventError::InvalidParameter(
                "cannot send an event of the wildcard type".to_string(),
            ));
        }
        let (chains, threshold) = self.chains(event_type)?;
        let event = Event::new(event_type, self.now(), payload);

        let runs = chains
            .iter()
            .map(|chain| {
                let sink_id = chain.last().map(|(id, _)| id.clone()).unwrap_or_default();
                (sink_id, chain.as_slice(), vec![event.clone()])
            })
            .collect();
        let mut status = run_chains(ctx, runs).await?;

        let succeeded = status.succeeded();
        let failures = status.failures();
        if succeeded < threshold {
            return Err(EventError::Delivery {
                event_type,
                succeeded,
                required: threshold,
                failures,
            });
        }
        status.warnings.extend(failures);
        Ok(status)
    }

    async fn reopen(&self, ctx: &CancellationToken) -> Result<()> {
        let nodes: Vec<(NodeId, Arc<dyn Node>)> = self
            .read()
            .nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.clone()))
            .collect();

        let mut first_err = None;
        for (id, node) in nodes {
            if ctx.is_cancelled() {
                return Err(EventError::Cancelled);
            }
            if let Err(e) = node.reopen().await {
                tracing::warn!(node = %id, error = %e, "Failed to reopen node");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_node(&self, ctx: &CancellationToken, id: &str) -> Result<Status> {
        let (node, chains) = {
            let registry = self.read();
            let node = registry.nodes.get(id).cloned().ok_or_else(|| {
                EventError::InvalidParameter(format!("node '{}' is not registered", id))
            })?;
            // the remainder of every pipeline that runs through this node
            let mut chains: Vec<(EventType, Chain)> = Vec::new();
            for (event_type, pipelines) in &registry.pipelines {
                for p in pipelines {
                    if let Some(pos) = p.node_ids.iter().position(|n| n == id) {
                        let rest = Pipeline {
                            event_type: *event_type,
                            pipeline_id: p.pipeline_id.clone(),
                            node_ids: p.node_ids[pos + 1..].to_vec(),
                        };
                        chains.push((*event_type, registry.resolve(&rest)?));
                    }
                }
            }
            (node, chains)
        };

        let released = node.flush(self.now()).await?;
        if released.is_empty() || chains.is_empty() {
            return Ok(Status::default());
        }

        let runs = chains
            .iter()
            .map(|(_, chain)| {
                let sink_id = chain.last().map(|(id, _)| id.clone()).unwrap_or_default();
                (sink_id, chain.as_slice(), released.clone())
            })
            .collect();
        let status = match run_chains(ctx, runs).await {
            Ok(status) => status,
            Err(e) => {
                restore_flushed(id, &node, released).await;
                return Err(e);
            }
        };

        let failures = status.failures();
        if !failures.is_empty() {
            restore_flushed(id, &node, released).await;
            return Err(EventError::Delivery {
                event_type: chains[0].0,
                succeeded: status.succeeded(),
                required: status.sinks.len(),
                failures,
            });
        }
        Ok(status)
    }

    fn stop_time_at(&self, now: DateTime<Utc>) {
        *self.frozen_now.write().unwrap_or_else(PoisonError::into_inner) = Some(now);
    }

    fn register_node(&self, id: NodeId, node: Arc<dyn Node>) -> Result<()> {
        let mut registry = self.write();
        if registry.nodes.contains_key(&id) {
            return Err(EventError::InvalidParameter(format!(
                "node '{}' is already registered",
                id
            )));
        }
        registry.nodes.insert(id, node);
        Ok(())
    }

    fn register_pipeline(&self, def: Pipeline) -> Result<()> {
        let mut registry = self.write();
        if def.event_type == EventType::Every {
            return Err(EventError::InvalidParameter(
                "pipelines must be bound to a concrete event type".to_string(),
            ));
        }
        if registry.pipeline_ids.contains(&def.pipeline_id) {
            return Err(EventError::InvalidParameter(format!(
                "pipeline '{}' is already registered",
                def.pipeline_id
            )));
        }
        let chain = registry.resolve(&def)?;
        match chain.last() {
            Some((_, node)) if node.kind() == NodeKind::Sink => {}
            Some((id, _)) => {
                return Err(EventError::InvalidParameter(format!(
                    "pipeline '{}' must end in a sink, ends in '{}'",
                    def.pipeline_id, id
                )))
            }
            None => {
                return Err(EventError::InvalidParameter(format!(
                    "pipeline '{}' has no nodes",
                    def.pipeline_id
                )))
            }
        }

        tracing::debug!(
            pipeline = %def.pipeline_id,
            event_type = %def.event_type,
            nodes = ?def.node_ids,
            "Pipeline registered"
        );
        registry.pipeline_ids.insert(def.pipeline_id.clone());
        registry.pipelines.entry(def.event_type).or_default().push(def);
        Ok(())
    }

    fn set_success_threshold(&self, event_type: EventType, threshold: usize) -> Result<()> {
        let mut registry = self.write();
        let sinks = registry.sink_count(event_type);
        if threshold > sinks {
            return Err(EventError::InvalidParameter(format!(
                "success threshold {} for {} events exceeds its {} sinks",
                threshold, event_type, sinks
            )));
        }
        registry.thresholds.insert(event_type, threshold);
        Ok(())
    }
}
