//! Gated filter: correlates the sub-events of one operation into one record
//!
//! Events carrying a correlation id are buffered per id. When the terminal
//! event of a correlation arrives, the whole buffer is forwarded as one
//! [`GatedBatch`] and the entry is discarded. Events without a correlation
//! id pass straight through.
//!
//! Two limits keep the buffer bounded: correlations open longer than
//! `expiration` are released on the next `process`, and opening a
//! correlation beyond `max_open` releases the oldest open one first.
//!
//! A released batch that fails further down the pipeline is handed back
//! with `restore` and buffered again. The terminal event is dropped from
//! the restored buffer because the retried send carries it again.

use super::{Node, NodeKind};
use crate::config::GateConfig;
use crate::error::Result;
use crate::types::{Event, EventType, GatedBatch, Payload};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct OpenGate {
    /// Receipt order of the first event, used to release oldest first
    seq: u64,
    event_type: EventType,
    opened_at: DateTime<Utc>,
    events: Vec<Payload>,
}

#[derive(Debug, Default)]
struct GateState {
    open: HashMap<String, OpenGate>,
    next_seq: u64,
}

/// Stateful node buffering events by correlation id
#[derive(Debug, Default)]
pub struct GatedFilter {
    config: GateConfig,
    state: Mutex<GateState>,
}

impl GatedFilter {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Number of correlations currently buffered
    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    /// Whether `id` has a buffered correlation
    pub fn is_open(&self, id: &str) -> bool {
        self.lock().open.contains_key(id)
    }

    /// Buffer `event`, returning whatever the gate releases as a result
    pub fn gate(&self, event: Event) -> Vec<Event> {
        let Some(id) = event.payload.correlation_id().map(str::to_owned) else {
            return vec![event];
        };
        let now = event.created_at;
        let terminal = event.payload.is_terminal();

        let mut state = self.lock();
        let mut released = self.release_expired(&mut state, now);

        if terminal && !state.open.contains_key(&id) {
            released.push(batch_event(id, event.event_type, now, vec![event.payload]));
            return released;
        }

        if !state.open.contains_key(&id) {
            if self.config.max_open > 0 && state.open.len() >= self.config.max_open {
                if let Some(evicted) = release_oldest(&mut state, now) {
                    tracing::warn!(
                        correlation_id = %evicted_id(&evicted),
                        max_open = self.config.max_open,
                        "Gate full, releasing oldest open correlation"
                    );
                    released.push(evicted);
                }
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.open.insert(
                id.clone(),
                OpenGate {
                    seq,
                    event_type: event.event_type,
                    opened_at: now,
                    events: Vec::new(),
                },
            );
        }

        if let Some(gate) = state.open.get_mut(&id) {
            gate.events.push(event.payload);
        }

        if terminal {
            if let Some(gate) = state.open.remove(&id) {
                released.push(batch_event(id, gate.event_type, now, gate.events));
            }
        }
        released
    }

    /// Release every buffered correlation, oldest first, and clear the gate
    ///
    /// Calling it with nothing buffered returns nothing.
    pub fn flush_all(&self, now: DateTime<Utc>) -> Vec<Event> {
        let mut state = self.lock();
        let mut gates: Vec<(String, OpenGate)> = state.open.drain().collect();
        gates.sort_by_key(|(_, g)| g.seq);
        gates
            .into_iter()
            .map(|(id, g)| batch_event(id, g.event_type, now, g.events))
            .collect()
    }

    /// Buffer the payloads of released batches again, ahead of anything
    /// that arrived for the same correlation since
    pub fn take_back(&self, released: Vec<Event>) {
        let mut state = self.lock();
        for event in released {
            let Payload::Batch(GatedBatch { id, mut events }) = event.payload else {
                continue;
            };
            if events.last().is_some_and(Payload::is_terminal) {
                events.pop();
            }
            if events.is_empty() {
                continue;
            }
            tracing::debug!(correlation_id = %id, events = events.len(), "Restoring undelivered correlation");

            if let Some(gate) = state.open.get_mut(&id) {
                events.append(&mut gate.events);
                gate.events = events;
                continue;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.open.insert(
                id,
                OpenGate {
                    seq,
                    event_type: event.event_type,
                    opened_at: event.created_at,
                    events,
                },
            );
        }
    }

    fn release_expired(&self, state: &mut GateState, now: DateTime<Utc>) -> Vec<Event> {
        let Some(expiration) = self.config.expiration() else {
            return Vec::new();
        };
        let Ok(expiration) = chrono::Duration::from_std(expiration) else {
            return Vec::new();
        };

        let mut expired: Vec<(u64, String)> = state
            .open
            .iter()
            .filter(|(_, g)| now - g.opened_at >= expiration)
            .map(|(id, g)| (g.seq, id.clone()))
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|(_, id)| {
                let gate = state.open.remove(&id)?;
                tracing::debug!(correlation_id = %id, "Releasing expired correlation");
                Some(batch_event(id, gate.event_type, now, gate.events))
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        // the state is never left half-updated, so a poisoned lock is usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn release_oldest(state: &mut GateState, now: DateTime<Utc>) -> Option<Event> {
    let id = state
        .open
        .iter()
        .min_by_key(|(_, g)| g.seq)
        .map(|(id, _)| id.clone())?;
    let gate = state.open.remove(&id)?;
    Some(batch_event(id, gate.event_type, now, gate.events))
}

fn batch_event(id: String, event_type: EventType, now: DateTime<Utc>, events: Vec<Payload>) -> Event {
    Event::new(event_type, now, Payload::Batch(GatedBatch { id, events }))
}

fn evicted_id(event: &Event) -> &str {
    match &event.payload {
        Payload::Batch(b) => &b.id,
        _ => "",
    }
}

#[async_trait]
impl Node for GatedFilter {
    async fn process(&self, event: Event) -> Result<Vec<Event>> {
        Ok(self.gate(event))
    }

    async fn flush(&self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(self.flush_all(now))
    }

    async fn restore(&self, released: Vec<Event>) -> Result<()> {
        self.take_back(released);
        Ok(())
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Filter
    }
}
