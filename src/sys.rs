//! Process-wide eventer
//!
//! Initialized once at startup and read from anywhere. Re-initializing
//! replaces the eventer; callers still holding the previous `Arc` keep a
//! working eventer, which is never torn down here.

use crate::config::EventerConfig;
use crate::error::{EventError, Result};
use crate::eventer::Eventer;
use crate::node::SerializedWriter;
use crate::types::{Audit, ErrorEvent, Observation, SysEvent};
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

static SYS_EVENTER: RwLock<Option<Arc<Eventer>>> = RwLock::new(None);

/// How to initialize the process-wide eventer
///
/// Exactly one of `with_eventer` or `with_config` must be given.
#[derive(Default)]
pub struct InitOptions {
    eventer: Option<Arc<Eventer>>,
    config: Option<EventerConfig>,
    console: Option<SerializedWriter>,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an already built eventer
    pub fn with_eventer(mut self, eventer: Arc<Eventer>) -> Self {
        self.eventer = Some(eventer);
        self
    }

    /// Build a new eventer from `config`
    pub fn with_config(mut self, config: EventerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Console writer for an eventer built from config
    pub fn with_console_writer(mut self, writer: SerializedWriter) -> Self {
        self.console = Some(writer);
        self
    }
}

/// Set the process-wide eventer, returning it
///
/// The eventer is fully built before the singleton lock is taken, so a
/// failed init leaves the previous eventer in place.
pub fn init_sys_eventer(opts: InitOptions) -> Result<Arc<Eventer>> {
    const OP: &str = "init_sys_eventer";
    let eventer = match (opts.eventer, opts.config) {
        (None, None) => {
            return Err(EventError::InvalidParameter(format!(
                "{}: missing both eventer and eventer config",
                OP
            )))
        }
        (Some(_), Some(_)) => {
            return Err(EventError::InvalidParameter(format!(
                "{}: both eventer and eventer config provided",
                OP
            )))
        }
        (Some(eventer), None) => eventer,
        (None, Some(config)) => {
            let mut builder = Eventer::builder(config);
            if let Some(console) = opts.console {
                builder = builder.console_writer(console);
            }
            Arc::new(builder.build()?)
        }
    };

    *SYS_EVENTER.write().unwrap_or_else(PoisonError::into_inner) = Some(eventer.clone());
    Ok(eventer)
}

/// The process-wide eventer, if one has been initialized
pub fn sys_eventer() -> Option<Arc<Eventer>> {
    SYS_EVENTER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn require_sys_eventer(op: &'static str) -> Result<Arc<Eventer>> {
    sys_eventer().ok_or_else(|| EventError::Write {
        op,
        source: Box::new(EventError::InvalidParameter(
            "system eventer is not initialized".to_string(),
        )),
    })
}

pub async fn write_audit(ctx: &CancellationToken, event: Audit) -> Result<()> {
    require_sys_eventer("write_audit")?.write_audit(ctx, event).await
}

pub async fn write_observation(ctx: &CancellationToken, event: Observation) -> Result<()> {
    require_sys_eventer("write_observation")?
        .write_observation(ctx, event)
        .await
}

pub async fn write_error(ctx: &CancellationToken, event: ErrorEvent) -> Result<()> {
    require_sys_eventer("write_error")?.write_error(ctx, event).await
}

pub async fn write_sys_event(ctx: &CancellationToken, event: SysEvent) -> Result<()> {
    require_sys_eventer("write_sys_event")?
        .write_sys_event(ctx, event)
        .await
}
