//! Writer sink: console and other stream destinations

use super::{Node, NodeKind};
use crate::error::{EventError, Result};
use crate::types::Event;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A stream shared by several sinks, serialized so records never interleave
///
/// Clones share the same underlying stream and lock. All stderr sinks of an
/// eventer write through one `SerializedWriter`.
#[derive(Clone)]
pub struct SerializedWriter {
    inner: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl SerializedWriter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stderr() -> Self {
        Self::new(tokio::io::stderr())
    }

    /// Write one whole record and flush, holding the lock throughout
    pub async fn write_record(&self, data: &[u8]) -> std::io::Result<()> {
        let mut w = self.inner.lock().await;
        w.write_all(data).await?;
        w.flush().await
    }
}

impl std::fmt::Debug for SerializedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializedWriter").finish_non_exhaustive()
    }
}

/// Sink that writes formatted records to a `SerializedWriter`
#[derive(Debug)]
pub struct WriterSink {
    name: String,
    format: String,
    writer: SerializedWriter,
}

impl WriterSink {
    pub fn new(name: impl Into<String>, format: impl Into<String>, writer: SerializedWriter) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            writer,
        }
    }
}

#[async_trait]
impl Node for WriterSink {
    async fn process(&self, event: Event) -> Result<Vec<Event>> {
        let data = event.formatted(&self.format).ok_or_else(|| EventError::Sink {
            node: self.name.clone(),
            reason: format!("event has no '{}' formatted record", self.format),
        })?;
        self.writer
            .write_record(data)
            .await
            .map_err(|e| EventError::Sink {
                node: self.name.clone(),
                reason: e.to_string(),
            })?;
        Ok(Vec::new())
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Sink
    }
}
