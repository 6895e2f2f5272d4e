//! Pipeline nodes: the units of work an event passes through
//!
//! A pipeline is an ordered chain of nodes that ends in a sink. Formatters
//! serialize, gates (filters) hold events back until their correlation
//! closes, sinks write to a destination. Nodes are shared by id across
//! pipelines, so every implementation must be safe to call concurrently.

use crate::error::Result;
use crate::types::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod file;
pub mod formatter;
pub mod gate;
pub mod writer;

pub use file::FileSink;
pub use formatter::JsonFormatter;
pub use gate::GatedFilter;
pub use writer::{SerializedWriter, WriterSink};

/// Node identifier, unique within a broker
pub type NodeId = String;

/// What a node does to the events passing through it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Transforms the event (serialization)
    Formatter,
    /// May hold events back and release them later
    Filter,
    /// Terminal destination
    Sink,
}

/// Core trait for pipeline nodes
#[async_trait]
pub trait Node: Send + Sync {
    /// Process one event, returning the events to pass to the next node
    ///
    /// An empty vector stops the chain for this send. Sinks return an empty
    /// vector once the record is written.
    async fn process(&self, event: Event) -> Result<Vec<Event>>;

    /// Re-acquire the node's destination (after external log rotation)
    ///
    /// Default implementation does nothing.
    async fn reopen(&self) -> Result<()> {
        Ok(())
    }

    /// Release every held-back event, stamped with `now`
    ///
    /// Default implementation holds nothing back.
    async fn flush(&self, _now: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(Vec::new())
    }

    /// Take back events this node released when a later node failed to
    /// deliver them, so a retry or the next flush can release them again
    ///
    /// Default implementation holds nothing back, so there is nothing to
    /// take back.
    async fn restore(&self, _released: Vec<Event>) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> NodeKind;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles shared by the unit test modules

    use super::*;
    use crate::error::EventError;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::AsyncWrite;

    /// In-memory writer whose contents tests can inspect
    #[derive(Clone, Default)]
    pub struct CaptureWriter {
        pub buf: Arc<Mutex<Vec<u8>>>,
        pub fail: Arc<AtomicBool>,
    }

    impl CaptureWriter {
        pub fn contents(&self) -> String {
            String::from_utf8(self.buf.lock().unwrap().clone()).unwrap()
        }

        pub fn lines(&self) -> Vec<serde_json::Value> {
            self.contents()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    impl AsyncWrite for CaptureWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.fail.load(Ordering::SeqCst) {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "capture writer closed",
                )));
            }
            self.buf.lock().unwrap().extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Sink that records what reaches it and can be told to fail, either
    /// always (`fail`) or for the next `fail_times` events
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<Event>>,
        pub fail: AtomicBool,
        pub fail_times: AtomicUsize,
        pub reopened: AtomicUsize,
    }

    impl RecordingSink {
        pub fn failing_times(n: usize) -> Self {
            let sink = Self::default();
            sink.fail_times.store(n, Ordering::SeqCst);
            sink
        }
    }

    #[async_trait]
    impl Node for RecordingSink {
        async fn process(&self, event: Event) -> Result<Vec<Event>> {
            let flaky = self
                .fail_times
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if flaky || self.fail.load(Ordering::SeqCst) {
                return Err(EventError::Sink {
                    node: "recording".to_string(),
                    reason: "told to fail".to_string(),
                });
            }
            self.events.lock().unwrap().push(event);
            Ok(Vec::new())
        }

        async fn reopen(&self) -> Result<()> {
            self.reopened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kind(&self) -> NodeKind {
            NodeKind::Sink
        }
    }

    /// Node that panics on every event
    pub struct PanickingNode;

    #[async_trait]
    impl Node for PanickingNode {
        async fn process(&self, _event: Event) -> Result<Vec<Event>> {
            panic!("node blew up");
        }

        fn kind(&self) -> NodeKind {
            NodeKind::Formatter
        }
    }
}
