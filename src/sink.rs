//! Event sink boundary.
//!
//! The simulator hands every record to an [`EventSink`] as a topic plus a
//! JSON payload. Delivery is fire-and-forget: the [`Publisher`] logs and
//! counts failures, and the simulation carries on as if the record had
//! been delivered.

use crate::error::SinkError;
use crate::record::Record;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Transport-agnostic publish interface.
///
/// Implementations must not block for long: they are called from inside
/// piece workers.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, record: &[u8]) -> Result<(), SinkError>;
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn publish(&self, topic: &str, record: &[u8]) -> Result<(), SinkError> {
        (**self).publish(topic, record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedRecord {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedRecord {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn is_tracking(&self) -> bool {
        self.topic.starts_with(crate::record::TRACKING_TOPIC_PREFIX)
    }

    pub fn is_sensor(&self) -> bool {
        self.topic.starts_with(crate::record::DATA_TOPIC_PREFIX)
    }
}

/// Keeps every record in memory, in publish order.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<PublishedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublishedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn publish(&self, topic: &str, record: &[u8]) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedRecord {
                topic: topic.to_string(),
                payload: record.to_vec(),
            });
        Ok(())
    }
}

/// Forwards records to a bounded channel; a full channel drops the record.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PublishedRecord>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PublishedRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, topic: &str, record: &[u8]) -> Result<(), SinkError> {
        self.tx
            .try_send(PublishedRecord {
                topic: topic.to_string(),
                payload: record.to_vec(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SinkError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
            })
    }
}

/// Writes `topic payload` lines to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn publish(&self, topic: &str, record: &[u8]) -> Result<(), SinkError> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        out.write_all(topic.as_bytes())?;
        out.write_all(b" ")?;
        out.write_all(record)?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

/// Accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _topic: &str, _record: &[u8]) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub published: u64,
    pub dropped: u64,
}

/// Encodes records and pushes them into the sink, at most once.
pub struct Publisher {
    sink: Arc<dyn EventSink>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Publisher {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, record: impl Into<Record>) {
        let record = record.into();
        let topic = record.topic();
        let result = record
            .to_bytes()
            .map_err(SinkError::from)
            .and_then(|bytes| self.sink.publish(&topic, &bytes));
        match result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                trace!(%topic, "record published");
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%topic, error = %e, "record dropped");
            }
        }
    }

    pub fn stats(&self) -> PublishStats {
        PublishStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Publisher").field("stats", &self.stats()).finish()
    }
}
