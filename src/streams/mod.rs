//! Stream registry
//!
//! A stream is a producer session keyed by a caller-chosen id. It owns an
//! inbound record queue, filled by the socket server, and an outbound result
//! queue drained by the result relay. The registry is the one structure the
//! socket subsystem shares across threads.

mod mux;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use telemetry_protocol::{Record, RecordResult, Settings};
use thiserror::Error;

pub use mux::{StreamMux, StreamProcessor};

/// How often a blocked [`StreamEndpoint::recv`] re-checks the closed flag
const ENDPOINT_POLL: Duration = Duration::from_millis(100);

/// Name for a thread serving one stream. Thread names cannot hold NUL bytes,
/// which a stream id may carry.
pub(crate) fn stream_thread_name(prefix: &str, stream_id: &str) -> String {
    format!("{}-{}", prefix, stream_id.replace('\0', "?"))
}

/// Stream errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream '{0}' is closed")]
    Closed(String),
}

/// Registry of active streams, as seen by the socket server.
pub trait StreamRegistry: Send + Sync {
    /// Create a stream. An existing stream with the same id is closed and
    /// replaced.
    fn add_stream(&self, stream_id: &str, settings: Settings) -> Arc<StreamHandle>;

    /// Look up an active stream.
    fn get_stream(&self, stream_id: &str) -> Option<Arc<StreamHandle>>;

    /// Close and forget a stream. Unknown ids are ignored.
    fn del_stream(&self, stream_id: &str);

    /// Close every stream and record the exit code.
    fn teardown(&self, exit_code: i32);
}

/// Server side of a stream.
#[derive(Debug)]
pub struct StreamHandle {
    id: String,
    settings: Settings,
    inbound: Sender<Record>,
    outbound: Receiver<RecordResult>,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    /// Create a stream and the endpoint its processor works from.
    pub fn new(id: impl Into<String>, settings: Settings) -> (Self, StreamEndpoint) {
        let id = id.into();
        let (inbound, records) = unbounded();
        let (results, outbound) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));

        let endpoint = StreamEndpoint {
            id: id.clone(),
            settings: settings.clone(),
            records,
            results,
            closed: Arc::clone(&closed),
        };
        let handle = Self {
            id,
            settings,
            inbound,
            outbound,
            closed,
        };
        (handle, endpoint)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Route a record to the stream's inbound queue.
    pub fn push(&self, record: Record) -> Result<(), StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed(self.id.clone()));
        }
        self.inbound
            .send(record)
            .map_err(|_| StreamError::Closed(self.id.clone()))
    }

    /// Results waiting to be relayed to the producer.
    pub fn results(&self) -> &Receiver<RecordResult> {
        &self.outbound
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Processing side of a stream.
#[derive(Debug)]
pub struct StreamEndpoint {
    pub id: String,
    pub settings: Settings,
    records: Receiver<Record>,
    results: Sender<RecordResult>,
    closed: Arc<AtomicBool>,
}

impl StreamEndpoint {
    /// Block until the next record arrives. `None` once the stream is closed.
    pub fn recv(&self) -> Option<Record> {
        loop {
            if self.is_closed() {
                return None;
            }
            match self.records.recv_timeout(ENDPOINT_POLL) {
                Ok(record) => return Some(record),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Non-blocking variant of [`StreamEndpoint::recv`].
    pub fn try_recv(&self) -> Option<Record> {
        self.records.try_recv().ok()
    }

    /// Queue a result for the relay. Returns false if nobody will read it.
    pub fn respond(&self, data: Value) -> bool {
        self.results.send(RecordResult::new(self.id.clone(), data)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thread_name_strips_nul() {
        assert_eq!(stream_thread_name("relay", "run-1"), "relay-run-1");
        assert_eq!(stream_thread_name("stream", "bad\0id"), "stream-bad?id");
    }

    #[test]
    fn test_records_flow_to_endpoint() {
        let (handle, endpoint) = StreamHandle::new("s1", Settings::new());
        handle.push(Record::new("s1", json!({"step": 1}))).unwrap();

        let record = endpoint.recv().unwrap();
        assert_eq!(record.data, json!({"step": 1}));
    }

    #[test]
    fn test_results_flow_to_handle() {
        let (handle, endpoint) = StreamHandle::new("s1", Settings::new());
        assert!(endpoint.respond(json!("ok")));

        let result = handle.results().try_recv().unwrap();
        assert_eq!(result, RecordResult::new("s1", json!("ok")));
    }

    #[test]
    fn test_closed_stream_rejects_records() {
        let (handle, endpoint) = StreamHandle::new("s1", Settings::new());
        handle.close();

        assert!(matches!(
            handle.push(Record::new("s1", json!(null))),
            Err(StreamError::Closed(id)) if id == "s1"
        ));
        assert!(endpoint.recv().is_none());
    }
}
