//! In-process stream registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use telemetry_protocol::Settings;

use super::{stream_thread_name, StreamEndpoint, StreamHandle, StreamRegistry};

/// Runs on its own thread for every stream created.
pub type StreamProcessor = dyn Fn(StreamEndpoint) + Send + Sync;

/// Registry backed by a locked map.
///
/// With a processor, each new stream's endpoint is handed to it on a
/// dedicated thread. Without one, endpoints are parked until
/// [`StreamMux::take_endpoint`] claims them.
#[derive(Default)]
pub struct StreamMux {
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
    endpoints: Mutex<HashMap<String, StreamEndpoint>>,
    processor: Option<Arc<StreamProcessor>>,
    exit_code: Mutex<Option<i32>>,
    torn_down: Condvar,
}

impl StreamMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processor<F>(processor: F) -> Self
    where
        F: Fn(StreamEndpoint) + Send + Sync + 'static,
    {
        Self {
            processor: Some(Arc::new(processor)),
            ..Self::default()
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Claim the endpoint of a stream created without a processor.
    pub fn take_endpoint(&self, stream_id: &str) -> Option<StreamEndpoint> {
        self.endpoints.lock().remove(stream_id)
    }

    /// Exit code of the teardown, if one happened.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Block until [`StreamRegistry::teardown`] is called or `timeout`
    /// elapses. Returns the teardown exit code.
    pub fn wait_for_teardown(&self, timeout: Option<Duration>) -> Option<i32> {
        let mut exit_code = self.exit_code.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while exit_code.is_none() {
                    if self.torn_down.wait_until(&mut exit_code, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while exit_code.is_none() {
                    self.torn_down.wait(&mut exit_code);
                }
            }
        }
        *exit_code
    }

    fn spawn_processor(&self, processor: Arc<StreamProcessor>, endpoint: StreamEndpoint) {
        let stream_id = endpoint.id.clone();
        let spawned = std::thread::Builder::new()
            .name(stream_thread_name("stream", &stream_id))
            .spawn(move || processor(endpoint));
        if let Err(e) = spawned {
            tracing::error!(%stream_id, error = %e, "failed to spawn stream processor");
        }
    }
}

impl StreamRegistry for StreamMux {
    fn add_stream(&self, stream_id: &str, settings: Settings) -> Arc<StreamHandle> {
        let (handle, endpoint) = StreamHandle::new(stream_id, settings);
        let handle = Arc::new(handle);

        if let Some(previous) = self
            .streams
            .write()
            .insert(stream_id.to_string(), Arc::clone(&handle))
        {
            tracing::warn!(%stream_id, "replacing existing stream");
            previous.close();
        }
        tracing::info!(%stream_id, "stream added");

        match &self.processor {
            Some(processor) => self.spawn_processor(Arc::clone(processor), endpoint),
            None => {
                self.endpoints.lock().insert(stream_id.to_string(), endpoint);
            }
        }
        handle
    }

    fn get_stream(&self, stream_id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.read().get(stream_id).cloned()
    }

    fn del_stream(&self, stream_id: &str) {
        let removed = self.streams.write().remove(stream_id);
        self.endpoints.lock().remove(stream_id);
        match removed {
            Some(handle) => {
                handle.close();
                tracing::info!(%stream_id, "stream removed");
            }
            None => tracing::debug!(%stream_id, "finish for unknown stream ignored"),
        }
    }

    fn teardown(&self, exit_code: i32) {
        let streams: Vec<_> = self.streams.write().drain().collect();
        self.endpoints.lock().clear();
        for (_, handle) in &streams {
            handle.close();
        }
        tracing::info!(exit_code, streams = streams.len(), "registry torn down");

        *self.exit_code.lock() = Some(exit_code);
        self.torn_down.notify_all();
    }
}
