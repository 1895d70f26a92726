//! Streaming file uploader
//!
//! Producers push file chunks onto an unbounded queue; a single worker
//! thread batches them per filename, runs each batch through the file's
//! [`FilePolicy`] and posts the result to the collector's file-stream
//! endpoint with rate limiting and retries. Every request that ultimately
//! fails is counted as dropped and the count travels with every later post.
//!
//! ```text
//! producers ──push──▶ queue ──▶ worker ──policy──▶ split ──POST──▶ collector
//!                                  ▲                                   │
//!                                  └──────── limits (heartbeat) ◀──────┘
//! ```

mod chunk;
mod dedupe;
mod policy;
mod retry;
mod split;
mod transport;
mod worker;

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{unbounded, Sender};
use thiserror::Error;

use crate::config::DynamicSettings;

pub use chunk::{Chunk, ChunkData, QueueItem};
pub use dedupe::CrDedupeFilePolicy;
pub use policy::{
    BinaryFilePolicy, DefaultFilePolicy, EncodedBatch, ErrorReporter, FileOutput, FilePolicy,
    JsonlFilePolicy, LineBatch, SummaryFilePolicy, TracingReporter, DEFAULT_MAX_LINE_BYTES,
};
pub use retry::{
    is_retriable, send_with_retry, Backoff, RetryCallback, RetryPolicy, NON_RETRIABLE_STATUSES,
    RATE_LIMITED_STATUS,
};
pub use split::{split_files, FileSet};
pub use transport::{
    HttpResponse, HttpTransport, HttpTransportConfig, MockTransport, RecordedRequest, Transport,
    TransportError, USERNAME_HEADER, USER_EMAIL_HEADER,
};
pub use worker::rate_limit_interval;

use worker::Worker;

/// Largest number of queue items handled per worker iteration
pub const MAX_ITEMS_PER_PUSH: usize = 10_000;

/// Uploader settings
#[derive(Debug, Clone, PartialEq)]
pub struct FileStreamConfig {
    /// Queue items drained per iteration
    pub max_items_per_push: usize,
    /// Upper bound on the content bytes of one post
    pub max_line_bytes: usize,
    /// Backoff for failed posts
    pub retry: RetryPolicy,
}

impl Default for FileStreamConfig {
    fn default() -> Self {
        Self {
            max_items_per_push: MAX_ITEMS_PER_PUSH,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            retry: RetryPolicy::default(),
        }
    }
}

/// Uploader errors
#[derive(Debug, Error)]
pub enum FileStreamError {
    #[error("missing setting '{0}' needed to build the file stream endpoint")]
    MissingSetting(&'static str),

    #[error("failed to spawn file stream worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to encode file stream request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("file stream worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("file stream already finished")]
    AlreadyFinished,
}

/// Producer side of the queue, cheap to clone and safe to share between
/// threads.
///
/// Items pushed after the stream finished are discarded.
#[derive(Debug, Clone)]
pub struct FileStreamHandle {
    sender: Sender<QueueItem>,
}

impl FileStreamHandle {
    fn enqueue(&self, item: QueueItem) {
        if let Err(e) = self.sender.send(item) {
            tracing::debug!(item = ?e.into_inner(), "file stream closed, discarding item");
        }
    }

    /// Queue a chunk for `filename`.
    pub fn push(&self, filename: impl Into<String>, data: impl Into<ChunkData>) {
        self.enqueue(QueueItem::Chunk(Chunk::new(filename, data)));
    }

    /// Report an out-of-band file upload in the next status post.
    pub fn push_success(&self, artifact_id: impl Into<String>, save_name: impl Into<String>) {
        self.enqueue(QueueItem::PushSuccess {
            artifact_id: artifact_id.into(),
            save_name: save_name.into(),
        });
    }

    /// Tell the collector the run is being preempted.
    pub fn enqueue_preempting(&self) {
        self.enqueue(QueueItem::Preempting);
    }

    /// Use `policy` for `filename`, replacing any policy already set.
    pub fn set_file_policy(&self, filename: impl Into<String>, policy: impl FilePolicy + 'static) {
        self.enqueue(QueueItem::Policy {
            filename: filename.into(),
            policy: Box::new(policy),
            replace: true,
        });
    }

    /// Use `policy` for `filename` unless one is already set.
    pub fn set_default_file_policy(&self, filename: impl Into<String>, policy: impl FilePolicy + 'static) {
        self.enqueue(QueueItem::Policy {
            filename: filename.into(),
            policy: Box::new(policy),
            replace: false,
        });
    }

    /// Push every line of the file at `path` under its base name. Returns
    /// the number of lines queued.
    pub fn stream_file(&self, path: &Path) -> Result<usize, FileStreamError> {
        let contents = fs::read_to_string(path).map_err(|source| FileStreamError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut count = 0;
        for line in contents.split_inclusive('\n') {
            self.push(name.clone(), line);
            count += 1;
        }
        Ok(count)
    }
}

/// A running uploader. Dropping it without [`FileStream::finish`] leaves the
/// worker to exit once every handle is gone, without a completion post.
pub struct FileStream {
    handle: FileStreamHandle,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<Result<(), FileStreamError>>>,
}

impl FileStream {
    /// Spawn the worker for `run_id`.
    ///
    /// `settings` must provide `base_url`, `entity` and `project`; the
    /// uploader keeps reading it for `heartbeat_seconds` and merges collector
    /// limits into it.
    pub fn start(
        config: FileStreamConfig,
        settings: DynamicSettings,
        transport: Arc<dyn Transport>,
        run_id: &str,
    ) -> Result<Self, FileStreamError> {
        Self::start_with_callback(config, settings, transport, run_id, None)
    }

    /// Like [`FileStream::start`], with a callback invoked whenever the
    /// collector rate limits a post.
    pub fn start_with_callback(
        config: FileStreamConfig,
        settings: DynamicSettings,
        transport: Arc<dyn Transport>,
        run_id: &str,
        on_rate_limit: Option<Arc<RetryCallback>>,
    ) -> Result<Self, FileStreamError> {
        let endpoint = endpoint(&settings, run_id)?;
        let (sender, receiver) = unbounded();
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            receiver,
            transport,
            settings,
            config,
            endpoint,
            dropped: Arc::clone(&dropped),
            on_rate_limit,
            policies: HashMap::new(),
            start_time: Instant::now(),
        };

        let handle = std::thread::Builder::new()
            .name("FileStreamThread".to_string())
            .spawn(move || {
                let result = worker.run();
                if let Err(e) = &result {
                    tracing::error!(error = %e, "file stream worker failed");
                }
                result
            })
            .map_err(FileStreamError::Spawn)?;

        tracing::info!(run_id, "file stream started");

        Ok(Self {
            handle: FileStreamHandle { sender },
            dropped,
            worker: Some(handle),
        })
    }

    /// A cloneable producer handle.
    pub fn handle(&self) -> FileStreamHandle {
        self.handle.clone()
    }

    pub fn push(&self, filename: impl Into<String>, data: impl Into<ChunkData>) {
        self.handle.push(filename, data);
    }

    pub fn push_success(&self, artifact_id: impl Into<String>, save_name: impl Into<String>) {
        self.handle.push_success(artifact_id, save_name);
    }

    pub fn enqueue_preempting(&self) {
        self.handle.enqueue_preempting();
    }

    pub fn set_file_policy(&self, filename: impl Into<String>, policy: impl FilePolicy + 'static) {
        self.handle.set_file_policy(filename, policy);
    }

    pub fn set_default_file_policy(&self, filename: impl Into<String>, policy: impl FilePolicy + 'static) {
        self.handle.set_default_file_policy(filename, policy);
    }

    pub fn stream_file(&self, path: &Path) -> Result<usize, FileStreamError> {
        self.handle.stream_file(path)
    }

    /// Requests and local rejections that never reached the collector.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Queue the finish sentinel, wait for the worker to post the completion
    /// and return any fault it hit.
    pub fn finish(&mut self, exit_code: i32) -> Result<(), FileStreamError> {
        let worker = self.worker.take().ok_or(FileStreamError::AlreadyFinished)?;
        self.handle.enqueue(QueueItem::Finish { exit_code });

        match worker.join() {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(%message, "file stream worker panicked");
                Err(FileStreamError::WorkerPanicked(message))
            }
        }
    }
}

fn endpoint(settings: &DynamicSettings, run_id: &str) -> Result<String, FileStreamError> {
    let base_url = settings.base_url().ok_or(FileStreamError::MissingSetting("base_url"))?;
    let entity = settings.entity().ok_or(FileStreamError::MissingSetting("entity"))?;
    let project = settings.project().ok_or(FileStreamError::MissingSetting("project"))?;
    Ok(format!(
        "{}/files/{}/{}/{}/file_stream",
        base_url.trim_end_matches('/'),
        entity,
        project,
        run_id
    ))
}
