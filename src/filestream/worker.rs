//! Uploader worker thread.
//!
//! Drains the queue, applies chunk policies and posts batches, heartbeats,
//! preemption notices and the final completion to the collector.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::Serialize;
use serde_json::{json, Value};

use super::chunk::{Chunk, QueueItem};
use super::policy::{DefaultFilePolicy, FilePolicy};
use super::retry::{send_with_retry, RetryCallback};
use super::split::{split_files, FileSet};
use super::transport::{HttpResponse, Transport, TransportError};
use super::{FileStreamConfig, FileStreamError};
use crate::config::DynamicSettings;

/// Minimum spacing between data posts for a run that has been going for
/// `elapsed`.
///
/// | elapsed        | interval               |
/// |----------------|------------------------|
/// | < 60 s         | max(1 s, heartbeat/15) |
/// | 60 s .. 300 s  | max(2.5 s, heartbeat/3)|
/// | >= 300 s       | max(5 s, heartbeat)    |
pub fn rate_limit_interval(elapsed: Duration, heartbeat: Duration) -> Duration {
    let heartbeat = heartbeat.as_secs_f64();
    let seconds = if elapsed < Duration::from_secs(60) {
        (heartbeat / 15.0).max(1.0)
    } else if elapsed < Duration::from_secs(300) {
        (heartbeat / 3.0).max(2.5)
    } else {
        heartbeat.max(5.0)
    };
    Duration::from_secs_f64(seconds)
}

/// Items read from the queue in one pass.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub items: Vec<QueueItem>,
    /// Every sender is gone and the queue is empty.
    pub disconnected: bool,
}

/// Block up to `timeout` for the first item, then take whatever is already
/// queued, up to `max_items`. Stops right after a `Finish` item.
pub(crate) fn read_queue(receiver: &Receiver<QueueItem>, max_items: usize, timeout: Duration) -> Drained {
    let mut drained = Drained::default();

    let mut next = match receiver.recv_timeout(timeout) {
        Ok(item) => Some(item),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => {
            drained.disconnected = true;
            None
        }
    };

    while let Some(item) = next.take() {
        let finish = matches!(item, QueueItem::Finish { .. });
        drained.items.push(item);
        if finish || drained.items.len() >= max_items {
            break;
        }
        match receiver.try_recv() {
            Ok(item) => next = Some(item),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => drained.disconnected = true,
        }
    }

    drained
}

/// Body of every non-data post.
#[derive(Debug, Serialize)]
struct StatusUpdate<'a> {
    complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    exitcode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preempting: Option<bool>,
    dropped: u64,
    uploaded: &'a BTreeSet<String>,
}

pub(crate) struct Worker {
    pub receiver: Receiver<QueueItem>,
    pub transport: Arc<dyn Transport>,
    pub settings: DynamicSettings,
    pub config: FileStreamConfig,
    pub endpoint: String,
    pub dropped: Arc<AtomicU64>,
    pub on_rate_limit: Option<Arc<RetryCallback>>,
    pub policies: HashMap<String, Box<dyn FilePolicy>>,
    pub start_time: Instant,
}

impl Worker {
    pub fn run(mut self) -> Result<(), FileStreamError> {
        let mut ready_chunks: Vec<Chunk> = Vec::new();
        let mut uploaded: BTreeSet<String> = BTreeSet::new();
        let mut posted_data_time = Instant::now();
        let mut posted_anything_time = Instant::now();

        tracing::debug!(endpoint = %self.endpoint, "file stream worker started");

        let exit_code = loop {
            let drained = read_queue(
                &self.receiver,
                self.config.max_items_per_push,
                self.rate_limit(),
            );

            let mut finished = None;
            for item in drained.items {
                match item {
                    QueueItem::Chunk(chunk) => ready_chunks.push(chunk),
                    QueueItem::PushSuccess { artifact_id, save_name } => {
                        tracing::debug!(%artifact_id, %save_name, "recorded uploaded file");
                        uploaded.insert(save_name);
                    }
                    QueueItem::Preempting => {
                        let body = self.status_body(StatusUpdate {
                            complete: false,
                            exitcode: None,
                            failed: None,
                            preempting: Some(true),
                            dropped: self.dropped(),
                            uploaded: &uploaded,
                        })?;
                        let result = self.post(&body);
                        self.handle_response(result);
                        uploaded.clear();
                        posted_anything_time = Instant::now();
                    }
                    QueueItem::Finish { exit_code } => finished = Some(exit_code),
                    QueueItem::Policy { filename, policy, replace } => {
                        if replace || !self.policies.contains_key(&filename) {
                            self.policies.insert(filename, policy);
                        }
                    }
                }
            }

            let closing = finished.is_some() || drained.disconnected;
            let now = Instant::now();
            if !ready_chunks.is_empty()
                && (closing || now.duration_since(posted_data_time) > self.rate_limit())
            {
                posted_data_time = now;
                posted_anything_time = now;
                self.send_chunks(std::mem::take(&mut ready_chunks))?;
            }

            if now.duration_since(posted_anything_time) > self.settings.heartbeat() {
                posted_anything_time = now;
                let body = self.status_body(StatusUpdate {
                    complete: false,
                    exitcode: None,
                    failed: Some(false),
                    preempting: None,
                    dropped: self.dropped(),
                    uploaded: &uploaded,
                })?;
                let result = self.post(&body);
                self.handle_response(result);
                uploaded.clear();
            }

            if let Some(code) = finished {
                break Some(code);
            }
            if drained.disconnected {
                break None;
            }
        };

        match exit_code {
            Some(code) => {
                let body = self.status_body(StatusUpdate {
                    complete: true,
                    exitcode: Some(code),
                    failed: None,
                    preempting: None,
                    dropped: self.dropped(),
                    uploaded: &uploaded,
                })?;
                let result = self.post(&body);
                self.handle_response(result);
                tracing::info!(exit_code = code, dropped = self.dropped(), "file stream finished");
            }
            None => {
                tracing::warn!("file stream queue closed without finish, skipping completion post");
            }
        }
        Ok(())
    }

    fn rate_limit(&self) -> Duration {
        rate_limit_interval(self.start_time.elapsed(), self.settings.heartbeat())
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn status_body(&self, update: StatusUpdate<'_>) -> Result<Value, FileStreamError> {
        Ok(serde_json::to_value(update)?)
    }

    /// Run pending chunks through their policies and post the result.
    fn send_chunks(&mut self, mut chunks: Vec<Chunk>) -> Result<(), FileStreamError> {
        // stable sort keeps per-file order
        chunks.sort_by(|a, b| a.filename.cmp(&b.filename));

        let mut files = FileSet::new();
        let mut start = 0;
        while start < chunks.len() {
            let filename = chunks[start].filename.clone();
            let end = start
                + chunks[start..]
                    .iter()
                    .take_while(|chunk| chunk.filename == filename)
                    .count();

            let policy = self
                .policies
                .entry(filename.clone())
                .or_insert_with(|| Box::new(DefaultFilePolicy::new()));
            let output = policy.process_chunks(&chunks[start..end]);
            let rejected = policy.take_dropped();
            if rejected > 0 {
                self.dropped.fetch_add(rejected, Ordering::SeqCst);
            }
            if let Some(output) = output {
                files.insert(filename, output);
            }
            start = end;
        }

        for files in split_files(files, self.config.max_line_bytes) {
            let body = json!({
                "files": serde_json::to_value(&files)?,
                "dropped": self.dropped(),
            });
            let result = self.post(&body);
            self.handle_response(result);
        }
        Ok(())
    }

    fn post(&self, body: &Value) -> Result<HttpResponse, TransportError> {
        send_with_retry(
            self.transport.as_ref(),
            &self.endpoint,
            body,
            &self.config.retry,
            self.on_rate_limit.as_deref(),
            std::thread::sleep,
        )
    }

    fn handle_response(&self, result: Result<HttpResponse, TransportError>) {
        match result {
            Ok(response) => {
                let limits = response
                    .json()
                    .and_then(|mut body| body.get_mut("limits").map(Value::take));
                if let Some(Value::Object(limits)) = limits {
                    tracing::debug!(?limits, "applying collector limits");
                    self.settings.update(&limits);
                }
            }
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::error!(error = %e, dropped, "dropped streaming file chunk");
            }
        }
    }
}
