//! Chunk policies
//!
//! A policy turns the chunks batched for one file into the payload the
//! collector expects for that file. Policies keep running state (offsets,
//! buffers), so the uploader holds exactly one instance per filename for the
//! whole session and feeds it chunks in arrival order.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use super::chunk::Chunk;

/// Largest line or request body accepted by the collector: 10 MiB less
/// 100 KiB of room for the surrounding JSON.
pub const DEFAULT_MAX_LINE_BYTES: usize = (10 << 20) - (100 << 10);

/// Per-file transform from raw chunks to an upload payload.
pub trait FilePolicy: Send {
    /// Process one batch. `None` means nothing should be sent for this file
    /// this round.
    fn process_chunks(&mut self, chunks: &[Chunk]) -> Option<FileOutput>;

    /// Chunks rejected locally since the last call. The uploader adds these
    /// to its dropped count.
    fn take_dropped(&mut self) -> u64 {
        0
    }
}

/// Payload for a single file in a data post.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FileOutput {
    /// `{"offset": n, "content": [...]}`
    Lines(LineBatch),
    /// `{"offset": n, "content": "...", "encoding": "base64"}`
    Encoded(EncodedBatch),
    /// `[{"offset": n, "content": [...]}, ...]`
    Groups(Vec<LineBatch>),
}

/// Lines starting at a given offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineBatch {
    pub offset: u64,
    pub content: Vec<String>,
}

impl LineBatch {
    /// Bytes of content, ignoring JSON overhead.
    pub fn content_bytes(&self) -> usize {
        self.content.iter().map(String::len).sum()
    }
}

/// Encoded binary content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedBatch {
    pub offset: u64,
    pub content: String,
    pub encoding: String,
}

/// Sink for data dropped locally before it reaches the network.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Reports through an error-level tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, message: &str) {
        tracing::error!(target: "telemetry_core::report", "{}", message);
    }
}

fn default_reporter() -> Arc<dyn ErrorReporter> {
    Arc::new(TracingReporter)
}

/// Human readable byte count, e.g. `9.9MB`.
pub(crate) fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

/// Assigns consecutive offsets to opaque chunks.
#[derive(Debug, Default)]
pub struct DefaultFilePolicy {
    next_offset: u64,
}

impl DefaultFilePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a file that already has `offset` lines on the collector.
    pub fn starting_at(offset: u64) -> Self {
        Self { next_offset: offset }
    }
}

impl FilePolicy for DefaultFilePolicy {
    fn process_chunks(&mut self, chunks: &[Chunk]) -> Option<FileOutput> {
        let offset = self.next_offset;
        self.next_offset += chunks.len() as u64;
        Some(FileOutput::Lines(LineBatch {
            offset,
            content: chunks.iter().map(|c| c.data.as_text().into_owned()).collect(),
        }))
    }
}

/// One line per chunk; oversized lines are dropped but still consume their
/// offset.
pub struct JsonlFilePolicy {
    next_offset: u64,
    dropped: u64,
    max_line_bytes: usize,
    reporter: Arc<dyn ErrorReporter>,
}

impl JsonlFilePolicy {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            next_offset: 0,
            dropped: 0,
            max_line_bytes,
            reporter: default_reporter(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

impl Default for JsonlFilePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JsonlFilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlFilePolicy")
            .field("next_offset", &self.next_offset)
            .field("max_line_bytes", &self.max_line_bytes)
            .finish_non_exhaustive()
    }
}

impl FilePolicy for JsonlFilePolicy {
    fn process_chunks(&mut self, chunks: &[Chunk]) -> Option<FileOutput> {
        let offset = self.next_offset;
        self.next_offset += chunks.len() as u64;

        let mut content = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.data.len() > self.max_line_bytes {
                let msg = format!(
                    "Metric data exceeds maximum size of {} ({})",
                    human_size(self.max_line_bytes),
                    human_size(chunk.data.len())
                );
                tracing::warn!(filename = %chunk.filename, "{}", msg);
                self.reporter.report(&msg);
                self.dropped += 1;
            } else {
                content.push(chunk.data.as_text().into_owned());
            }
        }

        Some(FileOutput::Lines(LineBatch { offset, content }))
    }

    fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

/// Keeps only the latest chunk, always written at offset 0.
pub struct SummaryFilePolicy {
    dropped: u64,
    max_line_bytes: usize,
    reporter: Arc<dyn ErrorReporter>,
}

impl SummaryFilePolicy {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            dropped: 0,
            max_line_bytes,
            reporter: default_reporter(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

impl Default for SummaryFilePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SummaryFilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryFilePolicy")
            .field("max_line_bytes", &self.max_line_bytes)
            .finish_non_exhaustive()
    }
}

impl FilePolicy for SummaryFilePolicy {
    fn process_chunks(&mut self, chunks: &[Chunk]) -> Option<FileOutput> {
        let latest = chunks.last()?;
        if latest.data.len() > self.max_line_bytes {
            let msg = format!(
                "Summary data exceeds maximum size of {}. Dropping it.",
                human_size(self.max_line_bytes)
            );
            tracing::warn!(filename = %latest.filename, "{}", msg);
            self.reporter.report(&msg);
            self.dropped += 1;
            return None;
        }
        Some(FileOutput::Lines(LineBatch {
            offset: 0,
            content: vec![latest.data.as_text().into_owned()],
        }))
    }

    fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

/// Concatenates raw bytes and ships them base64 encoded.
#[derive(Debug, Default)]
pub struct BinaryFilePolicy {
    byte_offset: u64,
}

impl BinaryFilePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FilePolicy for BinaryFilePolicy {
    fn process_chunks(&mut self, chunks: &[Chunk]) -> Option<FileOutput> {
        let data: Vec<u8> = chunks.iter().flat_map(|c| c.data.as_bytes()).copied().collect();
        let offset = self.byte_offset;
        self.byte_offset += data.len() as u64;
        Some(FileOutput::Encoded(EncodedBatch {
            offset,
            content: STANDARD.encode(&data),
            encoding: "base64".to_string(),
        }))
    }
}
