//! File chunks and the uploader's queue items.

use std::borrow::Cow;

use super::policy::FilePolicy;

/// Raw chunk payload.
///
/// Text chunks are what line-oriented policies expect; binary chunks are only
/// meaningful to [`super::BinaryFilePolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkData {
    Text(String),
    Binary(Vec<u8>),
}

impl ChunkData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    /// Text view of the payload; invalid UTF-8 is replaced.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Binary(bytes) => String::from_utf8_lossy(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for ChunkData {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ChunkData {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for ChunkData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for ChunkData {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

/// One unit of data destined for a named file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub filename: String,
    pub data: ChunkData,
}

impl Chunk {
    pub fn new(filename: impl Into<String>, data: impl Into<ChunkData>) -> Self {
        Self {
            filename: filename.into(),
            data: data.into(),
        }
    }
}

/// Work item on the uploader queue.
pub enum QueueItem {
    Chunk(Chunk),
    /// An out-of-band file upload finished; reported as "uploaded".
    PushSuccess { artifact_id: String, save_name: String },
    /// The run was preempted; posted immediately.
    Preempting,
    /// Terminal sentinel. Nothing queued after it is processed.
    Finish { exit_code: i32 },
    /// Install a policy for a filename. With `replace == false` an existing
    /// policy is kept.
    Policy {
        filename: String,
        policy: Box<dyn FilePolicy>,
        replace: bool,
    },
}

impl std::fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunk(chunk) => f.debug_tuple("Chunk").field(chunk).finish(),
            Self::PushSuccess { artifact_id, save_name } => f
                .debug_struct("PushSuccess")
                .field("artifact_id", artifact_id)
                .field("save_name", save_name)
                .finish(),
            Self::Preempting => f.write_str("Preempting"),
            Self::Finish { exit_code } => f.debug_struct("Finish").field("exit_code", exit_code).finish(),
            Self::Policy { filename, replace, .. } => f
                .debug_struct("Policy")
                .field("filename", filename)
                .field("replace", replace)
                .finish_non_exhaustive(),
        }
    }
}
