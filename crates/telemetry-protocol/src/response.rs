//! Server response types.

use serde::{Deserialize, Serialize};

/// Response envelope sent by the service back to a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerResponse {
    /// A result produced by a stream for an earlier `record_communicate`.
    ResultCommunicate(RecordResult),
}

impl ServerResponse {
    /// The stream the response belongs to.
    pub fn stream_id(&self) -> &str {
        match self {
            Self::ResultCommunicate(result) => &result.stream_id,
        }
    }
}

/// Result produced by stream processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub stream_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RecordResult {
    pub fn new(stream_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            data,
        }
    }
}
