//! Server request types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Settings mapping sent with `inform_init`.
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Request envelope sent by a producer to the service.
///
/// Exactly one variant is active per message. On the wire the variant name is
/// the single key of the JSON object, e.g. `{"inform_finish": {"stream_id": "s"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRequest {
    /// Create a stream with its settings.
    InformInit(InformInit),
    /// Record that expects a result on the stream's outbound queue.
    RecordCommunicate(Record),
    /// Fire-and-forget record.
    RecordPublish(Record),
    /// Destroy a stream.
    InformFinish(InformFinish),
    /// Destroy every stream and stop the service.
    InformTeardown(InformTeardown),
}

impl ServerRequest {
    /// The variant tag, for logging.
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::InformInit(_) => RequestKind::InformInit,
            Self::RecordCommunicate(_) => RequestKind::RecordCommunicate,
            Self::RecordPublish(_) => RequestKind::RecordPublish,
            Self::InformFinish(_) => RequestKind::InformFinish,
            Self::InformTeardown(_) => RequestKind::InformTeardown,
        }
    }

    /// Stream the request is addressed to. `None` for the global teardown.
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::InformInit(init) => Some(&init.stream_id),
            Self::RecordCommunicate(record) | Self::RecordPublish(record) => Some(&record.stream_id),
            Self::InformFinish(finish) => Some(&finish.stream_id),
            Self::InformTeardown(_) => None,
        }
    }
}

/// Request variant tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    InformInit,
    RecordCommunicate,
    RecordPublish,
    InformFinish,
    InformTeardown,
}

impl RequestKind {
    /// Wire name of the variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InformInit => "inform_init",
            Self::RecordCommunicate => "record_communicate",
            Self::RecordPublish => "record_publish",
            Self::InformFinish => "inform_finish",
            Self::InformTeardown => "inform_teardown",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `inform_init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformInit {
    pub stream_id: String,
    #[serde(default)]
    pub settings: Settings,
}

/// Payload of `inform_finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformFinish {
    pub stream_id: String,
}

/// Payload of `inform_teardown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformTeardown {
    pub exit_code: i32,
}

/// A structured record routed to a stream.
///
/// Only `stream_id` is interpreted by the service; `data` is passed through
/// untouched to the stream's inbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub stream_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Record {
    pub fn new(stream_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            data,
        }
    }
}
