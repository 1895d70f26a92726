//! Loopback socket transport
//!
//! Producers talk to the service over a local TCP connection carrying
//! length-prefixed frames (see `telemetry_protocol`). The server routes each
//! request to the stream registry and a relay thread per stream writes
//! results back over the same connection.

mod client;
mod relay;
mod server;

use std::io;

use telemetry_protocol::{ProtocolError, RequestKind};
use thiserror::Error;

use crate::streams::StreamError;

pub use client::{SockClient, SockSender};
pub use relay::ResultRelay;
pub use server::{AcceptMode, ServerConfig, SocketServer};

/// Connection-level errors
#[derive(Debug, Error)]
pub enum SockError {
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed by peer")]
    Closed,
}

impl SockError {
    /// Whether the byte stream lost framing and the connection is unusable.
    pub fn is_desync(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_desync())
    }
}

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Sock(#[from] SockError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A record addressed a stream that was never created or already
    /// finished. The client and server disagree about stream state.
    #[error("{kind} for unknown stream '{stream_id}'")]
    UnknownStream { kind: RequestKind, stream_id: String },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}
