//! Telemetry Core - local record service and streaming file uploader
//!
//! Producers send framed records over a loopback socket to the service,
//! which routes them to per-stream queues and relays results back. The
//! file stream uploader batches file chunks and posts them to a remote
//! collector with rate limiting, retries and dropped-data accounting.
//!
//! The `telemetry-service` binary runs only the socket service. A producer
//! that uploads files builds its uploader from the same [`ServiceConfig`]:
//! [`ServiceConfig::http_transport_config`] feeds [`HttpTransport::new`],
//! and [`ServiceConfig::file_stream_config`] plus
//! [`ServiceConfig::dynamic_settings`] feed [`FileStream::start`].

pub mod config;
pub mod filestream;
pub mod logging;
pub mod signal;
pub mod sock;
pub mod streams;

pub use config::{ConfigError, DynamicSettings, ServiceConfig};
pub use filestream::{
    CrDedupeFilePolicy, FileStream, FileStreamConfig, FileStreamError, FileStreamHandle, FilePolicy,
    HttpTransport, MockTransport, Transport,
};
pub use sock::{AcceptMode, ServerConfig, ServerError, SockClient, SockError, SocketServer};
pub use streams::{StreamEndpoint, StreamHandle, StreamMux, StreamRegistry};
pub use telemetry_protocol::{Record, RecordResult, ServerRequest, ServerResponse};
