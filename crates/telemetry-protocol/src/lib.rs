//! Telemetry Protocol Types
//!
//! Defines the framed envelope exchanged between producer processes and the
//! local telemetry service over a loopback socket.
//!
//! Every message travels as one frame:
//!
//! ```text
//! ┌──────────────┬────────────────────────┬──────────────────────┐
//! │ Magic (1 B)  │ Length (4 B)           │ Payload              │
//! │ 0x57 ('W')   │ unsigned little-endian │ JSON-encoded message │
//! └──────────────┴────────────────────────┴──────────────────────┘
//! ```
//!
//! The same framing is used in both directions.

pub mod error;
pub mod frame;
pub mod request;
pub mod response;

pub use error::ProtocolError;
pub use frame::{decode_message, encode_frame, encode_message, FrameDecoder, HEADER_LEN, MAGIC, MAX_FRAME_LEN};
pub use request::{InformFinish, InformInit, InformTeardown, Record, RequestKind, ServerRequest, Settings};
pub use response::{RecordResult, ServerResponse};
