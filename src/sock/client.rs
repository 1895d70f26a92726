//! Socket client
//!
//! Used by producers to send requests and by the server to read them; both
//! ends frame the same way.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use telemetry_protocol::{
    decode_message, encode_message, FrameDecoder, InformFinish, InformInit, InformTeardown, Record,
    ServerRequest, ServerResponse, Settings,
};

use super::SockError;

const READ_BUFFER_LEN: usize = 4096;

/// Write half of a connection.
///
/// Clones share one lock so frames from different threads never interleave.
#[derive(Debug, Clone)]
pub struct SockSender {
    stream: Arc<Mutex<TcpStream>>,
    closed: Arc<AtomicBool>,
}

impl SockSender {
    fn send<T: Serialize>(&self, message: &T) -> Result<(), SockError> {
        let frame = encode_message(message)?;
        let mut stream = self.stream.lock();
        stream.write_all(&frame)?;
        stream.flush()?;
        Ok(())
    }

    pub fn send_server_request(&self, request: &ServerRequest) -> Result<(), SockError> {
        tracing::debug!(kind = %request.kind(), "sending request");
        self.send(request)
    }

    pub fn send_server_response(&self, response: &ServerResponse) -> Result<(), SockError> {
        tracing::debug!(stream_id = response.stream_id(), "sending response");
        self.send(response)
    }

    /// Close both directions. Unblocks any thread reading the connection.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.stream.lock().shutdown(Shutdown::Both) {
            tracing::debug!(error = %e, "socket shutdown failed");
        }
    }

    /// True once [`SockSender::shutdown`] has run on any clone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

enum FrameRead {
    Frame(Vec<u8>),
    Eof,
    TimedOut,
}

/// A framed connection.
#[derive(Debug)]
pub struct SockClient {
    reader: TcpStream,
    decoder: FrameDecoder,
    sender: SockSender,
}

impl SockClient {
    /// Connect to a service on the loopback interface.
    pub fn connect(port: u16) -> Result<Self, SockError> {
        let stream = TcpStream::connect(("127.0.0.1", port))?;
        Self::from_stream(stream)
    }

    /// Wrap an accepted or connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, SockError> {
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: stream,
            decoder: FrameDecoder::new(),
            sender: SockSender {
                stream: Arc::new(Mutex::new(writer)),
                closed: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// A cloneable handle to the write half.
    pub fn sender(&self) -> SockSender {
        self.sender.clone()
    }

    pub fn send_server_request(&self, request: &ServerRequest) -> Result<(), SockError> {
        self.sender.send_server_request(request)
    }

    pub fn send_server_response(&self, response: &ServerResponse) -> Result<(), SockError> {
        self.sender.send_server_response(response)
    }

    pub fn inform_init(&self, stream_id: &str, settings: Settings) -> Result<(), SockError> {
        self.send_server_request(&ServerRequest::InformInit(InformInit {
            stream_id: stream_id.to_string(),
            settings,
        }))
    }

    pub fn inform_finish(&self, stream_id: &str) -> Result<(), SockError> {
        self.send_server_request(&ServerRequest::InformFinish(InformFinish {
            stream_id: stream_id.to_string(),
        }))
    }

    pub fn inform_teardown(&self, exit_code: i32) -> Result<(), SockError> {
        self.send_server_request(&ServerRequest::InformTeardown(InformTeardown { exit_code }))
    }

    pub fn send_record_communicate(&self, record: Record) -> Result<(), SockError> {
        self.send_server_request(&ServerRequest::RecordCommunicate(record))
    }

    pub fn send_record_publish(&self, record: Record) -> Result<(), SockError> {
        self.send_server_request(&ServerRequest::RecordPublish(record))
    }

    /// Block for the next request. `None` on orderly end of stream.
    pub fn read_server_request(&mut self) -> Result<Option<ServerRequest>, SockError> {
        match self.read_frame(None)? {
            FrameRead::Frame(payload) => Ok(Some(decode_message(&payload)?)),
            FrameRead::Eof | FrameRead::TimedOut => Ok(None),
        }
    }

    /// Wait for the next response. `None` if `timeout` elapses before a
    /// complete frame arrives; bytes already read stay buffered.
    pub fn read_server_response(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<ServerResponse>, SockError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        match self.read_frame(deadline)? {
            FrameRead::Frame(payload) => Ok(Some(decode_message(&payload)?)),
            FrameRead::TimedOut => Ok(None),
            FrameRead::Eof => Err(SockError::Closed),
        }
    }

    fn read_frame(&mut self, deadline: Option<Instant>) -> Result<FrameRead, SockError> {
        let mut buffer = [0u8; READ_BUFFER_LEN];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(FrameRead::Frame(payload));
            }

            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(FrameRead::TimedOut);
                    }
                    Some(remaining)
                }
                None => None,
            };
            self.reader.set_read_timeout(timeout)?;

            match self.reader.read(&mut buffer) {
                Ok(0) => {
                    if self.decoder.buffered() > 0 {
                        tracing::warn!(
                            buffered = self.decoder.buffered(),
                            "connection closed mid-frame"
                        );
                    }
                    return Ok(FrameRead::Eof);
                }
                Ok(n) => self.decoder.extend(&buffer[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
