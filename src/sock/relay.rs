//! Result relay
//!
//! One thread per stream forwards results from the stream's outbound queue
//! to the producer that created it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use telemetry_protocol::ServerResponse;

use super::SockSender;
use crate::streams::{stream_thread_name, StreamHandle};

/// Relay from one stream to one connection.
pub struct ResultRelay {
    stream: Arc<StreamHandle>,
    sender: SockSender,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl ResultRelay {
    pub fn new(
        stream: Arc<StreamHandle>,
        sender: SockSender,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            stream,
            sender,
            running,
            poll_interval,
        }
    }

    /// Run the relay on its own thread.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(stream_thread_name("relay", self.stream.id()))
            .spawn(move || self.run())
    }

    /// Forward results until the server stops, the stream or connection
    /// closes, the queue disconnects or a write fails.
    pub fn run(self) {
        let stream_id = self.stream.id().to_string();
        tracing::debug!(%stream_id, "result relay started");

        while self.running.load(Ordering::SeqCst)
            && !self.stream.is_closed()
            && !self.sender.is_closed()
        {
            let result = match self.stream.results().recv_timeout(self.poll_interval) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let response = ServerResponse::ResultCommunicate(result);
            if let Err(e) = self.sender.send_server_response(&response) {
                tracing::warn!(%stream_id, error = %e, "failed to relay result");
                break;
            }
        }

        tracing::debug!(%stream_id, "result relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::SockClient;
    use serde_json::json;
    use std::net::TcpListener;
    use telemetry_protocol::{RecordResult, Settings};

    #[test]
    fn test_relay_forwards_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = SockClient::connect(port).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let server_side = SockClient::from_stream(accepted).unwrap();

        let (handle, endpoint) = StreamHandle::new("s1", Settings::new());
        let handle = Arc::new(handle);
        let relay = ResultRelay::new(
            Arc::clone(&handle),
            server_side.sender(),
            Arc::new(AtomicBool::new(true)),
            Duration::from_millis(20),
        )
        .spawn()
        .unwrap();

        endpoint.respond(json!({"ok": true}));
        let response = client.read_server_response(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(
            response,
            Some(ServerResponse::ResultCommunicate(RecordResult::new("s1", json!({"ok": true}))))
        );

        handle.close();
        relay.join().unwrap();
    }

    #[test]
    fn test_relay_stops_when_connection_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _client = SockClient::connect(port).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let server_side = SockClient::from_stream(accepted).unwrap();
        let sender = server_side.sender();

        // the stream stays open; only the connection goes away
        let (handle, _endpoint) = StreamHandle::new("s1", Settings::new());
        let relay = ResultRelay::new(
            Arc::new(handle),
            sender.clone(),
            Arc::new(AtomicBool::new(true)),
            Duration::from_millis(20),
        )
        .spawn()
        .unwrap();

        sender.shutdown();
        assert!(sender.is_closed());
        relay.join().unwrap();
    }
}
