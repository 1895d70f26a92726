//! Socket server
//!
//! Accepts producer connections on a loopback port and dispatches their
//! requests to the stream registry. Each connection gets a reader thread that
//! handles requests strictly in receipt order.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use telemetry_protocol::ServerRequest;

use super::client::{SockClient, SockSender};
use super::relay::ResultRelay;
use super::ServerError;
use crate::streams::StreamRegistry;

/// How often the accept loop re-checks the running flag
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Connection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptMode {
    /// Serve the first connection for the server's lifetime.
    #[default]
    Single,
    /// Keep accepting; every connection shares the registry.
    Multiple,
}

/// Socket server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind, 0 for an ephemeral port
    pub port: u16,
    pub accept_mode: AcceptMode,
    /// Poll interval of the result relays
    pub relay_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            accept_mode: AcceptMode::Single,
            relay_poll_interval: Duration::from_secs(1),
        }
    }
}

/// State shared by the accept, reader and relay threads
struct ServerContext {
    registry: Arc<dyn StreamRegistry>,
    running: Arc<AtomicBool>,
    connections: Mutex<HashMap<u64, SockSender>>,
    next_connection: AtomicU64,
    accept_mode: AcceptMode,
    relay_poll_interval: Duration,
}

impl ServerContext {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for connection in self.connections.lock().values() {
            connection.shutdown();
        }
    }

    fn register(&self, sender: SockSender) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
        self.connections.lock().insert(id, sender);
        id
    }

    fn unregister(&self, id: u64) {
        self.connections.lock().remove(&id);
    }
}

type Reader = JoinHandle<Result<(), ServerError>>;

/// Loopback socket server.
pub struct SocketServer {
    config: ServerConfig,
    context: Arc<ServerContext>,
    port: Option<u16>,
    accept_thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl SocketServer {
    pub fn new(registry: Arc<dyn StreamRegistry>, host: &str, port: u16) -> Self {
        Self::with_config(
            registry,
            ServerConfig {
                host: host.to_string(),
                port,
                ..ServerConfig::default()
            },
        )
    }

    pub fn with_config(registry: Arc<dyn StreamRegistry>, config: ServerConfig) -> Self {
        let context = Arc::new(ServerContext {
            registry,
            running: Arc::new(AtomicBool::new(false)),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(0),
            accept_mode: config.accept_mode,
            relay_poll_interval: config.relay_poll_interval,
        });
        Self {
            config,
            context,
            port: None,
            accept_thread: None,
        }
    }

    /// Bind, start accepting and return the bound port.
    pub fn start(&mut self) -> Result<u16, ServerError> {
        if self.accept_thread.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        self.context.running.store(true, Ordering::SeqCst);
        let context = Arc::clone(&self.context);
        let handle = std::thread::Builder::new()
            .name("SockSrvAcpt".to_string())
            .spawn(move || accept_loop(listener, context))?;

        tracing::info!(port, mode = ?self.config.accept_mode, "socket server listening");
        self.port = Some(port);
        self.accept_thread = Some(handle);
        Ok(port)
    }

    /// The bound port, once started.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.context.connections.lock().len()
    }

    /// Stop accepting and close every connection.
    pub fn stop(&self) {
        self.context.stop();
    }

    /// Wait for the server to finish. Returns the first fatal connection
    /// error, if any.
    pub fn join(&mut self) -> Result<(), ServerError> {
        let handle = self.accept_thread.take().ok_or(ServerError::NotStarted)?;
        handle
            .join()
            .map_err(|_| ServerError::ThreadPanicked("accept"))?
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        if self.accept_thread.is_some() {
            self.context.stop();
        }
    }
}

fn accept_loop(listener: TcpListener, context: Arc<ServerContext>) -> Result<(), ServerError> {
    let mut readers: Vec<Reader> = Vec::new();
    let mut result = Ok(());

    while context.is_running() {
        reap_finished(&mut readers, &mut result);

        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "accepted connection");
                stream.set_nonblocking(false)?;
                let reader_context = Arc::clone(&context);
                let reader = std::thread::Builder::new()
                    .name("SockSrvRdr".to_string())
                    .spawn(move || serve_connection(stream, reader_context))?;
                readers.push(reader);

                if context.accept_mode == AcceptMode::Single {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
            Err(e) => {
                context.stop();
                return Err(e.into());
            }
        }
    }
    drop(listener);

    for reader in readers {
        record_outcome(reader, &mut result);
    }

    // every reader is gone; let relays wind down
    context.stop();
    tracing::info!("socket server stopped");
    result
}

/// Join the readers that have already returned, keeping the first error.
fn reap_finished(readers: &mut Vec<Reader>, result: &mut Result<(), ServerError>) {
    let mut index = 0;
    while index < readers.len() {
        if readers[index].is_finished() {
            record_outcome(readers.swap_remove(index), result);
        } else {
            index += 1;
        }
    }
}

fn record_outcome(reader: Reader, result: &mut Result<(), ServerError>) {
    let outcome = reader
        .join()
        .unwrap_or(Err(ServerError::ThreadPanicked("reader")));
    if let Err(e) = outcome {
        if result.is_ok() {
            *result = Err(e);
        }
    }
}

fn serve_connection(stream: TcpStream, context: Arc<ServerContext>) -> Result<(), ServerError> {
    let mut client = SockClient::from_stream(stream)?;
    let sender = client.sender();
    let id = context.register(sender.clone());

    // stop() may have run before this connection was registered
    let result = if context.is_running() {
        read_requests(&mut client, &sender, &context)
    } else {
        Ok(())
    };
    if let Err(e) = &result {
        tracing::error!(error = %e, "closing connection");
    }
    sender.shutdown();
    context.unregister(id);
    result
}

fn read_requests(
    client: &mut SockClient,
    sender: &SockSender,
    context: &ServerContext,
) -> Result<(), ServerError> {
    while context.is_running() {
        let request = match client.read_server_request() {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::info!("client disconnected");
                return Ok(());
            }
            // reads fail once stop() shuts the socket down
            Err(_) if !context.is_running() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if !dispatch(request, sender, context)? {
            return Ok(());
        }
    }
    Ok(())
}

/// Handle one request. Returns false once the connection should stop.
fn dispatch(request: ServerRequest, sender: &SockSender, context: &ServerContext) -> Result<bool, ServerError> {
    let kind = request.kind();
    tracing::debug!(%kind, stream_id = request.stream_id(), "dispatching request");

    match request {
        ServerRequest::InformInit(init) => {
            let stream = context.registry.add_stream(&init.stream_id, init.settings);
            ResultRelay::new(
                stream,
                sender.clone(),
                Arc::clone(&context.running),
                context.relay_poll_interval,
            )
            .spawn()?;
        }
        ServerRequest::RecordCommunicate(record) | ServerRequest::RecordPublish(record) => {
            let stream = context
                .registry
                .get_stream(&record.stream_id)
                .ok_or_else(|| ServerError::UnknownStream {
                    kind,
                    stream_id: record.stream_id.clone(),
                })?;
            stream.push(record)?;
        }
        ServerRequest::InformFinish(finish) => {
            context.registry.del_stream(&finish.stream_id);
        }
        ServerRequest::InformTeardown(teardown) => {
            tracing::info!(exit_code = teardown.exit_code, "teardown requested");
            context.registry.teardown(teardown.exit_code);
            context.stop();
            return Ok(false);
        }
    }
    Ok(true)
}
