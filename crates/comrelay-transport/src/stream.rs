//! Persistent TCP stream clients
//!
//! Each [`StreamClient`] owns one outbound connection to a fixed endpoint and
//! a single supervisor task that drives it through
//! `Disconnected -> Connecting -> Connected`. The supervisor is the only code
//! that touches the socket: it retries refused or failed connects after a
//! fixed interval, writes queued messages, and logs whatever the peer sends.
//! A peer close or I/O error drops the socket and sends the supervisor back to
//! `Connecting`, so there is never more than one connect loop per client.
//!
//! Bytes are written raw, with no framing; the peer defines message
//! boundaries through its own grammar.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::registry::{BroadcastReport, Registry};
use crate::task::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

/// Delay between connection attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long `start()` waits for the first attempt to connect
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Sent once after every successful connect; `{id}` expands to the client id
pub const DEFAULT_GREETING: &str = "Hello from TCP client {id}!";

/// Stream client configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Fixed delay between connection attempts (no growth, no limit)
    pub reconnect_interval: Duration,
    /// Time `start()` waits for the initial connection before returning
    pub startup_grace: Duration,
    /// Greeting template written after each connect
    pub greeting: Option<String>,
    /// TCP keepalive time in seconds (0 = disabled)
    pub keepalive_secs: u64,
    /// Size of a single read from the socket
    pub read_buffer_size: usize,
    /// Messages that may be queued for the writer before sends fail
    pub outbound_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            startup_grace: DEFAULT_STARTUP_GRACE,
            greeting: Some(DEFAULT_GREETING.to_string()),
            keepalive_secs: 30,
            read_buffer_size: 1024,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        f.write_str(s)
    }
}

/// Why the I/O loop of one connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionExit {
    PeerClosed,
    Failed,
    Shutdown,
}

/// State shared between a client handle and its supervisor task
struct Shared {
    id: String,
    endpoint: Endpoint,
    config: StreamConfig,
    state: watch::Sender<ConnectionState>,
    /// Present only while connected
    outgoing: Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound: broadcast::Sender<Bytes>,
    attempts: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(client = %self.id, "{} -> {}", previous, state);
        }
    }

    fn greeting(&self) -> Option<String> {
        self.config
            .greeting
            .as_deref()
            .filter(|g| !g.is_empty())
            .map(|g| g.replace("{id}", &self.id))
    }
}

/// One persistent, auto-reconnecting TCP connection
pub struct StreamClient {
    shared: Arc<Shared>,
    trigger: ShutdownTrigger,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl StreamClient {
    pub fn new(id: &str, endpoint: Endpoint, config: StreamConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = broadcast::channel(64);
        let (trigger, _) = shutdown_channel();

        Self {
            shared: Arc::new(Shared {
                id: id.to_string(),
                endpoint,
                config,
                state,
                outgoing: Mutex::new(None),
                inbound,
                attempts: AtomicU64::new(0),
            }),
            trigger,
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the client reaches `state`, up to `max_wait`
    pub async fn wait_for_state(&self, state: ConnectionState, max_wait: Duration) -> bool {
        let mut changes = self.state_changes();
        let reached = tokio::time::timeout(max_wait, changes.wait_for(|s| *s == state)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Number of connection attempts made so far
    pub fn connect_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Everything the peer sends, chunked as read from the socket
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.shared.inbound.subscribe()
    }

    /// Spawn the supervisor and give the first connect attempt up to
    /// `startup_grace` to succeed. Failure to connect is not an error; the
    /// supervisor keeps retrying in the background.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }

        {
            let mut task = self.task.lock();
            if task.is_some() {
                return Err(TransportError::AlreadyStarted);
            }
            let shared = self.shared.clone();
            let signal = self.trigger.signal();
            *task = Some(tokio::spawn(supervise(shared, signal)));
        }

        let grace = self.shared.config.startup_grace;
        if !grace.is_zero() && !self.wait_for_state(ConnectionState::Connected, grace).await {
            debug!(
                client = %self.shared.id,
                "not connected after {:?}, retrying in background", grace
            );
        }

        Ok(())
    }

    /// Queue `message` for the writer. Fails immediately when not connected.
    pub fn send(&self, message: &str) -> Result<()> {
        self.send_bytes(Bytes::copy_from_slice(message.as_bytes()))
    }

    pub fn send_bytes(&self, data: Bytes) -> Result<()> {
        let outgoing = self.shared.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            warn!(client = %self.shared.id, "not connected, message dropped");
            return Err(TransportError::NotConnected);
        };

        tx.try_send(data).map_err(|e| {
            let err = match e {
                TrySendError::Full(_) => TransportError::BufferFull,
                TrySendError::Closed(_) => TransportError::ConnectionClosed,
            };
            warn!(client = %self.shared.id, "failed to send message: {}", err);
            err
        })
    }

    /// Send `message` and wait for the next chunk the peer sends back.
    ///
    /// Correlation is positional: whatever arrives first after the send is
    /// taken as the reply.
    pub async fn request(&self, message: &str, timeout: Duration) -> Result<Bytes> {
        let mut responses = self.subscribe();
        self.send(message)?;

        match tokio::time::timeout(timeout, responses.recv()).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Permanently disable reconnection and release the socket. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.trigger.trigger();
        *self.shared.outgoing.lock() = None;
        // Detach: the supervisor observes the signal and drops the socket
        self.task.lock().take();
        self.shared.set_state(ConnectionState::Disconnected);
        info!(client = %self.shared.id, "connection closed");
    }

    pub fn info(&self) -> StreamClientInfo {
        StreamClientInfo {
            id: self.shared.id.clone(),
            endpoint: self.shared.endpoint.clone(),
            state: self.state(),
        }
    }
}

/// Connect-and-retry loop, then I/O loop, until shutdown
async fn supervise(shared: Arc<Shared>, mut shutdown: ShutdownSignal) {
    let id = shared.id.as_str();
    let interval = shared.config.reconnect_interval;

    while !shutdown.is_triggered() {
        shared.set_state(ConnectionState::Connecting);
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(client = id, attempt, "connecting to {}", shared.endpoint);

        let connected = tokio::select! {
            result = open_connection(&shared) => result,
            _ = shutdown.triggered() => break,
        };

        match connected {
            Ok(stream) => {
                info!(client = id, "connected to {}", shared.endpoint);
                if run_connection(&shared, stream, &mut shutdown).await == ConnectionExit::Shutdown {
                    break;
                }
            }
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected);
                warn!(client = id, "{}. Retrying in {:?}", e, interval);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.triggered() => break,
                }
            }
        }
    }

    *shared.outgoing.lock() = None;
    shared.set_state(ConnectionState::Disconnected);
    debug!(client = id, "supervisor exited");
}

async fn open_connection(shared: &Shared) -> Result<TcpStream> {
    let endpoint = &shared.endpoint;
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;

    if shared.config.keepalive_secs > 0 {
        let socket = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(shared.config.keepalive_secs));
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            debug!(client = %shared.id, "could not enable keepalive: {}", e);
        }
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client = %shared.id, "could not set TCP_NODELAY: {}", e);
    }

    Ok(stream)
}

/// Own one live connection until the peer closes it, it fails, or shutdown
async fn run_connection(
    shared: &Shared,
    stream: TcpStream,
    shutdown: &mut ShutdownSignal,
) -> ConnectionExit {
    let id = shared.id.as_str();
    let (mut reader, mut writer) = stream.into_split();

    if let Some(greeting) = shared.greeting() {
        if let Err(e) = writer.write_all(greeting.as_bytes()).await {
            warn!(client = id, "failed to send greeting: {}", e);
            shared.set_state(ConnectionState::Disconnected);
            return ConnectionExit::Failed;
        }
        info!(client = id, "sent: {}", greeting);
    }

    let (tx, mut rx) = mpsc::channel::<Bytes>(shared.config.outbound_buffer.max(1));
    {
        // stop() triggers before it clears `outgoing`, so checking under the
        // lock means a stopped client is never published as connected
        let mut outgoing = shared.outgoing.lock();
        if shutdown.is_triggered() {
            return ConnectionExit::Shutdown;
        }
        *outgoing = Some(tx);
        shared.set_state(ConnectionState::Connected);
    }

    let mut buf = vec![0u8; shared.config.read_buffer_size.max(1)];

    let exit = loop {
        tokio::select! {
            _ = shutdown.triggered() => break ConnectionExit::Shutdown,

            Some(data) = rx.recv() => {
                if let Err(e) = writer.write_all(&data).await {
                    error!(client = id, "write failed: {}", e);
                    break ConnectionExit::Failed;
                }
                debug!(client = id, "sent: {}", String::from_utf8_lossy(&data));
            }

            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    info!(client = id, "server closed the connection, reconnecting");
                    break ConnectionExit::PeerClosed;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    info!(client = id, "received: {}", String::from_utf8_lossy(&data));
                    let _ = shared.inbound.send(data);
                }
                Err(e) => {
                    warn!(client = id, "connection lost: {}, reconnecting", e);
                    break ConnectionExit::Failed;
                }
            },
        }
    };

    *shared.outgoing.lock() = None;
    shared.set_state(ConnectionState::Disconnected);
    exit
}

/// Listing entry for a stream client
#[derive(Debug, Clone, Serialize)]
pub struct StreamClientInfo {
    pub id: String,
    pub endpoint: Endpoint,
    pub state: ConnectionState,
}

/// Named registry of stream clients
pub struct StreamClientManager {
    clients: Registry<StreamClient>,
    config: StreamConfig,
}

impl StreamClientManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            clients: Registry::new(),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Register and start a client for `endpoint`
    pub async fn add(&self, id: &str, endpoint: Endpoint) -> Result<()> {
        let config = self.config.clone();
        let target = endpoint.clone();
        let client = self
            .clients
            .insert_with(id, || StreamClient::new(id, target, config))
            .map_err(|e| {
                warn!("Client '{}' already exists!", id);
                e
            })?;

        client.start().await?;
        info!("Added client '{}' for {}", id, endpoint);
        Ok(())
    }

    /// Stop and deregister a client
    pub fn remove(&self, id: &str) -> Result<()> {
        let client = self.clients.remove(id).map_err(|e| {
            warn!("Client '{}' not found!", id);
            e
        })?;
        client.stop();
        info!("Removed client '{}'", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<StreamClient>> {
        self.clients.get(id)
    }

    /// Send to one named client
    pub fn send(&self, id: &str, message: &str) -> Result<()> {
        let client = self.clients.get(id).map_err(|e| {
            warn!("Client '{}' not found!", id);
            e
        })?;
        client.send(message)
    }

    /// Send to every registered client; one failure does not stop the rest
    pub fn broadcast(&self, message: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, client) in self.clients.snapshot() {
            report.record(id, client.send(message));
        }
        report
    }

    pub fn list(&self) -> Vec<StreamClientInfo> {
        let infos: Vec<_> = self
            .clients
            .snapshot()
            .into_iter()
            .map(|(_, client)| client.info())
            .collect();

        if infos.is_empty() {
            info!("No clients connected");
        } else {
            info!("Connected clients:");
            for c in &infos {
                info!("  {}: {} - {}", c.id, c.endpoint, c.state);
            }
        }
        infos
    }

    pub fn ids(&self) -> Vec<String> {
        self.clients.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Stop and deregister every client
    pub fn stop_all(&self) {
        for (_, client) in self.clients.drain() {
            client.stop();
        }
        info!("All clients stopped");
    }
}

impl Default for StreamClientManager {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}
