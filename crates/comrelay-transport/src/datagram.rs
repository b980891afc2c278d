//! UDP datagram clients carrying UTF-8 text
//!
//! A [`DatagramClient`] binds a local endpoint, sends to its configured remote
//! (or any per-call target), and hands every received datagram to an optional
//! callback on its receive task.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::registry::{BroadcastReport, Registry};
use crate::task::invoke_guarded;
use crate::udp::UdpEndpoint;

/// Invoked with `(client, payload, sender)` for every received datagram
pub type DatagramCallback = Arc<dyn Fn(&DatagramClient, &str, SocketAddr) + Send + Sync>;

/// Datagram client configuration
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Default send target
    pub remote: Endpoint,
    /// Local port to bind (0 = OS-assigned)
    pub listen_port: u16,
    /// Local interface to bind
    pub bind_host: String,
    /// Receive buffer size
    pub max_packet_size: usize,
}

impl DatagramConfig {
    pub fn new(remote: Endpoint) -> Self {
        Self {
            remote,
            listen_port: 0,
            bind_host: "0.0.0.0".to_string(),
            max_packet_size: 4096,
        }
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn bind_host(mut self, host: &str) -> Self {
        self.bind_host = host.to_string();
        self
    }
}

struct Inner {
    id: String,
    config: DatagramConfig,
    endpoint: Mutex<Option<Arc<UdpEndpoint>>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    callback: RwLock<Option<DatagramCallback>>,
}

/// A bound UDP endpoint with a default remote and a receive loop
#[derive(Clone)]
pub struct DatagramClient {
    inner: Arc<Inner>,
}

impl DatagramClient {
    pub fn new(id: &str, config: DatagramConfig, callback: Option<DatagramCallback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                config,
                endpoint: Mutex::new(None),
                remote_addr: Mutex::new(None),
                callback: RwLock::new(callback),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn remote(&self) -> &Endpoint {
        &self.inner.config.remote
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.config.listen_port
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.endpoint.lock().as_ref().map(|e| e.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.inner.endpoint.lock().is_some()
    }

    pub fn set_callback(&self, callback: Option<DatagramCallback>) {
        *self.inner.callback.write() = callback;
    }

    /// Resolve the remote, bind, and start receiving
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(TransportError::AlreadyStarted);
        }

        let config = &self.inner.config;
        let remote = config.remote.resolve().await?;
        let endpoint = UdpEndpoint::bind(&config.bind_host, config.listen_port).await?;

        // The loop holds a weak handle so a dropped client is not kept alive
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        endpoint.spawn_receiver(&self.inner.id, config.max_packet_size, move |data, from| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let client = DatagramClient { inner };
            client.dispatch(data, from);
        })?;

        let local = endpoint.local_addr();
        {
            let mut slot = self.inner.endpoint.lock();
            if slot.is_some() {
                return Err(TransportError::AlreadyStarted);
            }
            *slot = Some(Arc::new(endpoint));
        }
        *self.inner.remote_addr.lock() = Some(remote);

        info!(client = %self.inner.id, "started, listening on port {}", local.port());
        Ok(())
    }

    fn dispatch(&self, data: &[u8], from: SocketAddr) {
        let message = String::from_utf8_lossy(data);
        info!(client = %self.inner.id, "received from {}: {}", from, message);

        let callback = self.inner.callback.read().clone();
        if let Some(callback) = callback {
            invoke_guarded(&self.inner.id, || callback(self, &message, from));
        }
    }

    /// Send to `target`, or to the configured remote when `None`
    pub async fn send(&self, message: &str, target: Option<SocketAddr>) -> Result<()> {
        let endpoint = self.inner.endpoint.lock().clone();
        let Some(endpoint) = endpoint else {
            warn!(client = %self.inner.id, "socket not started");
            return Err(TransportError::NotStarted);
        };

        let remote = *self.inner.remote_addr.lock();
        let target = match target.or(remote) {
            Some(addr) => addr,
            None => {
                return Err(TransportError::InvalidEndpoint(
                    self.inner.config.remote.to_string(),
                ))
            }
        };

        match endpoint.send_to(message.as_bytes(), target).await {
            Ok(_) => {
                debug!(client = %self.inner.id, "sent to {}: {}", target, message);
                Ok(())
            }
            Err(e) => {
                warn!(client = %self.inner.id, "failed to send message: {}", e);
                Err(e)
            }
        }
    }

    /// Close the socket and end the receive loop. Idempotent.
    pub fn stop(&self) {
        if let Some(endpoint) = self.inner.endpoint.lock().take() {
            endpoint.close();
            info!(client = %self.inner.id, "stopped");
        }
    }

    pub fn info(&self) -> DatagramClientInfo {
        DatagramClientInfo {
            id: self.inner.id.clone(),
            remote: self.inner.config.remote.clone(),
            local_addr: self.local_addr(),
        }
    }
}

/// Listing entry for a datagram client
#[derive(Debug, Clone, Serialize)]
pub struct DatagramClientInfo {
    pub id: String,
    pub remote: Endpoint,
    pub local_addr: Option<SocketAddr>,
}

/// Named registry of datagram clients
#[derive(Default)]
pub struct DatagramClientManager {
    clients: Registry<DatagramClient>,
}

impl DatagramClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register and start a client. A client that fails to bind is not kept.
    pub async fn add(
        &self,
        id: &str,
        config: DatagramConfig,
        callback: Option<DatagramCallback>,
    ) -> Result<()> {
        let remote = config.remote.clone();
        let client = self
            .clients
            .insert_with(id, || DatagramClient::new(id, config, callback))
            .map_err(|e| {
                warn!("UDP client '{}' already exists!", id);
                e
            })?;

        if let Err(e) = client.start().await {
            warn!("UDP client '{}' failed to start: {}", id, e);
            let _ = self.clients.remove(id);
            return Err(e);
        }

        info!("Added UDP client '{}' for {}", id, remote);
        Ok(())
    }

    /// Replace a client's callback while holding the registry lock
    pub fn set_callback(&self, id: &str, callback: Option<DatagramCallback>) -> Result<()> {
        self.clients
            .with_client(id, |client| client.set_callback(callback))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let client = self.clients.remove(id).map_err(|e| {
            warn!("UDP client '{}' not found!", id);
            e
        })?;
        client.stop();
        info!("Removed UDP client '{}'", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<DatagramClient>> {
        self.clients.get(id)
    }

    pub async fn send(&self, id: &str, message: &str, target: Option<SocketAddr>) -> Result<()> {
        let client = self.clients.get(id).map_err(|e| {
            warn!("UDP client '{}' not found!", id);
            e
        })?;
        client.send(message, target).await
    }

    /// Send from every client to its own remote; the registry lock is not
    /// held while sending
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, client) in self.clients.snapshot() {
            report.record(id, client.send(message, None).await);
        }
        report
    }

    pub fn list(&self) -> Vec<DatagramClientInfo> {
        let infos: Vec<_> = self
            .clients
            .snapshot()
            .into_iter()
            .map(|(_, client)| client.info())
            .collect();

        if infos.is_empty() {
            info!("No UDP clients connected");
        } else {
            info!("Connected UDP clients:");
            for c in &infos {
                match c.local_addr {
                    Some(local) => info!("  {}: {} (listen: {})", c.id, c.remote, local.port()),
                    None => info!("  {}: {}", c.id, c.remote),
                }
            }
        }
        infos
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn stop_all(&self) {
        for (_, client) in self.clients.drain() {
            client.stop();
        }
        info!("All UDP clients stopped");
    }
}
