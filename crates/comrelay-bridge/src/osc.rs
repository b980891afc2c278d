//! OSC (Open Sound Control) clients
//!
//! An [`OscClient`] always sends from an ephemeral socket to its configured
//! target. When a listen port is configured it also binds a receiver that
//! decodes incoming packets, flattens bundles, and hands each message to the
//! client's callback in order.

use comrelay_transport::{invoke_guarded, BroadcastReport, Endpoint, Registry, UdpEndpoint};
use parking_lot::{Mutex, RwLock};
use rosc::{OscMessage, OscPacket, OscType};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::{BridgeError, Result};

/// Invoked with `(client, address, args)` for every received OSC message
pub type OscCallback = Arc<dyn Fn(&OscClient, &str, &[OscType]) + Send + Sync>;

/// OSC client configuration
#[derive(Debug, Clone)]
pub struct OscConfig {
    /// Where messages are sent
    pub send: Endpoint,
    /// Port to receive on; `None` makes the client send-only
    pub listen_port: Option<u16>,
    /// Local interface for the receiver
    pub bind_host: String,
}

impl OscConfig {
    pub fn new(send: Endpoint) -> Self {
        Self {
            send,
            listen_port: None,
            bind_host: "0.0.0.0".to_string(),
        }
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    pub fn bind_host(mut self, host: &str) -> Self {
        self.bind_host = host.to_string();
        self
    }
}

struct Inner {
    id: String,
    config: OscConfig,
    sender: Mutex<Option<(Arc<UdpEndpoint>, SocketAddr)>>,
    listener: Mutex<Option<UdpEndpoint>>,
    callback: RwLock<Option<OscCallback>>,
}

#[derive(Clone)]
pub struct OscClient {
    inner: Arc<Inner>,
}

impl OscClient {
    pub fn new(id: &str, config: OscConfig, callback: Option<OscCallback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                config,
                sender: Mutex::new(None),
                listener: Mutex::new(None),
                callback: RwLock::new(callback),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &OscConfig {
        &self.inner.config
    }

    /// Address of the receiver, if one is bound
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().map(|l| l.local_addr())
    }

    /// Address messages are sent from
    pub fn send_addr(&self) -> Option<SocketAddr> {
        self.inner.sender.lock().as_ref().map(|(s, _)| s.local_addr())
    }

    pub fn is_running(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    pub fn set_callback(&self, callback: Option<OscCallback>) {
        *self.inner.callback.write() = callback;
    }

    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(BridgeError::AlreadyStarted);
        }

        let config = &self.inner.config;
        let target = config.send.resolve().await?;
        let sender = UdpEndpoint::bind("0.0.0.0", 0).await?;

        let listener = match config.listen_port {
            Some(port) => {
                let listener = UdpEndpoint::bind(&config.bind_host, port).await?;
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                listener.spawn_receiver(&self.inner.id, rosc::decoder::MTU, move |data, from| {
                    if let Some(inner) = weak.upgrade() {
                        OscClient { inner }.handle_packet(data, from);
                    }
                })?;
                info!(client = %self.inner.id, "Listening for OSC on port {}", listener.local_addr().port());
                Some(listener)
            }
            None => {
                info!(client = %self.inner.id, "No listen port specified; will only send.");
                None
            }
        };

        *self.inner.sender.lock() = Some((Arc::new(sender), target));
        *self.inner.listener.lock() = listener;
        Ok(())
    }

    fn handle_packet(&self, data: &[u8], from: SocketAddr) {
        let packet = match rosc::decoder::decode_udp(data) {
            Ok((_, packet)) => packet,
            Err(e) => {
                debug!(client = %self.inner.id, "decode error from {}: {:?}", from, e);
                return;
            }
        };

        let mut messages = Vec::new();
        flatten_packet(packet, &mut messages);

        for msg in messages {
            debug!(client = %self.inner.id, "Received: {} {}", msg.addr, describe_args(&msg.args));
            let callback = self.inner.callback.read().clone();
            if let Some(callback) = callback {
                invoke_guarded(&self.inner.id, || callback(self, &msg.addr, &msg.args));
            }
        }
    }

    /// Encode and send one message to the configured target
    pub async fn send(&self, address: &str, args: Vec<OscType>) -> Result<()> {
        let sender = self.inner.sender.lock().clone();
        let Some((socket, target)) = sender else {
            warn!(client = %self.inner.id, "Failed to send message: not started");
            return Err(BridgeError::NotStarted);
        };

        let packet = OscPacket::Message(OscMessage {
            addr: address.to_string(),
            args,
        });
        let bytes = rosc::encoder::encode(&packet)
            .map_err(|e| BridgeError::Protocol(format!("OSC encode error: {:?}", e)))?;

        socket.send_to(&bytes, target).await.map_err(|e| {
            warn!(client = %self.inner.id, "Failed to send message: {}", e);
            BridgeError::from(e)
        })?;

        if let OscPacket::Message(msg) = &packet {
            debug!(client = %self.inner.id, "Sent: {} {}", msg.addr, describe_args(&msg.args));
        }
        Ok(())
    }

    /// Close both sockets. Idempotent.
    pub fn stop(&self) {
        let sender = self.inner.sender.lock().take();
        let listener = self.inner.listener.lock().take();
        if let Some((socket, _)) = &sender {
            socket.close();
        }
        if sender.is_some() || listener.is_some() {
            info!(client = %self.inner.id, "Stopped.");
        }
    }

    pub fn info(&self) -> OscClientInfo {
        OscClientInfo {
            id: self.inner.id.clone(),
            send: self.inner.config.send.clone(),
            listen_port: self.inner.config.listen_port,
        }
    }
}

/// Bundles are flattened depth-first, preserving message order
fn flatten_packet(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for p in bundle.content {
                flatten_packet(p, out);
            }
        }
    }
}

/// Render arguments for logs: `[1, 0.5, "x"]`
pub fn describe_args(args: &[OscType]) -> String {
    let parts: Vec<String> = args
        .iter()
        .map(|arg| match arg {
            OscType::Int(i) => i.to_string(),
            OscType::Long(l) => l.to_string(),
            OscType::Float(f) => f.to_string(),
            OscType::Double(d) => d.to_string(),
            OscType::String(s) => format!("{:?}", s),
            OscType::Bool(b) => b.to_string(),
            OscType::Char(c) => format!("{:?}", c),
            OscType::Nil => "nil".to_string(),
            OscType::Inf => "inf".to_string(),
            other => format!("{:?}", other),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

/// Interpret a shell token as a typed OSC argument
pub fn parse_osc_arg(token: &str) -> OscType {
    if let Ok(i) = token.parse::<i32>() {
        return OscType::Int(i);
    }
    if let Ok(f) = token.parse::<f32>() {
        if f.is_finite() {
            return OscType::Float(f);
        }
    }
    match token {
        "true" => OscType::Bool(true),
        "false" => OscType::Bool(false),
        _ => OscType::String(token.to_string()),
    }
}

/// Listing entry for an OSC client
#[derive(Debug, Clone, Serialize)]
pub struct OscClientInfo {
    pub id: String,
    pub send: Endpoint,
    pub listen_port: Option<u16>,
}

/// Named registry of OSC clients
#[derive(Default)]
pub struct OscClientManager {
    clients: Registry<OscClient>,
}

impl OscClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, id: &str, config: OscConfig, callback: Option<OscCallback>) -> Result<()> {
        let send = config.send.clone();
        let client = self
            .clients
            .insert_with(id, || OscClient::new(id, config, callback))
            .map_err(|e| {
                warn!("OSC client '{}' already exists!", id);
                BridgeError::from(e)
            })?;

        if let Err(e) = client.start().await {
            warn!("OSC client '{}' failed to start: {}", id, e);
            let _ = self.clients.remove(id);
            return Err(e);
        }

        info!("Added OSC client '{}' for {}", id, send);
        Ok(())
    }

    pub fn set_callback(&self, id: &str, callback: Option<OscCallback>) -> Result<()> {
        Ok(self
            .clients
            .with_client(id, |client| client.set_callback(callback))?)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let client = self.clients.remove(id).map_err(|e| {
            warn!("OSC client '{}' not found!", id);
            BridgeError::from(e)
        })?;
        client.stop();
        info!("Removed OSC client '{}'", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<OscClient>> {
        Ok(self.clients.get(id)?)
    }

    pub async fn send(&self, id: &str, address: &str, args: Vec<OscType>) -> Result<()> {
        let client = self.clients.get(id).map_err(|e| {
            warn!("OSC client '{}' not found!", id);
            BridgeError::from(e)
        })?;
        client.send(address, args).await
    }

    pub async fn broadcast(&self, address: &str, args: Vec<OscType>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, client) in self.clients.snapshot() {
            let result = client.send(address, args.clone()).await.map_err(|e| match e {
                BridgeError::Transport(t) => t,
                other => comrelay_transport::TransportError::SendFailed(other.to_string()),
            });
            report.record(id, result);
        }
        report
    }

    pub fn list(&self) -> Vec<OscClientInfo> {
        let infos: Vec<_> = self
            .clients
            .snapshot()
            .into_iter()
            .map(|(_, client)| client.info())
            .collect();

        if infos.is_empty() {
            info!("No OSC clients connected");
        } else {
            info!("Connected OSC clients:");
            for c in &infos {
                match c.listen_port {
                    Some(port) => info!("  {}: {} (listen: {})", c.id, c.send, port),
                    None => info!("  {}: {} (listen: None)", c.id, c.send),
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
        info!("All OSC clients stopped");
    }
}
