//! Relay core
//!
//! Owns one manager per protocol and wires the inbound ones to the stream
//! manager:
//! - OSC messages and MIDI control changes are translated and broadcast to
//!   every stream client
//! - Datagram payloads are forwarded verbatim to one stream client, and its
//!   first reply goes back to the datagram sender
//!
//! Callbacks hold only a weak reference to the relay so clients never keep
//! their own managers alive.

use comrelay_bridge::{
    MidiCallback, MidiClient, MidiClientManager, MidiDriver, MidiEvent, MidiMessage, OscCallback,
    OscClient, OscClientManager, OscConfig,
};
use comrelay_transport::{
    BroadcastReport, DatagramCallback, DatagramClient, DatagramClientManager, DatagramConfig,
    Endpoint, StreamClientManager,
};
use rosc::OscType;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::translate;

/// Counters across all inbound protocols
#[derive(Debug, Default)]
pub struct RelayStats {
    forwarded: AtomicU64,
    replies: AtomicU64,
    broadcasts: AtomicU64,
    unrecognized: AtomicU64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::SeqCst),
            replies: self.replies.load(Ordering::SeqCst),
            broadcasts: self.broadcasts.load(Ordering::SeqCst),
            unrecognized: self.unrecognized.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    /// Datagram payloads forwarded to the target stream
    pub forwarded: u64,
    /// Stream replies echoed back to datagram senders
    pub replies: u64,
    /// Commands broadcast to the stream clients
    pub broadcasts: u64,
    /// OSC or MIDI input that matched no rule
    pub unrecognized: u64,
}

struct Inner {
    config: RelayConfig,
    streams: StreamClientManager,
    datagrams: DatagramClientManager,
    osc: OscClientManager,
    midi: MidiClientManager,
    stats: RelayStats,
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

impl Relay {
    /// Relay reading MIDI from host devices
    #[cfg(feature = "midi")]
    pub fn new(config: RelayConfig) -> Self {
        Self::with_midi_driver(config, Arc::new(comrelay_bridge::MidirDriver::default()))
    }

    pub fn with_midi_driver(config: RelayConfig, driver: Arc<dyn MidiDriver>) -> Self {
        let streams = StreamClientManager::new(config.stream.to_stream_config());
        Self {
            inner: Arc::new(Inner {
                config,
                streams,
                datagrams: DatagramClientManager::new(),
                osc: OscClientManager::new(),
                midi: MidiClientManager::new(driver),
                stats: RelayStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn streams(&self) -> &StreamClientManager {
        &self.inner.streams
    }

    pub fn datagrams(&self) -> &DatagramClientManager {
        &self.inner.datagrams
    }

    pub fn osc(&self) -> &OscClientManager {
        &self.inner.osc
    }

    pub fn midi(&self) -> &MidiClientManager {
        &self.inner.midi
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Register every configured client.
    ///
    /// Stream, datagram and OSC clients that cannot be created fail the whole
    /// start, and every client added before the failure is stopped again. A
    /// MIDI client whose device is missing is logged and skipped.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.add_clients().await {
            warn!("relay start failed: {}", e);
            self.shutdown();
            return Err(e);
        }

        info!(
            streams = self.inner.streams.len(),
            datagram = self.inner.datagrams.len(),
            osc = self.inner.osc.len(),
            midi = self.inner.midi.len(),
            "relay started"
        );
        Ok(())
    }

    async fn add_clients(&self) -> Result<()> {
        let config = &self.inner.config;

        for entry in &config.streams {
            self.inner.streams.add(&entry.id, entry.endpoint()).await?;
        }

        for entry in &config.datagram {
            let datagram = DatagramConfig::new(Endpoint::new(entry.host.clone(), entry.port))
                .listen_port(entry.listen_port);
            self.inner
                .datagrams
                .add(&entry.id, datagram, Some(self.datagram_callback()))
                .await?;
        }

        for entry in &config.osc {
            let mut osc = OscConfig::new(Endpoint::new(entry.host.clone(), entry.port));
            if let Some(port) = entry.listen_port {
                osc = osc.listen_port(port);
            }
            self.inner
                .osc
                .add(&entry.id, osc, Some(self.osc_callback()))
                .await?;
        }

        for entry in &config.midi {
            let index = match entry.device {
                Some(index) => index,
                None => match self.inner.midi.auto_select_device() {
                    Ok(index) => index,
                    Err(e) => {
                        warn!("{}. MIDI client '{}' not started", e, entry.id);
                        continue;
                    }
                },
            };
            if let Err(e) = self
                .inner
                .midi
                .add(&entry.id, index, Some(self.midi_callback()))
            {
                warn!("MIDI client '{}' not started: {}", entry.id, e);
            }
        }
        Ok(())
    }

    /// Translate one OSC message and broadcast the result.
    /// Returns `None` when the address or arguments match no rule.
    pub fn on_osc_message(&self, address: &str, args: &[OscType]) -> Option<BroadcastReport> {
        match translate::osc_command(&self.inner.config.osc_routes, address, args) {
            Some(command) => Some(self.broadcast(&command)),
            None => {
                self.inner.stats.unrecognized.fetch_add(1, Ordering::SeqCst);
                warn!("Unknown OSC message: {} {:?}", address, args);
                None
            }
        }
    }

    /// Translate one decoded MIDI event and broadcast the result.
    /// Returns `None` for events on unmapped controllers.
    pub fn on_midi_event(&self, message: &MidiMessage) -> Option<BroadcastReport> {
        match translate::midi_command(&self.inner.config.faders, message) {
            Some(command) => Some(self.broadcast(&command)),
            None => {
                self.inner.stats.unrecognized.fetch_add(1, Ordering::SeqCst);
                warn!("Unmapped MIDI event: {}", message);
                None
            }
        }
    }

    /// Forward a datagram payload to the target stream; the first reply is
    /// sent back to `from` from a separate task
    pub fn on_datagram(&self, client: &DatagramClient, payload: &str, from: SocketAddr) {
        debug!("UDP message from {}: {}", from, payload);

        let target_id = &self.inner.config.datagram_target;
        let target = match self.inner.streams.get(target_id) {
            Ok(target) => target,
            Err(_) => {
                warn!("datagram target '{}' is not registered, dropping message", target_id);
                return;
            }
        };
        if !target.is_connected() {
            warn!("datagram target '{}' is not connected, dropping message", target_id);
            return;
        }
        self.inner.stats.forwarded.fetch_add(1, Ordering::SeqCst);

        let weak = Arc::downgrade(&self.inner);
        let client = client.clone();
        let payload = payload.to_string();
        let timeout = self.inner.config.reply_timeout();

        tokio::spawn(async move {
            match target.request(&payload, timeout).await {
                Ok(reply) => {
                    let reply = String::from_utf8_lossy(&reply);
                    if client.send(&reply, Some(from)).await.is_ok() {
                        if let Some(inner) = weak.upgrade() {
                            inner.stats.replies.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                Err(e) => debug!("no reply from '{}': {}", target.id(), e),
            }
        });
    }

    fn broadcast(&self, command: &str) -> BroadcastReport {
        let report = self.inner.streams.broadcast(command);
        self.inner.stats.broadcasts.fetch_add(1, Ordering::SeqCst);

        info!(
            delivered = report.delivered().len(),
            failed = report.failed().len(),
            "relayed {}",
            command
        );
        report
    }

    pub fn osc_callback(&self) -> OscCallback {
        let weak = self.downgrade();
        Arc::new(move |_: &OscClient, address: &str, args: &[OscType]| {
            if let Some(relay) = Relay::upgrade(&weak) {
                relay.on_osc_message(address, args);
            }
        })
    }

    pub fn midi_callback(&self) -> MidiCallback {
        let weak = self.downgrade();
        Arc::new(move |_: &MidiClient, _: &MidiEvent, message: &MidiMessage| {
            if let Some(relay) = Relay::upgrade(&weak) {
                relay.on_midi_event(message);
            }
        })
    }

    pub fn datagram_callback(&self) -> DatagramCallback {
        let weak = self.downgrade();
        Arc::new(move |client: &DatagramClient, payload: &str, from: SocketAddr| {
            if let Some(relay) = Relay::upgrade(&weak) {
                relay.on_datagram(client, payload, from);
            }
        })
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Relay> {
        weak.upgrade().map(|inner| Relay { inner })
    }

    /// Stop every client of every protocol
    pub fn shutdown(&self) {
        self.inner.streams.stop_all();
        self.inner.datagrams.stop_all();
        self.inner.osc.stop_all();
        self.inner.midi.stop_all();
        info!("relay stopped");
    }
}
