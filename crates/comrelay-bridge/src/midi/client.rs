//! Deduplicating MIDI clients and their registry

use comrelay_transport::{invoke_guarded, shutdown_channel, Registry, ShutdownSignal, ShutdownTrigger};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::driver::{MidiDevice, MidiDriver};
use super::reader::MidiDeviceReader;
use super::{MidiEvent, MidiMessage};
use crate::{BridgeError, Result};

/// Invoked with `(client, event, decoded)` for every event that changed a value
pub type MidiCallback = Arc<dyn Fn(&MidiClient, &MidiEvent, &MidiMessage) + Send + Sync>;

/// Last `data2` seen per `(status, data1)`
#[derive(Debug, Default)]
pub struct LastValueCache {
    values: HashMap<(u8, u8), u8>,
}

impl LastValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event`. Returns `false` when it repeats the cached value.
    pub fn observe(&mut self, event: &MidiEvent) -> bool {
        let key = (event.status(), event.data1());
        let value = event.data2();
        if self.values.get(&key) == Some(&value) {
            return false;
        }
        self.values.insert(key, value);
        true
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct Inner {
    id: String,
    device_index: usize,
    driver: Arc<dyn MidiDriver>,
    reader: Mutex<Option<MidiDeviceReader>>,
    trigger: Mutex<Option<ShutdownTrigger>>,
    /// Set while `start` opens the device
    starting: AtomicBool,
    callback: RwLock<Option<MidiCallback>>,
    cache: Mutex<LastValueCache>,
    delivered: AtomicU64,
    suppressed: AtomicU64,
}

/// Reads one device and forwards value changes to a callback
#[derive(Clone)]
pub struct MidiClient {
    inner: Arc<Inner>,
}

impl MidiClient {
    pub fn new(
        id: &str,
        device_index: usize,
        driver: Arc<dyn MidiDriver>,
        callback: Option<MidiCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                device_index,
                driver,
                reader: Mutex::new(None),
                trigger: Mutex::new(None),
                starting: AtomicBool::new(false),
                callback: RwLock::new(callback),
                cache: Mutex::new(LastValueCache::new()),
                delivered: AtomicU64::new(0),
                suppressed: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn device_index(&self) -> usize {
        self.inner.device_index
    }

    pub fn device(&self) -> Option<MidiDevice> {
        self.inner
            .reader
            .lock()
            .as_ref()
            .and_then(|r| r.device().cloned())
    }

    pub fn is_running(&self) -> bool {
        self.inner.trigger.lock().is_some()
    }

    pub fn set_callback(&self, callback: Option<MidiCallback>) {
        *self.inner.callback.write() = callback;
    }

    /// Events handed to the callback so far
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::SeqCst)
    }

    /// Events dropped as unchanged repeats so far
    pub fn suppressed(&self) -> u64 {
        self.inner.suppressed.load(Ordering::SeqCst)
    }

    /// Open the configured device and start the event loop.
    ///
    /// Opening a host device may block; no client lock is held meanwhile, so
    /// `is_running`, `info` and `stop` stay callable. A concurrent `start`
    /// fails with [`BridgeError::AlreadyStarted`].
    pub fn start(&self) -> Result<()> {
        if self.inner.starting.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }
        let result = self.open_and_listen();
        self.inner.starting.store(false, Ordering::SeqCst);
        result
    }

    fn open_and_listen(&self) -> Result<()> {
        if self.is_running() {
            return Err(BridgeError::AlreadyStarted);
        }

        let mut reader = MidiDeviceReader::new(self.inner.driver.clone());
        if let Err(e) = reader.connect(self.inner.device_index) {
            warn!(
                client = %self.inner.id,
                "Failed to connect to device {}: {}", self.inner.device_index, e
            );
            return Err(e);
        }
        let events = reader.take_events().ok_or(BridgeError::NotStarted)?;

        let (trigger, signal) = shutdown_channel();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(listen(weak, events, signal));

        *self.inner.trigger.lock() = Some(trigger);
        *self.inner.reader.lock() = Some(reader);
        info!(client = %self.inner.id, "Started on device {}", self.inner.device_index);
        Ok(())
    }

    fn handle_event(&self, event: MidiEvent) {
        if !self.inner.cache.lock().observe(&event) {
            self.inner.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let message = event.decode();
        debug!(client = %self.inner.id, "{}", message);
        self.inner.delivered.fetch_add(1, Ordering::SeqCst);

        let callback = self.inner.callback.read().clone();
        if let Some(callback) = callback {
            invoke_guarded(&self.inner.id, || callback(self, &event, &message));
        }
    }

    /// Stop the loop, release the device and forget cached values. Idempotent.
    pub fn stop(&self) {
        let trigger = self.inner.trigger.lock().take();
        let reader = self.inner.reader.lock().take();

        if let Some(trigger) = trigger {
            trigger.trigger();
        }
        if let Some(mut reader) = reader {
            reader.disconnect();
        }
        self.inner.cache.lock().clear();
        info!(client = %self.inner.id, "Stopped.");
    }

    pub fn info(&self) -> MidiClientInfo {
        MidiClientInfo {
            id: self.inner.id.clone(),
            device_index: self.inner.device_index,
            device_name: self.device().map(|d| d.name),
            running: self.is_running(),
        }
    }
}

/// Drain events in arrival order until shutdown or the device goes away
async fn listen(
    client: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<MidiEvent>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = client.upgrade() else { break };
                MidiClient { inner }.handle_event(event);
            }
        }
    }
    debug!("MIDI listen loop exited");
}

/// Listing entry for a MIDI client
#[derive(Debug, Clone, Serialize)]
pub struct MidiClientInfo {
    pub id: String,
    pub device_index: usize,
    pub device_name: Option<String>,
    pub running: bool,
}

/// Named registry of MIDI clients sharing one driver
pub struct MidiClientManager {
    clients: Registry<MidiClient>,
    driver: Arc<dyn MidiDriver>,
}

impl MidiClientManager {
    pub fn new(driver: Arc<dyn MidiDriver>) -> Self {
        Self {
            clients: Registry::new(),
            driver,
        }
    }

    pub fn driver(&self) -> Arc<dyn MidiDriver> {
        self.driver.clone()
    }

    pub fn list_devices(&self) -> Result<Vec<MidiDevice>> {
        self.driver.list_devices()
    }

    /// Pick a device index: the only device if there is exactly one,
    /// otherwise index 0 with a warning
    pub fn auto_select_device(&self) -> Result<usize> {
        let devices = self.driver.list_devices()?;
        match devices.as_slice() {
            [] => Err(BridgeError::NoDevices),
            [only] => {
                info!("Auto-selecting MIDI device {}: {}", only.index, only.name);
                Ok(only.index)
            }
            [first, ..] => {
                warn!(
                    "{} MIDI devices found, using {}: {}",
                    devices.len(),
                    first.index,
                    first.name
                );
                Ok(first.index)
            }
        }
    }

    /// Register and start a client. A client whose device cannot be opened
    /// is not kept.
    pub fn add(&self, id: &str, device_index: usize, callback: Option<MidiCallback>) -> Result<()> {
        let driver = self.driver.clone();
        let client = self
            .clients
            .insert_with(id, || MidiClient::new(id, device_index, driver, callback))
            .map_err(|e| {
                warn!("MIDI client '{}' already exists!", id);
                BridgeError::from(e)
            })?;

        if let Err(e) = client.start() {
            let _ = self.clients.remove(id);
            return Err(e);
        }

        info!("Added MIDI client '{}' on device {}", id, device_index);
        Ok(())
    }

    pub fn set_callback(&self, id: &str, callback: Option<MidiCallback>) -> Result<()> {
        Ok(self
            .clients
            .with_client(id, |client| client.set_callback(callback))?)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let client = self.clients.remove(id).map_err(|e| {
            warn!("MIDI client '{}' not found!", id);
            BridgeError::from(e)
        })?;
        client.stop();
        info!("Removed MIDI client '{}'", id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<MidiClient>> {
        Ok(self.clients.get(id)?)
    }

    pub fn list(&self) -> Vec<MidiClientInfo> {
        let infos: Vec<_> = self
            .clients
            .snapshot()
            .into_iter()
            .map(|(_, client)| client.info())
            .collect();

        if infos.is_empty() {
            info!("No MIDI clients connected");
        } else {
            info!("Connected MIDI clients:");
            for c in &infos {
                info!("  {}: device {}", c.id, c.device_index);
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
        info!("All MIDI clients stopped");
    }
}

#[cfg(feature = "midi")]
impl Default for MidiClientManager {
    fn default() -> Self {
        Self::new(Arc::new(super::driver::MidirDriver::default()))
    }
}
