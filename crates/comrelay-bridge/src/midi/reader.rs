//! Low-level connection to one MIDI input device

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::driver::{MidiDevice, MidiDriver, MidiInputHandle};
use super::MidiEvent;
use crate::{BridgeError, Result};

/// Opens one device through a [`MidiDriver`] and queues its events
pub struct MidiDeviceReader {
    driver: Arc<dyn MidiDriver>,
    handle: Option<Box<dyn MidiInputHandle>>,
    events: Option<mpsc::UnboundedReceiver<MidiEvent>>,
    device: Option<MidiDevice>,
}

impl MidiDeviceReader {
    pub fn new(driver: Arc<dyn MidiDriver>) -> Self {
        Self {
            driver,
            handle: None,
            events: None,
            device: None,
        }
    }

    pub fn list_devices(&self) -> Result<Vec<MidiDevice>> {
        self.driver.list_devices()
    }

    /// Open device `index`. Fails when no devices exist or the index is out
    /// of range.
    pub fn connect(&mut self, index: usize) -> Result<MidiDevice> {
        if self.handle.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }

        let devices = self.driver.list_devices()?;
        if devices.is_empty() {
            warn!("No MIDI input devices found!");
            return Err(BridgeError::NoDevices);
        }
        let available = devices.len();
        let Some(device) = devices.into_iter().find(|d| d.index == index) else {
            warn!(
                "Invalid device index {}. Available devices: 0-{}",
                index,
                available.saturating_sub(1)
            );
            return Err(BridgeError::DeviceIndexOutOfRange { index, available });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.driver.open(index, tx)?;

        info!("Connected to: {}", device.name);
        self.handle = Some(handle);
        self.events = Some(rx);
        self.device = Some(device.clone());
        Ok(device)
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    pub fn device(&self) -> Option<&MidiDevice> {
        self.device.as_ref()
    }

    /// Hand the event queue to a consumer. Available once per connection.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MidiEvent>> {
        self.events.take()
    }

    /// Drain whatever is queued without waiting
    pub fn drain(&mut self) -> Vec<MidiEvent> {
        let mut drained = Vec::new();
        if let Some(events) = self.events.as_mut() {
            while let Ok(event) = events.try_recv() {
                drained.push(event);
            }
        }
        drained
    }

    /// Stop delivery and release the device. Safe when not connected.
    pub fn disconnect(&mut self) {
        self.events = None;
        if let Some(handle) = self.handle.take() {
            handle.close();
            info!("Disconnected from MIDI device.");
        }
        self.device = None;
    }
}

impl Drop for MidiDeviceReader {
    fn drop(&mut self) {
        self.disconnect();
    }
}
