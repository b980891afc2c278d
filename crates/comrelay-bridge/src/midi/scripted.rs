//! In-memory MIDI driver
//!
//! Exposes a fixed device list and lets the caller inject events into any
//! open device. Used by tests and for running the relay without hardware.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::driver::{MidiDevice, MidiDriver, MidiInputHandle, MidiSink};
use super::{pack, MidiEvent};
use crate::{BridgeError, Result};

#[derive(Default)]
struct State {
    devices: Vec<String>,
    open: HashMap<usize, MidiSink>,
    opened: u32,
}

#[derive(Clone, Default)]
pub struct ScriptedMidiDriver {
    state: Arc<Mutex<State>>,
}

impl ScriptedMidiDriver {
    pub fn with_devices(names: &[&str]) -> Self {
        let driver = Self::default();
        driver.state.lock().devices = names.iter().map(|n| n.to_string()).collect();
        driver
    }

    /// Deliver `event` to device `index`. Returns `false` if it is not open.
    pub fn inject(&self, index: usize, event: MidiEvent) -> bool {
        match self.state.lock().open.get(&index) {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a control change; `channel` is 1-16
    pub fn inject_cc(&self, index: usize, channel: u8, controller: u8, value: u8) -> bool {
        let status = 0xB0 | (channel.saturating_sub(1) & 0x0F);
        self.inject(index, MidiEvent::new(pack(status, controller, value), 0))
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.state.lock().open.contains_key(&index)
    }

    /// Total successful opens so far
    pub fn open_count(&self) -> u32 {
        self.state.lock().opened
    }
}

impl MidiDriver for ScriptedMidiDriver {
    fn list_devices(&self) -> Result<Vec<MidiDevice>> {
        Ok(self
            .state
            .lock()
            .devices
            .iter()
            .enumerate()
            .map(|(index, name)| MidiDevice {
                index,
                name: name.clone(),
            })
            .collect())
    }

    fn open(&self, index: usize, sink: MidiSink) -> Result<Box<dyn MidiInputHandle>> {
        let mut state = self.state.lock();
        let available = state.devices.len();
        if index >= available {
            return Err(BridgeError::DeviceIndexOutOfRange { index, available });
        }
        if state.open.contains_key(&index) {
            return Err(BridgeError::ConnectionFailed(format!(
                "device {} already open",
                index
            )));
        }
        state.open.insert(index, sink);
        state.opened += 1;

        Ok(Box::new(ScriptedHandle {
            state: self.state.clone(),
            index,
        }))
    }
}

struct ScriptedHandle {
    state: Arc<Mutex<State>>,
    index: usize,
}

impl MidiInputHandle for ScriptedHandle {
    fn close(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.state.lock().open.remove(&self.index);
    }
}
