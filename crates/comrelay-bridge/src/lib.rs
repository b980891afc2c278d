//! Comrelay Protocol Bridges
//!
//! Input clients for the protocols the relay listens to:
//! - OSC (send and receive over UDP, via rosc)
//! - MIDI (device input via midir, or an in-memory driver)

pub mod error;
pub mod midi;

#[cfg(feature = "osc")]
pub mod osc;

pub use error::{BridgeError, Result};
pub use midi::{
    LastValueCache, MidiCallback, MidiClient, MidiClientInfo, MidiClientManager, MidiDevice,
    MidiDeviceReader, MidiDriver, MidiEvent, MidiMessage, ScriptedMidiDriver,
};

#[cfg(feature = "midi")]
pub use midi::MidirDriver;

#[cfg(feature = "osc")]
pub use osc::{OscCallback, OscClient, OscClientInfo, OscClientManager, OscConfig};
