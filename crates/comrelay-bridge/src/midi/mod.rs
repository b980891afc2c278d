//! MIDI input: event decoding, device readers and deduplicating clients
//!
//! Events travel as a packed word, `status | data1 << 8 | data2 << 16`, with
//! the arrival timestamp alongside. Everything else (channel, controller,
//! classification, display text) is a pure function of that word.

pub mod client;
pub mod driver;
pub mod reader;
pub mod scripted;

use std::fmt;

pub use client::{LastValueCache, MidiCallback, MidiClient, MidiClientInfo, MidiClientManager};
pub use driver::{MidiDevice, MidiDriver, MidiInputHandle, MidiSink};
#[cfg(feature = "midi")]
pub use driver::MidirDriver;
pub use reader::MidiDeviceReader;
pub use scripted::ScriptedMidiDriver;

/// Build a packed event word from its three bytes
pub fn pack(status: u8, data1: u8, data2: u8) -> u32 {
    status as u32 | (data1 as u32) << 8 | (data2 as u32) << 16
}

/// One raw input event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub packed: u32,
    /// Microseconds, as reported by the driver
    pub timestamp_us: u64,
}

impl MidiEvent {
    pub fn new(packed: u32, timestamp_us: u64) -> Self {
        Self {
            packed,
            timestamp_us,
        }
    }

    /// Pack a driver byte slice. Missing data bytes read as zero; an empty
    /// slice is not an event.
    pub fn from_bytes(bytes: &[u8], timestamp_us: u64) -> Option<Self> {
        let status = *bytes.first()?;
        let data1 = bytes.get(1).copied().unwrap_or(0);
        let data2 = bytes.get(2).copied().unwrap_or(0);
        Some(Self::new(pack(status, data1, data2), timestamp_us))
    }

    pub fn status(&self) -> u8 {
        (self.packed & 0xFF) as u8
    }

    pub fn data1(&self) -> u8 {
        ((self.packed >> 8) & 0xFF) as u8
    }

    pub fn data2(&self) -> u8 {
        ((self.packed >> 16) & 0xFF) as u8
    }

    /// Channel 1-16
    pub fn channel(&self) -> u8 {
        (self.status() & 0x0F) + 1
    }

    pub fn decode(&self) -> MidiMessage {
        let (status, data1, data2) = (self.status(), self.data1(), self.data2());
        let channel = self.channel();

        match status & 0xF0 {
            0x90 if data2 > 0 => MidiMessage::NoteOn {
                channel,
                note: data1,
                velocity: data2,
            },
            0x90 | 0x80 => MidiMessage::NoteOff {
                channel,
                note: data1,
                velocity: data2,
            },
            0xB0 => MidiMessage::ControlChange {
                channel,
                controller: data1,
                value: data2,
            },
            0xC0 => MidiMessage::ProgramChange {
                channel,
                program: data1,
            },
            0xE0 => MidiMessage::PitchBend {
                channel,
                value: (data2 as u16) << 7 | data1 as u16,
            },
            _ => MidiMessage::Other {
                status,
                data1,
                data2,
            },
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.decode().fmt(f)
    }
}

/// Decoded form of a [`MidiEvent`]. Channels are 1-16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8, velocity: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    PitchBend { channel: u8, value: u16 },
    Other { status: u8, data1: u8, data2: u8 },
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => write!(
                f,
                "Note ON  - Ch:{:2} Note:{:3}({:>3}) Vel:{:3}",
                channel,
                note,
                note_name(note),
                velocity
            ),
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => write!(
                f,
                "Note OFF - Ch:{:2} Note:{:3}({:>3}) Vel:{:3}",
                channel,
                note,
                note_name(note),
                velocity
            ),
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => write!(f, "CC       - Ch:{:2} Ctrl:{:3} Val:{:3}", channel, controller, value),
            MidiMessage::ProgramChange { channel, program } => {
                write!(f, "Program  - Ch:{:2} Prog:{:3}", channel, program)
            }
            MidiMessage::PitchBend { channel, value } => {
                write!(f, "PitchBnd - Ch:{:2} Val:{:5}", channel, value)
            }
            MidiMessage::Other {
                status,
                data1,
                data2,
            } => write!(
                f,
                "Other    - Status:{:02X} Data1:{:02X} Data2:{:02X}",
                status, data1, data2
            ),
        }
    }
}

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Note name with octave, middle C (60) being `C4`
pub fn note_name(note: u8) -> String {
    if note > 127 {
        return "???".to_string();
    }
    let octave = (note / 12) as i8 - 1;
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], octave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let event = MidiEvent::new(pack(0xB0, 7, 100), 0);
        assert_eq!(event.packed, 0x0064_07B0);
        assert_eq!(event.status(), 0xB0);
        assert_eq!(event.data1(), 7);
        assert_eq!(event.data2(), 100);
        assert_eq!(event.channel(), 1);
    }

    #[test]
    fn test_channel_is_one_based() {
        let event = MidiEvent::new(pack(0x9F, 60, 1), 0);
        assert_eq!(event.channel(), 16);
    }

    #[test]
    fn test_decode_kinds() {
        let decode = |s, d1, d2| MidiEvent::new(pack(s, d1, d2), 0).decode();

        assert_eq!(
            decode(0x90, 60, 100),
            MidiMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100
            }
        );
        assert_eq!(
            decode(0x90, 60, 0),
            MidiMessage::NoteOff {
                channel: 1,
                note: 60,
                velocity: 0
            }
        );
        assert_eq!(
            decode(0x81, 60, 64),
            MidiMessage::NoteOff {
                channel: 2,
                note: 60,
                velocity: 64
            }
        );
        assert_eq!(
            decode(0xB2, 1, 64),
            MidiMessage::ControlChange {
                channel: 3,
                controller: 1,
                value: 64
            }
        );
        assert_eq!(
            decode(0xC0, 5, 0),
            MidiMessage::ProgramChange {
                channel: 1,
                program: 5
            }
        );
        assert_eq!(
            decode(0xE0, 0x00, 0x40),
            MidiMessage::PitchBend {
                channel: 1,
                value: 8192
            }
        );
        assert!(matches!(decode(0xF8, 0, 0), MidiMessage::Other { status: 0xF8, .. }));
    }

    #[test]
    fn test_display_format() {
        let cc = MidiEvent::new(pack(0xB0, 0, 64), 0);
        assert_eq!(cc.to_string(), "CC       - Ch: 1 Ctrl:  0 Val: 64");

        let note = MidiEvent::new(pack(0x90, 60, 100), 0);
        assert_eq!(note.to_string(), "Note ON  - Ch: 1 Note: 60( C4) Vel:100");

        let other = MidiEvent::new(pack(0xF8, 0, 0), 0);
        assert_eq!(other.to_string(), "Other    - Status:F8 Data1:00 Data2:00");
    }

    #[test]
    fn test_note_name() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(0), "C-1");
        assert_eq!(note_name(69), "A4");
        assert_eq!(note_name(127), "G9");
        assert_eq!(note_name(128), "???");
    }

    #[test]
    fn test_from_bytes() {
        assert!(MidiEvent::from_bytes(&[], 0).is_none());
        let event = MidiEvent::from_bytes(&[0xC0, 3], 42).unwrap();
        assert_eq!(event.data1(), 3);
        assert_eq!(event.data2(), 0);
        assert_eq!(event.timestamp_us, 42);
    }
}
