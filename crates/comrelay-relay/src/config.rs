//! Relay configuration
//!
//! Loaded from TOML. Every field has a default, and an empty file yields the
//! demo topology: one stream target, one datagram relay, one OSC listener and
//! one auto-selected MIDI controller.

use comrelay_transport::{Endpoint, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Timing shared by every stream client
    pub stream: StreamSettings,
    /// Stream targets commands are broadcast to
    pub streams: Vec<StreamEntry>,
    pub datagram: Vec<DatagramEntry>,
    pub osc: Vec<OscEntry>,
    pub midi: Vec<MidiEntry>,
    /// Stream client that datagram payloads are forwarded to
    pub datagram_target: String,
    /// How long to wait for the target's reply before giving up
    pub reply_timeout_ms: u64,
    pub osc_routes: OscRoutes,
    pub faders: Vec<FaderEntry>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            streams: vec![StreamEntry {
                id: "Filemona".to_string(),
                host: "127.0.0.1".to_string(),
                port: 1025,
            }],
            datagram: vec![DatagramEntry {
                id: "RelayUDP".to_string(),
                host: "127.0.0.1".to_string(),
                port: 9000,
                listen_port: 9001,
            }],
            osc: vec![OscEntry {
                id: "OSC_GH".to_string(),
                host: "127.0.0.1".to_string(),
                port: 8000,
                listen_port: Some(8001),
            }],
            midi: vec![MidiEntry {
                id: "RelayMIDI".to_string(),
                device: None,
            }],
            datagram_target: "RelayTCP".to_string(),
            reply_timeout_ms: 500,
            osc_routes: OscRoutes::default(),
            faders: FaderEntry::defaults(),
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RelayError::Config(e.to_string()))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub reconnect_interval_ms: u64,
    pub startup_grace_ms: u64,
    /// `{id}` expands to the client id; empty disables the greeting
    pub greeting: String,
    /// 0 disables TCP keepalive
    pub keepalive_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        let defaults = StreamConfig::default();
        Self {
            reconnect_interval_ms: defaults.reconnect_interval.as_millis() as u64,
            startup_grace_ms: defaults.startup_grace.as_millis() as u64,
            greeting: defaults.greeting.unwrap_or_default(),
            keepalive_secs: defaults.keepalive_secs,
        }
    }
}

impl StreamSettings {
    pub fn to_stream_config(&self) -> StreamConfig {
        StreamConfig {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            greeting: Some(self.greeting.clone()).filter(|g| !g.is_empty()),
            keepalive_secs: self.keepalive_secs,
            ..StreamConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl StreamEntry {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatagramEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// 0 = OS-assigned
    #[serde(default)]
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OscEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Omit for a send-only client
    #[serde(default)]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiEntry {
    pub id: String,
    /// Device index; omit to auto-select
    #[serde(default)]
    pub device: Option<usize>,
}

/// OSC addresses the relay recognizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscRoutes {
    pub pose: String,
    pub joints: String,
    pub home: String,
    pub draw_circle: String,
    pub named_position: String,
}

impl Default for OscRoutes {
    fn default() -> Self {
        Self {
            pose: "/pose".to_string(),
            joints: "/joints".to_string(),
            home: "/home".to_string(),
            draw_circle: "/PosA".to_string(),
            named_position: "/filemona/rot".to_string(),
        }
    }
}

/// A MIDI controller number and the command name it drives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaderEntry {
    pub controller: u8,
    pub command: String,
}

impl FaderEntry {
    pub fn defaults() -> Vec<Self> {
        ["slider1", "slider2", "slider3"]
            .iter()
            .enumerate()
            .map(|(controller, command)| FaderEntry {
                controller: controller as u8,
                command: command.to_string(),
            })
            .collect()
    }
}
