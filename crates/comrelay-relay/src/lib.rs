//! Comrelay Relay Core
//!
//! Connects the protocol managers to the TCP stream targets. OSC messages and
//! MIDI control changes are translated into text commands and broadcast to
//! every stream client; UDP payloads are forwarded verbatim to one stream
//! client and its reply is sent back to the UDP sender.
//!
//! # Example
//!
//! ```no_run
//! use comrelay_relay::{Relay, RelayConfig};
//!
//! # async fn run() -> comrelay_relay::Result<()> {
//! let relay = Relay::new(RelayConfig::default());
//! relay.start().await?;
//! // ...
//! relay.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod relay;
pub mod translate;

pub use config::{
    DatagramEntry, FaderEntry, MidiEntry, OscEntry, OscRoutes, RelayConfig, StreamEntry,
    StreamSettings,
};
pub use error::{RelayError, Result};
pub use relay::{Relay, RelayStats, RelayStatsSnapshot};
