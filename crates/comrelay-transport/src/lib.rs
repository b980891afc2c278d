//! Comrelay Transport Layer
//!
//! Client building blocks for the relay:
//! - TCP stream clients with a fixed-interval reconnect supervisor
//! - UDP datagram clients with a callback receive loop
//! - A named registry shared by every protocol manager

pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod stream;
pub mod task;
pub mod udp;

pub use datagram::{
    DatagramCallback, DatagramClient, DatagramClientInfo, DatagramClientManager, DatagramConfig,
};
pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use registry::{BroadcastReport, Registry};
pub use stream::{
    ConnectionState, StreamClient, StreamClientInfo, StreamClientManager, StreamConfig,
};
pub use task::{invoke_guarded, shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use udp::{UdpEndpoint, MAX_UDP_PAYLOAD};
