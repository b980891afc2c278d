//! Bridge error types

use comrelay_transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("send error: {0}")]
    Send(String),

    #[error("receive error: {0}")]
    Receive(String),

    #[error("no MIDI input devices found")]
    NoDevices,

    #[error("invalid device index {index}, {available} device(s) available")]
    DeviceIndexOutOfRange { index: usize, available: usize },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("client not started")]
    NotStarted,

    #[error("client already started")]
    AlreadyStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge error: {0}")]
    Other(String),
}
