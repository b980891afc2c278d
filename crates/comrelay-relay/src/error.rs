//! Relay error types

use comrelay_bridge::BridgeError;
use comrelay_transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
