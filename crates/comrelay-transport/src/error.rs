//! Transport error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("outbound buffer full")]
    BufferFull,

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("timeout")]
    Timeout,

    #[error("client not started")]
    NotStarted,

    #[error("client already started")]
    AlreadyStarted,

    #[error("client stopped")]
    Stopped,

    #[error("client '{0}' already exists")]
    AlreadyRegistered(String),

    #[error("client '{0}' not found")]
    UnknownClient(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
