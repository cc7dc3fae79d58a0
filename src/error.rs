use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

/// Failures surfaced synchronously by the connection layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Could not start: {0}")]
    CouldNotStart(String),

    #[error("Cannot connect to self: {0}")]
    CannotConnectToSelf(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Closed while connecting: {0}")]
    ClosedWhileConnecting(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown RPC method: {0}")]
    UnknownMethod(String),

    #[error("RPC server error: {0}")]
    Server(String),

    #[error("RPC client error: {0}")]
    Client(String),
}

impl From<ConnectionError> for RpcError {
    fn from(e: ConnectionError) -> Self {
        RpcError::Client(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Serialized message is empty")]
    Empty,
}
