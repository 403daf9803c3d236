//! Transport errors.

use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// The listener is not listening
    #[error("Listener is not listening")]
    NotListening,

    /// The listener is already listening
    #[error("Listener is already listening on {0}")]
    AlreadyListening(std::net::SocketAddr),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Errors from the core types
    #[error(transparent)]
    Core(#[from] relaymesh_core::Error),

    /// Address discovery failed
    #[error(transparent)]
    Discovery(#[from] relaymesh_discovery::DiscoveryError),

    /// Relay failure
    #[error(transparent)]
    Relay(#[from] relaymesh_relay::RelayError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
