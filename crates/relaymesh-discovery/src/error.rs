//! Discovery errors.

use crate::nat::stun::StunError;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Interface options are contradictory
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Requested interface does not exist or has no usable address
    #[error("Interface error: {0}")]
    Interface(String),

    /// Not enough STUN servers to determine the public address
    #[error("Not enough STUN servers given to determine own public address")]
    NotEnoughStunServers,

    /// STUN exchange failed
    #[error("STUN failed: {0}")]
    Stun(#[from] StunError),

    /// Errors from the collaborator stack
    #[error(transparent)]
    Core(#[from] relaymesh_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
