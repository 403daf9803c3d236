//! Error types shared by all relaymesh crates.

use crate::peer::PeerId;
use std::borrow::Cow;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Bytes do not encode a valid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(Cow<'static, str>),

    /// Both ends of a pair are the same peer
    #[error("loopbacks are not allowed: {0}")]
    Loopback(PeerId),

    /// Address string could not be parsed
    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress {
        /// Offending input
        addr: String,
        /// What is wrong with it
        reason: Cow<'static, str>,
    },

    /// Unknown protocol identifier
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The stream has ended or its counterpart is gone
    #[error("stream closed")]
    StreamClosed,

    /// Frame exceeds the framing limit
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Dialing failed
    #[error("dial failed: {0}")]
    Dial(Cow<'static, str>),

    /// Connection upgrade failed
    #[error("upgrade failed: {0}")]
    Upgrade(Cow<'static, str>),

    /// Operation timed out
    #[error("operation timed out")]
    Timeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an [`Error::Dial`] with a formatted reason
    pub fn dial(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Dial(reason.into())
    }

    /// Shorthand for an [`Error::Upgrade`] with a formatted reason
    pub fn upgrade(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Upgrade(reason.into())
    }

    /// Returns true if retrying the operation later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Dial(_) | Self::Timeout | Self::StreamClosed | Self::Io(_)
        )
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
