//! Relay errors and handshake status codes.

use std::fmt;
use thiserror::Error;

/// One-byte answer of the relay handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeStatus {
    /// Circuit established
    Ok = 0,
    /// Unspecified failure
    Fail = 1,
    /// Relay could not reach or convince the destination
    FailCouldNotReachCounterparty = 2,
    /// Initiator identity could not be determined
    FailCouldNotIdentifyPeer = 3,
    /// Destination key is empty or not a valid public key
    FailInvalidPublicKey = 4,
    /// Initiator and destination are the same node
    FailLoopbacksAreNotAllowed = 5,
    /// Relay already forwards its maximum number of circuits
    FailRelayFull = 6,
}

impl HandshakeStatus {
    /// Wire representation
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for HandshakeStatus {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::Fail,
            2 => Self::FailCouldNotReachCounterparty,
            3 => Self::FailCouldNotIdentifyPeer,
            4 => Self::FailInvalidPublicKey,
            5 => Self::FailLoopbacksAreNotAllowed,
            6 => Self::FailRelayFull,
            other => return Err(RelayError::InvalidStatus(other)),
        })
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
            Self::FailCouldNotReachCounterparty => "FAIL_COULD_NOT_REACH_COUNTERPARTY",
            Self::FailCouldNotIdentifyPeer => "FAIL_COULD_NOT_IDENTIFY_PEER",
            Self::FailInvalidPublicKey => "FAIL_INVALID_PUBLIC_KEY",
            Self::FailLoopbacksAreNotAllowed => "FAIL_LOOPBACKS_ARE_NOT_ALLOWED",
            Self::FailRelayFull => "FAIL_RELAY_FULL",
        };
        f.write_str(name)
    }
}

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// The handshake was answered with a failure code
    #[error("Handshake failed: {0}")]
    Handshake(HandshakeStatus),

    /// Unknown handshake status byte
    #[error("Invalid handshake status: {0}")]
    InvalidStatus(u8),

    /// The remote end closed the stream before answering
    #[error("No answer from remote end")]
    NoAnswer,

    /// The stream ended or its counterpart is gone
    #[error("Stream closed")]
    StreamClosed,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Malformed frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Signalling message could not be processed
    #[error("Signalling error: {0}")]
    Signalling(String),

    /// Signalling message is not valid JSON
    #[error("Signalling encoding error: {0}")]
    SignallingEncoding(#[from] serde_json::Error),

    /// Errors from the collaborator stack
    #[error(transparent)]
    Core(#[from] relaymesh_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Handshake status to report for this error, if it maps onto one
    #[must_use]
    pub fn status(&self) -> Option<HandshakeStatus> {
        match self {
            Self::Handshake(status) => Some(*status),
            _ => None,
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for byte in 0u8..=6 {
            let status = HandshakeStatus::try_from(byte).unwrap();
            assert_eq!(status.as_byte(), byte);
        }
        assert!(matches!(
            HandshakeStatus::try_from(7),
            Err(RelayError::InvalidStatus(7))
        ));
    }

    #[test]
    fn test_error_display() {
        let err = RelayError::Handshake(HandshakeStatus::FailRelayFull);
        assert_eq!(err.to_string(), "Handshake failed: FAIL_RELAY_FULL");
        assert_eq!(err.status(), Some(HandshakeStatus::FailRelayFull));
        assert_eq!(RelayError::Timeout.status(), None);
    }
}
