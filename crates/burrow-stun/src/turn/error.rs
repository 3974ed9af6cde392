//! TURN session errors.

use thiserror::Error;

use super::TurnState;
use crate::error::StunError;

/// Errors returned by [`super::TurnClient`]
#[derive(Debug, Error)]
pub enum TurnError {
    /// I/O error on the server transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected STUN traffic
    #[error("STUN protocol error: {0}")]
    Protocol(#[from] StunError),

    /// Server answered with an error response
    #[error("TURN server returned error {code}: {reason}")]
    ErrorResponse {
        /// ERROR-CODE value
        code: u16,
        /// Reason phrase
        reason: String,
    },

    /// Server kept rejecting the nonce after one retry
    #[error("TURN credentials remained stale after retry")]
    StaleCredential,

    /// No response within the configured timeout
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Operation requires a different session state
    #[error("operation not valid in state {0:?}")]
    InvalidState(TurnState),

    /// Every channel number is in use
    #[error("no free channel numbers")]
    ChannelsExhausted,

    /// Payload cannot be framed for the relay
    #[error("payload of {len} bytes exceeds the {max}-byte relay limit")]
    PayloadTooLarge {
        /// Payload size
        len: usize,
        /// Largest payload the chosen framing carries
        max: usize,
    },

    /// Success response lacked a required attribute
    #[error("response missing {0}")]
    MissingAttribute(&'static str),

    /// Server host could not be resolved
    #[error("cannot resolve TURN server {0}")]
    Resolve(String),

    /// TLS setup failed
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// Session closed while the operation was in flight
    #[error("TURN session closed")]
    Closed,
}

impl TurnError {
    /// Whether a later attempt against the same server could succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout(_))
    }
}
