//! STUN codec and Binding client errors.

use thiserror::Error;

/// Errors produced while encoding, decoding or exchanging STUN messages
#[derive(Debug, Error)]
pub enum StunError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Query timeout
    #[error("STUN query timeout")]
    Timeout,

    /// Buffer shorter than the 20-byte header
    #[error("STUN message too short")]
    MessageTooShort,

    /// Buffer shorter than the length declared in the header
    #[error("STUN message truncated: declared {declared} bytes, {available} available")]
    Truncated {
        /// Attribute section length from the header
        declared: usize,
        /// Bytes available after the header
        available: usize,
    },

    /// Invalid magic cookie
    #[error("Invalid STUN magic cookie")]
    InvalidMagicCookie,

    /// Invalid or unsupported message type
    #[error("Invalid STUN message type")]
    InvalidMessageType,

    /// Invalid attribute
    #[error("Invalid STUN attribute")]
    InvalidAttribute,

    /// Transaction ID mismatch
    #[error("Transaction ID mismatch")]
    TransactionMismatch,

    /// Error response received
    #[error("STUN error response")]
    ErrorResponse,

    /// Missing required attribute
    #[error("Missing required STUN attribute")]
    MissingAttribute,

    /// MESSAGE-INTEGRITY verification failed
    #[error("MESSAGE-INTEGRITY authentication failed")]
    AuthenticationFailed,

    /// FINGERPRINT verification failed
    #[error("FINGERPRINT verification failed")]
    FingerprintMismatch,

    /// Malformed ChannelData frame
    #[error("Invalid ChannelData frame")]
    InvalidChannelData,

    /// A length does not fit the 16-bit length field
    #[error("{0} bytes exceed the 65535-byte length field")]
    TooLarge(usize),
}
