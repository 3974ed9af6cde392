//! Traversal error taxonomy.
//!
//! Errors are split by how the orchestrator reacts to them:
//!
//! - **Fatal**: input validation failures, the overall deadline and the
//!   terminal "all methods failed" result. These end a `connect` call.
//! - **Per-method**: a single adapter attempt failed, timed out, hit a
//!   protocol error or exhausted its credential retry. The orchestrator moves
//!   on to the next method unless fail-fast is set.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::method::ConnectionMethod;

/// One failed method attempt, kept for the terminal error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodFailure {
    /// Method that failed
    pub method: ConnectionMethod,
    /// Failure description
    pub reason: String,
}

impl fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.method, self.reason)
    }
}

/// Errors returned by traversal operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TraversalError {
    /// Request failed format validation; nothing was sent
    #[error("Invalid {field}: {reason}")]
    Validation {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// One adapter attempt did not succeed
    #[error("{method} failed: {reason}")]
    MethodFailed {
        /// Method that failed
        method: ConnectionMethod,
        /// Failure description
        reason: String,
    },

    /// A per-method or the overall deadline elapsed
    #[error("{} timed out after {after:?}", .method.map_or("connection attempt", ConnectionMethod::as_str))]
    Timeout {
        /// Method being attempted; `None` for the overall deadline
        method: Option<ConnectionMethod>,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Malformed or unexpected STUN/TURN traffic
    #[error("Protocol error during {method}: {reason}")]
    Protocol {
        /// Method that received the traffic
        method: ConnectionMethod,
        /// Decoder or state machine complaint
        reason: String,
    },

    /// TURN credentials were rejected again after a nonce refresh
    #[error("Stale credentials rejected during {method}")]
    StaleCredential {
        /// Method that used the credentials
        method: ConnectionMethod,
    },

    /// Every configured method was tried and none succeeded
    #[error("All connection methods failed{}", summarize(.failures))]
    AllMethodsFailed {
        /// Failures in attempt order
        failures: Vec<MethodFailure>,
    },
}

fn summarize(failures: &[MethodFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = failures.iter().map(ToString::to_string).collect();
    format!(" ({})", parts.join("; "))
}

impl TraversalError {
    /// Create a validation error
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Create a method failure
    pub fn method_failed(method: ConnectionMethod, reason: impl Into<String>) -> Self {
        Self::MethodFailed {
            method,
            reason: reason.into(),
        }
    }

    /// Method the error came from, if it came from a single method
    #[must_use]
    pub fn method(&self) -> Option<ConnectionMethod> {
        match self {
            Self::MethodFailed { method, .. }
            | Self::Protocol { method, .. }
            | Self::StaleCredential { method } => Some(*method),
            Self::Timeout { method, .. } => *method,
            Self::Validation { .. } | Self::AllMethodsFailed { .. } => None,
        }
    }

    /// Whether the error ends the whole `connect` call
    ///
    /// Per-method errors are not fatal: the orchestrator advances to the
    /// next method unless fail-fast is set.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Validation { .. } | Self::AllMethodsFailed { .. } => true,
            Self::Timeout { method, .. } => method.is_none(),
            Self::MethodFailed { .. } | Self::Protocol { .. } | Self::StaleCredential { .. } => {
                false
            }
        }
    }

    /// Collapse into a failure record for the terminal error
    #[must_use]
    pub fn to_failure(&self, method: ConnectionMethod) -> MethodFailure {
        let reason = match self {
            Self::MethodFailed { reason, .. } | Self::Protocol { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        MethodFailure { method, reason }
    }
}
