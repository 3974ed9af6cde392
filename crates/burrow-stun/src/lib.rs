//! # Burrow STUN
//!
//! STUN/TURN client protocol engine for the Burrow NAT traversal stack.
//!
//! This crate provides:
//! - RFC 5389 message codec with a closed attribute type
//! - MESSAGE-INTEGRITY (long-term and short-term credentials) and FINGERPRINT
//! - TURN ChannelData framing
//! - A Binding client for server reflexive address discovery
//! - A TURN session client driving allocation, refresh, permissions and
//!   channel bindings
//!
//! ## Example
//!
//! ```rust
//! use burrow_stun::{Method, StunAttribute, StunMessage};
//!
//! let mut request = StunMessage::request(Method::Allocate);
//! request.add_attribute(StunAttribute::Lifetime(600));
//!
//! let bytes = request.encode();
//! let decoded = StunMessage::decode(&bytes).unwrap();
//! assert_eq!(decoded.lifetime(), Some(600));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod auth;
pub mod channel_data;
pub mod client;
pub mod error;
pub mod message;
pub mod turn;

pub use attribute::{ErrorCode, StunAttribute};
pub use auth::StunAuthentication;
pub use channel_data::ChannelData;
pub use client::{StunClient, query_mapped_address};
pub use error::StunError;
pub use message::{
    HEADER_SIZE, MAGIC_COOKIE, MessageClass, MessageType, Method, Padding, StunMessage,
    TransactionId,
};
