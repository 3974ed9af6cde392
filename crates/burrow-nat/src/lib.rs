//! # Burrow NAT
//!
//! NAT traversal for Burrow peers.
//!
//! This crate provides:
//! - A NAT Traversal Orchestrator that tries connection methods in priority
//!   order under per-method and overall deadlines
//! - A Connection Method Registry remembering what last worked per peer,
//!   with a configurable staleness policy
//! - Method adapters: direct TCP/UDP/IPv6, UPnP and NAT-PMP/PCP port
//!   mapping, STUN-assisted UDP, UDP and TCP hole punching, TCP simultaneous
//!   open, ICE-style connectivity checks and TURN relaying
//! - The signaling contract used to exchange candidates between peers
//! - TOML configuration
//!
//! ## Method order
//!
//! Unless a request says otherwise, methods are tried cheapest first:
//! direct IPv6, direct TCP, direct UDP, UPnP, NAT-PMP, STUN-assisted, UDP hole
//! punch, TCP hole punch, TCP simultaneous open, ICE and finally TURN. A
//! method recorded in the registry for the peer is moved to the front.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use burrow_nat::{ConnectionRequest, MemoryRegistry, Orchestrator};
//! use burrow_nat::adapters::DirectAdapter;
//!
//! # async fn example() -> Result<(), burrow_nat::TraversalError> {
//! let orchestrator = Orchestrator::new(Arc::new(MemoryRegistry::new()))
//!     .with_adapter(Arc::new(DirectAdapter::tcp()));
//!
//! let request = ConnectionRequest::new("peer-1")
//!     .with_target("192.0.2.10:7000".parse::<std::net::SocketAddr>().unwrap())
//!     .with_methods([burrow_nat::ConnectionMethod::DirectTcp]);
//!
//! let connection = orchestrator.connect(&request).await?;
//! println!("connected via {}", connection.method);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod method;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod signaling;
pub mod sockets;

pub use adapters::{AdapterError, MethodAdapter};
pub use config::{TraversalConfig, init_logging};
pub use connection::{Connection, ConnectionDetails, ConnectionResult, TransportHandle};
pub use error::{MethodFailure, TraversalError};
pub use gateway::{GatewayClient, GatewayError, MappingProtocol, PortMapping};
pub use method::ConnectionMethod;
pub use orchestrator::{AttemptPlan, Orchestrator};
pub use registry::{
    JsonFileRegistry, MemoryRegistry, MethodRegistry, RegistryEntry, RegistryError,
    RegistryPolicy,
};
pub use request::{ConnectionRequest, PeerAddress, TransportPreference};
pub use signaling::{
    MemorySignaling, SignalMessage, SignalPayload, Signaling, SignalingChannel, SignalingError,
};
