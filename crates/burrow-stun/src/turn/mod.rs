//! TURN client (RFC 5766).
//!
//! A [`TurnClient`] owns one allocation on one TURN server. It keeps the
//! allocation alive with Refresh requests at 80% of the granted lifetime,
//! installs and sweeps permissions, binds channels and relays application
//! data. Lifecycle and data events are delivered on a bounded queue obtained
//! with [`TurnClient::take_events`].

mod allocation;
mod channel;
mod client;
mod error;
mod permission;
pub mod transport;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use allocation::{REFRESH_RATIO, TurnAllocation};
pub use channel::ChannelTable;
pub use client::TurnClient;
pub use error::TurnError;
pub use permission::{PermissionTable, TurnPermission};
pub use transport::TurnTransport;

/// Default requested allocation lifetime
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

/// Shortest lifetime the client requests
pub const MIN_LIFETIME: Duration = Duration::from_secs(300);

/// Longest lifetime the client requests
pub const MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Default permission lifetime (RFC 5766 Section 8)
pub const DEFAULT_PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// Default bound on a CreatePermission exchange
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Shortest interval between permission sweeps
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Transport between client and TURN server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// UDP
    #[default]
    Udp,
    /// TCP (TLS when the server is marked secure)
    Tcp,
}

impl TransportProtocol {
    /// IANA protocol number for REQUESTED-TRANSPORT
    #[must_use]
    pub const fn protocol_number(self) -> u8 {
        match self {
            Self::Udp => 17,
            Self::Tcp => 6,
        }
    }
}

/// TURN server and the credentials used against it
#[derive(Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// Host name or IP address
    pub host: String,
    /// Port (3478 for plain, 5349 for TLS)
    #[serde(default = "default_turn_port")]
    pub port: u16,
    /// Long-term credential username
    pub username: String,
    /// Long-term credential password
    pub password: String,
    /// Realm, if known before the first challenge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    /// Use TLS on top of TCP
    #[serde(default)]
    pub secure: bool,
    /// Transport to reach the server
    #[serde(default)]
    pub transport: TransportProtocol,
}

fn default_turn_port() -> u16 {
    3478
}

impl TurnServer {
    /// Plain UDP server on the default port
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_turn_port(),
            username: username.into(),
            password: password.into(),
            realm: None,
            secure: false,
            transport: TransportProtocol::Udp,
        }
    }

    /// Set the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use TCP, optionally wrapped in TLS
    #[must_use]
    pub fn over_tcp(mut self, secure: bool) -> Self {
        self.transport = TransportProtocol::Tcp;
        self.secure = secure;
        self
    }
}

impl std::fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnServer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .field("secure", &self.secure)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct TurnOptions {
    /// Requested allocation lifetime, clamped to 300-3600 seconds
    pub lifetime: Duration,
    /// Lifetime assumed for installed permissions
    pub permission_lifetime: Duration,
    /// Bound on a CreatePermission exchange
    pub permission_timeout: Duration,
    /// Bound on any other request/response exchange
    pub request_timeout: Duration,
    /// Interval between permission sweeps (at least 60 seconds)
    pub sweep_interval: Duration,
    /// Append FINGERPRINT to outgoing messages
    pub fingerprint: bool,
    /// SOFTWARE attribute value
    pub software: Option<String>,
    /// Capacity of the event queue
    pub event_capacity: usize,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_LIFETIME,
            permission_lifetime: DEFAULT_PERMISSION_LIFETIME,
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            request_timeout: Duration::from_secs(5),
            sweep_interval: MIN_SWEEP_INTERVAL,
            fingerprint: true,
            software: Some(concat!("burrow/", env!("CARGO_PKG_VERSION")).to_string()),
            event_capacity: 256,
        }
    }
}

impl TurnOptions {
    /// Lifetime actually requested from the server
    #[must_use]
    pub fn requested_lifetime(&self) -> Duration {
        self.lifetime.clamp(MIN_LIFETIME, MAX_LIFETIME)
    }

    /// Sweep interval with the 60 second floor applied
    #[must_use]
    pub fn effective_sweep_interval(&self) -> Duration {
        self.sweep_interval.max(MIN_SWEEP_INTERVAL)
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    /// Created, nothing sent yet
    New,
    /// Opening the transport to the server
    Connecting,
    /// Allocate request in flight
    Allocating,
    /// Allocation active
    Ready,
    /// Allocation failed or lapsed
    Failed,
    /// Closed by the owner
    Closed,
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// State transition
    StateChanged(TurnState),
    /// Allocation refreshed with the granted lifetime
    AllocationRefreshed {
        /// Lifetime granted by the server
        lifetime: Duration,
    },
    /// A scheduled refresh failed
    RefreshFailed {
        /// Failure description
        reason: String,
    },
    /// A permission lapsed and was removed
    PermissionExpired {
        /// Peer IP the permission covered
        peer: IpAddr,
    },
    /// Application data relayed from a permitted peer
    Data {
        /// Sending peer
        peer: SocketAddr,
        /// Payload
        payload: Vec<u8>,
    },
}
