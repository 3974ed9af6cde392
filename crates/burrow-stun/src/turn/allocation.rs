//! Relay allocation state.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use super::TransportProtocol;

/// Fraction of the granted lifetime after which a refresh is sent
pub const REFRESH_RATIO: f64 = 0.8;

/// A relay allocation granted by the TURN server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnAllocation {
    /// Relayed transport address peers send to
    pub relayed_address: SocketAddr,
    /// Our server reflexive address as seen by the TURN server
    pub mapped_address: Option<SocketAddr>,
    /// Granted lifetime
    pub lifetime: Duration,
    /// Transport used to reach the server
    pub protocol: TransportProtocol,
    /// Whether the server connection is TLS
    pub secure: bool,
    /// When the server last confirmed the allocation
    pub last_verified: Instant,
}

impl TurnAllocation {
    /// Delay after `last_verified` at which the allocation should be refreshed
    #[must_use]
    pub fn refresh_delay(&self) -> Duration {
        self.lifetime.mul_f64(REFRESH_RATIO)
    }

    /// Time left before the server drops the allocation
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        (self.last_verified + self.lifetime).saturating_duration_since(now)
    }

    /// Whether the allocation has expired at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }
}
