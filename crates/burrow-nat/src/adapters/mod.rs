//! Traversal method adapters.
//!
//! Every technique implements [`MethodAdapter`]. An attempt either returns an
//! open [`Connection`] or releases everything it opened (sockets, gateway
//! mappings, TURN allocations) before returning its error. Attempts are also
//! safe to drop mid-flight: sockets close on drop and mappings are deleted by
//! their guard.

pub mod direct;
pub mod hole_punch;
pub mod ice;
pub mod port_mapping;
pub mod probe;
pub mod simultaneous_open;
pub mod stun_assisted;
#[cfg(test)]
mod testing;
pub mod turn;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use burrow_stun::StunError;
use burrow_stun::turn::TurnError;
use thiserror::Error;
use tracing::debug;

use crate::connection::Connection;
use crate::error::TraversalError;
use crate::gateway::GatewayError;
use crate::method::ConnectionMethod;
use crate::request::{ConnectionRequest, PeerAddress};
use crate::signaling::{SignalCandidate, SignalPayload, Signaling, SignalingError};

pub use direct::DirectAdapter;
pub use hole_punch::{TcpHolePunchAdapter, UdpHolePunchAdapter};
pub use ice::IceAdapter;
pub use port_mapping::PortMappingAdapter;
pub use simultaneous_open::SimultaneousOpenAdapter;
pub use stun_assisted::StunAssistedAdapter;
pub use turn::TurnAdapter;

/// Errors from a single adapter attempt
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The adapter's own deadline elapsed
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The request cannot be served by this method
    #[error("{0}")]
    Unsupported(String),

    /// The method needs a signaling channel and none is configured
    #[error("no signaling channel configured")]
    NoSignaling,

    /// The method needs servers of this kind and none are configured
    #[error("no {0} servers configured")]
    NoServers(&'static str),

    /// Signaling failure
    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),

    /// Gateway failure
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    /// STUN failure
    #[error("STUN: {0}")]
    Stun(#[from] StunError),

    /// TURN failure
    #[error("TURN: {0}")]
    Turn(#[from] TurnError),

    /// The peer never answered or answered with something unusable
    #[error("{0}")]
    Unreachable(String),
}

impl AdapterError {
    /// Map into the traversal taxonomy for `method`
    #[must_use]
    pub fn into_traversal(self, method: ConnectionMethod) -> TraversalError {
        match self {
            Self::Timeout(after) => TraversalError::Timeout {
                method: Some(method),
                after,
            },
            Self::Stun(StunError::Io(e)) => TraversalError::method_failed(method, e.to_string()),
            Self::Stun(StunError::Timeout) => {
                TraversalError::method_failed(method, "STUN server did not respond")
            }
            Self::Stun(e) | Self::Turn(TurnError::Protocol(e)) => TraversalError::Protocol {
                method,
                reason: e.to_string(),
            },
            Self::Turn(TurnError::StaleCredential) => TraversalError::StaleCredential { method },
            other => TraversalError::method_failed(method, other.to_string()),
        }
    }
}

/// A traversal technique
#[async_trait]
pub trait MethodAdapter: Send + Sync {
    /// Method this adapter implements
    fn method(&self) -> ConnectionMethod;

    /// Try to connect to the request's peer within `timeout`
    ///
    /// # Errors
    ///
    /// Returns an `AdapterError` describing why the attempt failed. Any
    /// resource opened by the attempt has been released.
    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError>;
}

/// Run `attempt` for each candidate local port in order
///
/// Returns the first success, or the last error once every port failed.
pub async fn try_local_ports<T, F, Fut>(
    request: &ConnectionRequest,
    mut attempt: F,
) -> Result<T, AdapterError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut last = None;
    for port in request.candidate_ports() {
        match attempt(port).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(peer = %request.peer_id, port, error = %e, "Local port attempt failed");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| AdapterError::Unsupported("no local ports to try".into())))
}

/// The request's target, or an error naming the method
pub(crate) fn require_target(
    request: &ConnectionRequest,
    method: ConnectionMethod,
) -> Result<&PeerAddress, AdapterError> {
    request
        .target
        .as_ref()
        .ok_or_else(|| AdapterError::Unsupported(format!("{method} needs a target address")))
}

/// Resolve the request's target, if it has one
pub(crate) async fn resolve_target(
    request: &ConnectionRequest,
) -> Result<Option<SocketAddr>, AdapterError> {
    match &request.target {
        Some(target) => Ok(Some(target.resolve().await?)),
        None => Ok(None),
    }
}

/// Resolve the configured STUN servers, skipping names that do not resolve
pub(crate) async fn resolve_stun_servers(request: &ConnectionRequest) -> Vec<SocketAddr> {
    let mut servers = Vec::with_capacity(request.stun_servers.len());
    for server in &request.stun_servers {
        match server.resolve().await {
            Ok(addr) => servers.push(addr),
            Err(e) => debug!(server = %server, error = %e, "Cannot resolve STUN server"),
        }
    }
    servers
}

/// Send our candidates for `method` and wait up to `timeout` for the peer's
///
/// The inbox is subscribed before sending so an immediate answer cannot be
/// missed.
pub(crate) async fn exchange_candidates(
    signaling: &Signaling,
    peer_id: &str,
    method: ConnectionMethod,
    candidates: Vec<SignalCandidate>,
    timeout: Duration,
) -> Result<Vec<SignalCandidate>, AdapterError> {
    let mut inbox = signaling.inbox().await?;
    debug!(peer = %peer_id, %method, count = candidates.len(), "Offering candidates");
    signaling
        .send(peer_id, SignalPayload::Candidates { method, candidates })
        .await?;

    let answer = inbox.recv_from(peer_id, |payload| match payload {
        SignalPayload::Candidates {
            method: offered,
            candidates,
        } if *offered == method => Some(candidates.clone()),
        _ => None,
    });
    tokio::time::timeout(timeout, answer)
        .await
        .map_err(|_| AdapterError::Timeout(timeout))?
        .ok_or(AdapterError::Signaling(SignalingError::Closed))
}
