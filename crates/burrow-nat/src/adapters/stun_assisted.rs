//! STUN-assisted direct UDP.
//!
//! Each peer learns its server reflexive address from a STUN server,
//! exchanges it over signaling and then probes the other's addresses from
//! the same socket, so the NAT binding created by the STUN query is the one
//! the peer's probes arrive on.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use burrow_stun::{StunError, query_mapped_address};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::ice::{LOCAL_PREFERENCE, candidate_priority};
use super::probe::{PROBE_INTERVAL, probe_exchange, rounds_within};
use super::{AdapterError, MethodAdapter, exchange_candidates, resolve_stun_servers, try_local_ports};
use crate::connection::Connection;
use crate::method::ConnectionMethod;
use crate::request::ConnectionRequest;
use crate::signaling::{CandidateKind, SignalCandidate, Signaling};
use crate::sockets::{bind_udp, default_local_ipv4, local_ip_toward};

/// Upper bound on one STUN query during gathering
const MAX_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Candidates gathered on one socket
#[derive(Debug, Default)]
pub struct Gathered {
    /// Host and server reflexive candidates, highest priority first
    pub candidates: Vec<SignalCandidate>,
    /// Server reflexive address, if a STUN server answered
    pub reflexive: Option<SocketAddr>,
    /// Last STUN failure, if no server answered
    pub stun_error: Option<StunError>,
}

fn candidate(kind: CandidateKind, address: SocketAddr) -> SignalCandidate {
    SignalCandidate {
        kind,
        address,
        priority: candidate_priority(kind, LOCAL_PREFERENCE, 1),
    }
}

/// Gather host and server reflexive candidates for `socket`
///
/// `route_hint` picks the interface for the host candidate; without one the
/// first STUN server (or the default route) decides.
///
/// # Errors
///
/// Returns an I/O error if the socket's local address is unavailable.
pub async fn gather_udp(
    socket: &UdpSocket,
    servers: &[SocketAddr],
    route_hint: Option<IpAddr>,
    query_timeout: Duration,
) -> Result<Gathered, AdapterError> {
    let local = socket.local_addr()?;
    let host_ip = if local.ip().is_unspecified() {
        match route_hint.or_else(|| servers.first().map(SocketAddr::ip)) {
            Some(hint) => local_ip_toward(hint),
            None => default_local_ipv4(),
        }
    } else {
        local.ip()
    };

    let mut gathered = Gathered {
        candidates: vec![candidate(
            CandidateKind::Host,
            SocketAddr::new(host_ip, local.port()),
        )],
        ..Gathered::default()
    };

    let query_timeout = query_timeout.min(MAX_QUERY_TIMEOUT);
    for server in servers {
        match query_mapped_address(socket, *server, query_timeout).await {
            Ok(mapped) => {
                debug!(%server, %mapped, "Server reflexive address");
                gathered.reflexive = Some(mapped);
                if !gathered.candidates.iter().any(|c| c.address == mapped) {
                    gathered
                        .candidates
                        .push(candidate(CandidateKind::Srflx, mapped));
                }
                gathered.stun_error = None;
                break;
            }
            Err(e) => {
                debug!(%server, error = %e, "STUN query failed");
                gathered.stun_error = Some(e);
            }
        }
    }

    Ok(gathered)
}

/// STUN-assisted adapter
#[derive(Debug, Clone, Default)]
pub struct StunAssistedAdapter {
    signaling: Option<Signaling>,
}

impl StunAssistedAdapter {
    /// Adapter exchanging addresses over `signaling`
    #[must_use]
    pub fn new(signaling: Option<Signaling>) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl MethodAdapter for StunAssistedAdapter {
    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::StunAssisted
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let signaling = self.signaling.as_ref().ok_or(AdapterError::NoSignaling)?;
        let servers = resolve_stun_servers(request).await;
        if servers.is_empty() {
            return Err(AdapterError::NoServers("STUN"));
        }

        try_local_ports(request, |port| {
            let servers = servers.clone();
            async move {
                let socket = bind_udp(SocketAddr::from(([0, 0, 0, 0], port)))?;
                let gathered = gather_udp(&socket, &servers, None, timeout / 4).await?;
                let Some(reflexive) = gathered.reflexive else {
                    return Err(gathered
                        .stun_error
                        .map_or(AdapterError::NoServers("STUN"), AdapterError::Stun));
                };

                let remote = exchange_candidates(
                    signaling,
                    &request.peer_id,
                    ConnectionMethod::StunAssisted,
                    gathered.candidates,
                    timeout,
                )
                .await?;
                let targets: Vec<SocketAddr> = remote.iter().map(|c| c.address).collect();

                let reply = probe_exchange(&socket, &targets, rounds_within(timeout), PROBE_INTERVAL)
                    .await?
                    .ok_or_else(|| {
                        AdapterError::Unreachable("peer addresses did not answer probes".into())
                    })?;

                socket.connect(reply.from).await?;
                info!(peer = %request.peer_id, remote = %reply.from, %reflexive, "STUN-assisted path open");
                Ok(Connection::udp(ConnectionMethod::StunAssisted, socket, Some(reply.from))
                    .with_round_trip(reply.round_trip)
                    .with_external_address(reflexive))
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{signaling_pair, spawn_stun_server};

    #[tokio::test]
    async fn test_gather_loopback() {
        let stun = spawn_stun_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();

        let gathered = gather_udp(&socket, &[stun], None, Duration::from_secs(1))
            .await
            .unwrap();

        // On loopback the reflexive address is the host address
        assert_eq!(gathered.reflexive, Some(local));
        assert_eq!(gathered.candidates.len(), 1);
        assert_eq!(gathered.candidates[0].kind, CandidateKind::Host);
        assert!(gathered.stun_error.is_none());
    }

    #[tokio::test]
    async fn test_gather_without_answer_keeps_error() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let gathered = gather_udp(
            &socket,
            &[silent.local_addr().unwrap()],
            None,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert!(gathered.reflexive.is_none());
        assert!(matches!(gathered.stun_error, Some(StunError::Timeout)));
        assert_eq!(gathered.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_two_peers_connect() {
        let stun = spawn_stun_server().await;
        let (alice, bob) = signaling_pair("alice", "bob");

        let to_bob = ConnectionRequest::new("bob").with_stun_server(stun);
        let to_alice = ConnectionRequest::new("alice").with_stun_server(stun);
        let a = StunAssistedAdapter::new(Some(alice));
        let b = StunAssistedAdapter::new(Some(bob));

        let (ra, rb) = tokio::join!(
            a.attempt(&to_bob, Duration::from_secs(5)),
            b.attempt(&to_alice, Duration::from_secs(5)),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.method, ConnectionMethod::StunAssisted);
        assert_eq!(ra.remote.map(|r| r.port()), rb.details.local_addr.map(|l| l.port()));
        assert_eq!(rb.method, ConnectionMethod::StunAssisted);
        assert!(ra.details.external_address.is_some());
    }

    #[tokio::test]
    async fn test_requires_servers() {
        let (alice, _bob) = signaling_pair("alice", "bob");
        let err = StunAssistedAdapter::new(Some(alice))
            .attempt(&ConnectionRequest::new("bob"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NoServers("STUN")));
    }
}
