//! UDP and TCP hole punching.
//!
//! Both peers learn each other's addresses over signaling (or from a known
//! target) and send outbound traffic at the same time so that each NAT sees
//! the other's packets as replies to an existing binding.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout as with_timeout};
use tracing::{debug, info, trace};

use super::ice::{LOCAL_PREFERENCE, candidate_priority, is_controlling};
use super::probe::{PROBE_INTERVAL, ProbeReply, probe_exchange, rounds_within};
use super::stun_assisted::gather_udp;
use super::{
    AdapterError, MethodAdapter, exchange_candidates, resolve_stun_servers, resolve_target,
    try_local_ports,
};
use crate::connection::Connection;
use crate::method::ConnectionMethod;
use crate::request::ConnectionRequest;
use crate::signaling::{CandidateKind, SignalCandidate, Signaling};
use crate::sockets::{
    bind_tcp, bind_udp, default_local_ipv4, listen_tcp, local_ip_toward, unspecified_for,
};

/// Ports on each side of the peer's external port tried by prediction
pub const MAX_PORT_RANGE: u16 = 10;

/// Bound on one outbound TCP connect during punching
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between outbound TCP connect rounds
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Addresses near `external` for NATs that allocate ports sequentially
#[must_use]
pub fn predict_ports(external: SocketAddr, range: u16) -> Vec<SocketAddr> {
    let base = external.port();
    let mut predicted = Vec::with_capacity(usize::from(range) * 2);
    for offset in 1..=range {
        if let Some(port) = base.checked_add(offset) {
            predicted.push(SocketAddr::new(external.ip(), port));
        }
        if let Some(port) = base.checked_sub(offset).filter(|p| *p != 0) {
            predicted.push(SocketAddr::new(external.ip(), port));
        }
    }
    predicted
}

/// Peer addresses to punch towards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchTargets {
    /// Public (server reflexive) address
    pub external: SocketAddr,
    /// LAN address, when the peer offered one that differs
    pub internal: Option<SocketAddr>,
}

impl PunchTargets {
    /// Pick targets from the peer's candidates, falling back to `target`
    ///
    /// A server reflexive candidate is preferred as the external address.
    #[must_use]
    pub fn from_candidates(candidates: &[SignalCandidate], target: Option<SocketAddr>) -> Option<Self> {
        let srflx = candidates
            .iter()
            .find(|c| c.kind == CandidateKind::Srflx)
            .map(|c| c.address);
        let host = candidates
            .iter()
            .find(|c| c.kind == CandidateKind::Host)
            .map(|c| c.address);

        let external = srflx.or(host).or(target)?;
        Some(Self {
            external,
            internal: host.filter(|h| *h != external),
        })
    }

    fn primary(&self) -> Vec<SocketAddr> {
        let mut targets = vec![self.external];
        targets.extend(self.internal);
        targets
    }
}

/// UDP hole puncher owning its socket
#[derive(Debug)]
pub struct HolePuncher {
    socket: UdpSocket,
}

impl HolePuncher {
    /// Wrap a bound socket
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    /// Punching socket
    #[must_use]
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Release the socket
    #[must_use]
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }

    /// Probe the peer until a probe or ack comes back
    ///
    /// The first half of the budget probes the external and internal
    /// addresses; the second half adds predicted ports around the external
    /// one.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::Unreachable` if nothing answered and an I/O
    /// error if the socket fails.
    pub async fn punch(
        &self,
        targets: PunchTargets,
        budget: Duration,
    ) -> Result<ProbeReply, AdapterError> {
        let rounds = rounds_within(budget);
        let direct_rounds = (rounds / 2).max(1);

        let primary = targets.primary();
        if let Some(reply) =
            probe_exchange(&self.socket, &primary, direct_rounds, PROBE_INTERVAL).await?
        {
            return Ok(reply);
        }

        trace!(external = %targets.external, "Trying predicted ports");
        let mut widened = primary;
        widened.extend(predict_ports(targets.external, MAX_PORT_RANGE));
        let remaining = rounds.saturating_sub(direct_rounds).max(1);
        probe_exchange(&self.socket, &widened, remaining, PROBE_INTERVAL)
            .await?
            .ok_or_else(|| AdapterError::Unreachable("hole punching got no answer".into()))
    }

    /// Send a keepalive so the NAT binding stays open
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram cannot be sent.
    pub async fn maintain_hole(&self, peer: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(super::probe::PROBE_MARKER, peer).await?;
        Ok(())
    }
}

/// UDP hole punching adapter
#[derive(Debug, Clone, Default)]
pub struct UdpHolePunchAdapter {
    signaling: Option<Signaling>,
}

impl UdpHolePunchAdapter {
    /// Adapter exchanging candidates over `signaling`
    ///
    /// Without signaling the request's target is punched directly, which
    /// needs the peer to do the same at the same time.
    #[must_use]
    pub fn new(signaling: Option<Signaling>) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl MethodAdapter for UdpHolePunchAdapter {
    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::UdpHolePunch
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let target = resolve_target(request).await?;
        if self.signaling.is_none() && target.is_none() {
            return Err(AdapterError::NoSignaling);
        }
        let servers = resolve_stun_servers(request).await;

        try_local_ports(request, |port| {
            let servers = servers.clone();
            async move {
                let socket = bind_udp(SocketAddr::from(([0, 0, 0, 0], port)))?;
                let gathered =
                    gather_udp(&socket, &servers, target.map(|t| t.ip()), timeout / 4).await?;

                let remote = match &self.signaling {
                    Some(signaling) => {
                        exchange_candidates(
                            signaling,
                            &request.peer_id,
                            ConnectionMethod::UdpHolePunch,
                            gathered.candidates.clone(),
                            timeout,
                        )
                        .await?
                    }
                    None => Vec::new(),
                };
                let targets = PunchTargets::from_candidates(&remote, target).ok_or_else(|| {
                    AdapterError::Unreachable("peer offered no addresses".into())
                })?;

                debug!(peer = %request.peer_id, external = %targets.external, internal = ?targets.internal, "Punching");
                let puncher = HolePuncher::new(socket);
                let reply = puncher.punch(targets, timeout).await?;

                let socket = puncher.into_socket();
                socket.connect(reply.from).await?;
                info!(peer = %request.peer_id, remote = %reply.from, "UDP hole punched");

                let connection = Connection::udp(ConnectionMethod::UdpHolePunch, socket, Some(reply.from))
                    .with_round_trip(reply.round_trip);
                Ok(match gathered.reflexive {
                    Some(external) => connection.with_external_address(external),
                    None => connection,
                })
            }
        })
        .await
    }
}

/// Connect from `local_port` to each peer address until one succeeds
pub(crate) async fn connect_rounds(local_port: u16, peers: &[SocketAddr]) -> TcpStream {
    loop {
        for peer in peers {
            let socket = match bind_tcp(unspecified_for(peer, local_port)) {
                Ok(socket) => socket,
                Err(e) => {
                    trace!(%peer, error = %e, "Cannot bind punching socket");
                    continue;
                }
            };
            match with_timeout(CONNECT_TIMEOUT, socket.connect(*peer)).await {
                Ok(Ok(stream)) => return stream,
                Ok(Err(e)) => trace!(%peer, error = %e, "Outbound TCP punch failed"),
                Err(_) => trace!(%peer, "Outbound TCP punch timed out"),
            }
        }
        sleep(CONNECT_RETRY).await;
    }
}

/// TCP hole punching adapter
///
/// Both peers bind a listener and outbound sockets to the same local port.
/// The controlling peer only connects; the controlled peer connects to open
/// its own NAT and also accepts, so exactly one connection is formed.
#[derive(Debug, Clone, Default)]
pub struct TcpHolePunchAdapter {
    signaling: Option<Signaling>,
}

impl TcpHolePunchAdapter {
    /// Adapter exchanging candidates over `signaling`
    #[must_use]
    pub fn new(signaling: Option<Signaling>) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl MethodAdapter for TcpHolePunchAdapter {
    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::TcpHolePunch
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let target = resolve_target(request).await?;
        if self.signaling.is_none() && target.is_none() {
            return Err(AdapterError::NoSignaling);
        }

        try_local_ports(request, |port| async move {
            let listener = listen_tcp(SocketAddr::from(([0, 0, 0, 0], port)))?;
            let local_port = listener.local_addr()?.port();

            let (peers, controlling) = match &self.signaling {
                Some(signaling) => {
                    let host_ip = target.map_or_else(default_local_ipv4, |t| local_ip_toward(t.ip()));
                    let host = SignalCandidate {
                        kind: CandidateKind::Host,
                        address: SocketAddr::new(host_ip, local_port),
                        priority: candidate_priority(CandidateKind::Host, LOCAL_PREFERENCE, 1),
                    };
                    let remote = exchange_candidates(
                        signaling,
                        &request.peer_id,
                        ConnectionMethod::TcpHolePunch,
                        vec![host],
                        timeout,
                    )
                    .await?;
                    let mut peers: Vec<SocketAddr> = remote.iter().map(|c| c.address).collect();
                    peers.extend(target.filter(|t| !peers.contains(t)));
                    (peers, is_controlling(signaling.local_id(), &request.peer_id))
                }
                None => (target.into_iter().collect(), true),
            };
            if peers.is_empty() {
                return Err(AdapterError::Unreachable("peer offered no addresses".into()));
            }

            debug!(peer = %request.peer_id, local_port, controlling, ?peers, "Punching TCP");
            let stream = if controlling {
                drop(listener);
                with_timeout(timeout, connect_rounds(local_port, &peers))
                    .await
                    .map_err(|_| AdapterError::Timeout(timeout))?
            } else {
                let accepted = async {
                    let (stream, from) = listener.accept().await?;
                    trace!(%from, "Accepted punched TCP connection");
                    Ok::<_, AdapterError>(stream)
                };
                let outcome = tokio::select! {
                    accepted = accepted => accepted,
                    connected = connect_rounds(local_port, &peers) => Ok(connected),
                    () = sleep(timeout) => Err(AdapterError::Timeout(timeout)),
                };
                outcome?
            };

            info!(peer = %request.peer_id, remote = ?stream.peer_addr().ok(), "TCP hole punched");
            Ok(Connection::tcp(ConnectionMethod::TcpHolePunch, stream))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::signaling_pair;

    #[test]
    fn test_port_prediction() {
        let external: SocketAddr = "203.0.113.9:40000".parse().unwrap();
        let predicted = predict_ports(external, 2);
        assert_eq!(
            predicted,
            vec![
                "203.0.113.9:40001".parse().unwrap(),
                "203.0.113.9:39999".parse().unwrap(),
                "203.0.113.9:40002".parse().unwrap(),
                "203.0.113.9:39998".parse().unwrap(),
            ]
        );

        let edge = predict_ports("203.0.113.9:1".parse().unwrap(), 2);
        assert_eq!(edge.len(), 2);
        assert!(edge.iter().all(|a| a.port() > 1));
    }

    #[test]
    fn test_targets_from_candidates() {
        let cand = |kind, addr: &str| SignalCandidate {
            kind,
            address: addr.parse().unwrap(),
            priority: 0,
        };
        let targets = PunchTargets::from_candidates(
            &[
                cand(CandidateKind::Host, "192.168.1.5:5000"),
                cand(CandidateKind::Srflx, "203.0.113.5:41000"),
            ],
            None,
        )
        .unwrap();
        assert_eq!(targets.external, "203.0.113.5:41000".parse().unwrap());
        assert_eq!(targets.internal, Some("192.168.1.5:5000".parse().unwrap()));

        let only_host =
            PunchTargets::from_candidates(&[cand(CandidateKind::Host, "10.0.0.7:5000")], None).unwrap();
        assert_eq!(only_host.external, "10.0.0.7:5000".parse().unwrap());
        assert_eq!(only_host.internal, None);

        assert!(PunchTargets::from_candidates(&[], None).is_none());
    }

    #[tokio::test]
    async fn test_udp_punch_between_peers() {
        let (alice, bob) = signaling_pair("alice", "bob");
        let a = UdpHolePunchAdapter::new(Some(alice));
        let b = UdpHolePunchAdapter::new(Some(bob));
        let to_bob = ConnectionRequest::new("bob").with_target("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        let to_alice = ConnectionRequest::new("alice").with_target("127.0.0.1:9".parse::<SocketAddr>().unwrap());

        let (ra, rb) = tokio::join!(
            a.attempt(&to_bob, Duration::from_secs(5)),
            b.attempt(&to_alice, Duration::from_secs(5)),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.method, ConnectionMethod::UdpHolePunch);
        assert_eq!(ra.remote.map(|r| r.port()), rb.details.local_addr.map(|l| l.port()));
        assert_eq!(rb.remote.map(|r| r.port()), ra.details.local_addr.map(|l| l.port()));
    }

    #[tokio::test]
    async fn test_tcp_punch_between_peers() {
        let (alice, bob) = signaling_pair("alice", "bob");
        let a = TcpHolePunchAdapter::new(Some(alice));
        let b = TcpHolePunchAdapter::new(Some(bob));
        let to_bob = ConnectionRequest::new("bob").with_target("127.0.0.1:9".parse::<SocketAddr>().unwrap());
        let to_alice = ConnectionRequest::new("alice").with_target("127.0.0.1:9".parse::<SocketAddr>().unwrap());

        let (ra, rb) = tokio::join!(
            a.attempt(&to_bob, Duration::from_secs(5)),
            b.attempt(&to_alice, Duration::from_secs(5)),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.method, ConnectionMethod::TcpHolePunch);
        assert_eq!(ra.remote, rb.details.local_addr);
        assert_eq!(rb.remote, ra.details.local_addr);
    }

    #[tokio::test]
    async fn test_requires_signaling_or_target() {
        let err = UdpHolePunchAdapter::default()
            .attempt(&ConnectionRequest::new("bob"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NoSignaling));
    }
}
