//! ICE-style connectivity establishment.
//!
//! Candidates are gathered on one UDP socket (host plus server reflexive),
//! prioritized per RFC 8445 Section 5.1.2 and exchanged over signaling.
//! Both agents then run STUN Binding connectivity checks against the peer's
//! candidates in pair-priority order while answering the peer's checks. The
//! first check that gets a success response selects the pair; its
//! round-trip time is reported with the connection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use burrow_stun::{MessageClass, Method, StunAttribute, StunMessage, TransactionId};
use tokio::net::UdpSocket;
use tokio::time::{Instant, interval, timeout_at};
use tracing::{debug, info, trace};

use super::stun_assisted::gather_udp;
use super::{AdapterError, MethodAdapter, exchange_candidates, resolve_stun_servers, try_local_ports};
use crate::connection::Connection;
use crate::method::ConnectionMethod;
use crate::request::ConnectionRequest;
use crate::signaling::{CandidateKind, SignalCandidate, Signaling};
use crate::sockets::bind_udp;

/// Interval between connectivity checks (RFC 8445 Ta)
pub const CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Local preference for single-homed candidates
pub const LOCAL_PREFERENCE: u32 = 65_535;

/// RFC 8445 type preference
#[must_use]
pub const fn type_preference(kind: CandidateKind) -> u32 {
    match kind {
        CandidateKind::Host => 126,
        CandidateKind::Prflx => 110,
        CandidateKind::Srflx => 100,
        CandidateKind::Relay => 0,
    }
}

/// Candidate priority: `2^24 * type + 2^8 * local + (256 - component)`
#[must_use]
pub const fn candidate_priority(kind: CandidateKind, local_preference: u32, component: u32) -> u32 {
    (type_preference(kind) << 24) + ((local_preference & 0xFFFF) << 8) + (256 - component)
}

/// Pair priority (RFC 8445 Section 6.1.2.3)
///
/// `controlling` and `controlled` are the candidate priorities from each
/// agent's side of the pair.
#[must_use]
pub fn pair_priority(controlling: u32, controlled: u32) -> u64 {
    let g = u64::from(controlling);
    let d = u64::from(controlled);
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
}

/// Remote candidates ordered by the priority of their best pair
///
/// Remote candidates of a different address family than every local
/// candidate are dropped.
#[must_use]
pub fn order_checks(
    local: &[SignalCandidate],
    remote: &[SignalCandidate],
    controlling: bool,
) -> Vec<SocketAddr> {
    let mut pairs: Vec<(u64, SocketAddr)> = Vec::new();
    for r in remote {
        let best = local
            .iter()
            .filter(|l| l.address.is_ipv4() == r.address.is_ipv4())
            .map(|l| {
                if controlling {
                    pair_priority(l.priority, r.priority)
                } else {
                    pair_priority(r.priority, l.priority)
                }
            })
            .max();
        if let Some(priority) = best {
            if !pairs.iter().any(|(_, addr)| *addr == r.address) {
                pairs.push((priority, r.address));
            }
        }
    }
    pairs.sort_by(|a, b| b.0.cmp(&a.0));
    pairs.into_iter().map(|(_, addr)| addr).collect()
}

/// The agent with the lexicographically smaller peer id controls
#[must_use]
pub fn is_controlling(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}

/// Result of a successful check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPair {
    /// Remote candidate that answered
    pub remote: SocketAddr,
    /// Our address as the peer saw it
    pub mapped: Option<SocketAddr>,
    /// Check round-trip time
    pub round_trip: Duration,
}

/// Time to keep answering checks after our own check succeeded
///
/// The peer's check towards us may still be unanswered; leaving early would
/// strand it.
pub const LINGER: Duration = Duration::from_millis(500);

/// Run connectivity checks against `remotes` until one succeeds or `deadline`
///
/// Incoming Binding requests are answered throughout, and a request from an
/// address not yet checked triggers a check towards it.
///
/// # Errors
///
/// Returns an I/O error if the socket fails.
pub async fn run_checks(
    socket: &UdpSocket,
    remotes: &[SocketAddr],
    deadline: Instant,
) -> std::io::Result<Option<SelectedPair>> {
    let mut queue: Vec<SocketAddr> = remotes.to_vec();
    let mut next = 0usize;
    let mut in_flight: HashMap<TransactionId, (SocketAddr, Instant)> = HashMap::new();
    let mut answered: HashSet<SocketAddr> = HashSet::new();
    let mut selected: Option<SelectedPair> = None;
    let mut until = deadline;
    let mut pacer = interval(CHECK_INTERVAL);
    let mut buf = [0u8; 1500];

    loop {
        tokio::select! {
            _ = pacer.tick() => {
                if queue.is_empty() || selected.is_some() {
                    continue;
                }
                let target = queue[next % queue.len()];
                next += 1;
                let request = StunMessage::binding_request();
                in_flight.insert(request.transaction_id, (target, Instant::now()));
                trace!(%target, "Sending connectivity check");
                if let Err(e) = socket.send_to(&request.encode(), target).await {
                    trace!(%target, error = %e, "Check send failed");
                }
            }
            received = timeout_at(until, socket.recv_from(&mut buf)) => {
                let Ok(received) = received else {
                    return Ok(selected);
                };
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
                    ) => continue,
                    Err(e) => return Err(e),
                };
                let Ok(message) = StunMessage::decode(&buf[..len]) else {
                    trace!(%from, "Ignoring non-STUN datagram during checks");
                    continue;
                };
                if message.method() != Method::Binding {
                    continue;
                }

                match message.class() {
                    MessageClass::Request => {
                        let response = message
                            .response(MessageClass::SuccessResponse)
                            .with_attribute(StunAttribute::XorMappedAddress(from));
                        socket.send_to(&response.encode(), from).await?;
                        answered.insert(from);

                        if let Some(pair) = selected {
                            if pair.remote == from {
                                return Ok(selected);
                            }
                        } else if !queue.contains(&from) {
                            debug!(%from, "Triggered check for peer reflexive candidate");
                            queue.insert(next % (queue.len() + 1), from);
                        }
                    }
                    MessageClass::SuccessResponse if selected.is_none() => {
                        if let Some((target, sent)) = in_flight.remove(&message.transaction_id) {
                            let pair = SelectedPair {
                                remote: target,
                                mapped: message.xor_mapped_address(),
                                round_trip: sent.elapsed(),
                            };
                            if answered.contains(&target) {
                                return Ok(Some(pair));
                            }
                            selected = Some(pair);
                            until = deadline.min(Instant::now() + LINGER);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// ICE adapter
#[derive(Debug, Clone, Default)]
pub struct IceAdapter {
    signaling: Option<Signaling>,
}

impl IceAdapter {
    /// Adapter exchanging candidates over `signaling`
    #[must_use]
    pub fn new(signaling: Option<Signaling>) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl MethodAdapter for IceAdapter {
    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::Ice
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let signaling = self.signaling.as_ref().ok_or(AdapterError::NoSignaling)?;
        let servers = resolve_stun_servers(request).await;
        let deadline = Instant::now() + timeout;
        let controlling = is_controlling(signaling.local_id(), &request.peer_id);

        try_local_ports(request, |port| {
            let servers = servers.clone();
            async move {
                let socket = bind_udp(SocketAddr::from(([0, 0, 0, 0], port)))?;
                let gathered = gather_udp(&socket, &servers, None, timeout / 4).await?;
                let remote = exchange_candidates(
                    signaling,
                    &request.peer_id,
                    ConnectionMethod::Ice,
                    gathered.candidates.clone(),
                    deadline.saturating_duration_since(Instant::now()),
                )
                .await?;

                let checks = order_checks(&gathered.candidates, &remote, controlling);
                debug!(peer = %request.peer_id, controlling, checks = checks.len(), "Starting connectivity checks");

                let selected = run_checks(&socket, &checks, deadline)
                    .await?
                    .ok_or_else(|| AdapterError::Unreachable("no candidate pair succeeded".into()))?;

                socket.connect(selected.remote).await?;
                info!(
                    peer = %request.peer_id,
                    remote = %selected.remote,
                    rtt = ?selected.round_trip,
                    "ICE pair selected"
                );

                let mut connection = Connection::udp(ConnectionMethod::Ice, socket, Some(selected.remote))
                    .with_round_trip(selected.round_trip);
                if let Some(external) = selected.mapped.or(gathered.reflexive) {
                    connection = connection.with_external_address(external);
                }
                Ok(connection)
            }
        })
        .await
    }
}
