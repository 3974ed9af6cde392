//! TCP simultaneous open.
//!
//! Both peers connect to each other from a fixed local port without
//! listening. When the SYNs cross, each side's NAT has already seen an
//! outbound SYN for the pair and lets the other one in.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout as with_timeout;
use tracing::{debug, info};

use super::hole_punch::connect_rounds;
use super::ice::{LOCAL_PREFERENCE, candidate_priority};
use super::{AdapterError, MethodAdapter, exchange_candidates, resolve_target, try_local_ports};
use crate::connection::Connection;
use crate::method::ConnectionMethod;
use crate::request::ConnectionRequest;
use crate::signaling::{CandidateKind, SignalCandidate, Signaling};
use crate::sockets::{bind_tcp, default_local_ipv4, local_ip_toward, unspecified_for};

/// TCP simultaneous open adapter
#[derive(Debug, Clone, Default)]
pub struct SimultaneousOpenAdapter {
    signaling: Option<Signaling>,
}

impl SimultaneousOpenAdapter {
    /// Adapter learning the peer's port over `signaling`
    ///
    /// Without signaling the request's target must carry the port the peer
    /// is connecting from.
    #[must_use]
    pub fn new(signaling: Option<Signaling>) -> Self {
        Self { signaling }
    }
}

/// Pin an ephemeral port so every connect round reuses it
fn reserve_port(target: Option<SocketAddr>, port: u16) -> Result<u16, AdapterError> {
    if port != 0 {
        return Ok(port);
    }
    let probe = target.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let socket = bind_tcp(unspecified_for(&probe, 0))?;
    Ok(socket.local_addr()?.port())
}

#[async_trait]
impl MethodAdapter for SimultaneousOpenAdapter {
    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::TcpSimultaneousOpen
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
            let local_port = reserve_port(target, port)?;

            let peers: Vec<SocketAddr> = match &self.signaling {
                Some(signaling) => {
                    let host_ip = target.map_or_else(default_local_ipv4, |t| local_ip_toward(t.ip()));
                    let ours = SignalCandidate {
                        kind: CandidateKind::Host,
                        address: SocketAddr::new(host_ip, local_port),
                        priority: candidate_priority(CandidateKind::Host, LOCAL_PREFERENCE, 1),
                    };
                    exchange_candidates(
                        signaling,
                        &request.peer_id,
                        ConnectionMethod::TcpSimultaneousOpen,
                        vec![ours],
                        timeout,
                    )
                    .await?
                    .into_iter()
                    .map(|c| c.address)
                    .collect()
                }
                None => target.into_iter().collect(),
            };
            if peers.is_empty() {
                return Err(AdapterError::Unreachable("peer offered no addresses".into()));
            }

            debug!(peer = %request.peer_id, local_port, ?peers, "Simultaneous open");
            let stream = with_timeout(timeout, connect_rounds(local_port, &peers))
                .await
                .map_err(|_| AdapterError::Timeout(timeout))?;

            info!(peer = %request.peer_id, remote = ?stream.peer_addr().ok(), local_port, "TCP simultaneous open succeeded");
            Ok(Connection::tcp(ConnectionMethod::TcpSimultaneousOpen, stream))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::signaling_pair;
    use crate::signaling::SignalPayload;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_from_requested_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().1 });

        let reserved = reserve_port(Some(target), 0).unwrap();
        let request = ConnectionRequest::new("bob")
            .with_target(target)
            .with_local_ports([reserved]);
        let connection = SimultaneousOpenAdapter::default()
            .attempt(&request, Duration::from_secs(2))
            .await
            .unwrap();

        let from = accept.await.unwrap();
        assert_eq!(connection.method, ConnectionMethod::TcpSimultaneousOpen);
        assert_eq!(connection.remote, Some(target));
        assert_eq!(from.port(), reserved);
    }

    #[tokio::test]
    async fn test_peer_address_from_signaling() {
        let (alice, bob) = signaling_pair("alice", "bob");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bob_addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let mut inbox = bob.inbox().await.unwrap();
            bob.send(
                "alice",
                SignalPayload::Candidates {
                    method: ConnectionMethod::TcpSimultaneousOpen,
                    candidates: vec![SignalCandidate {
                        kind: CandidateKind::Host,
                        address: bob_addr,
                        priority: 1,
                    }],
                },
            )
            .await
            .unwrap();
            let offer = inbox.recv().await.unwrap();
            let (_, from) = listener.accept().await.unwrap();
            (offer, from)
        });

        let connection = SimultaneousOpenAdapter::new(Some(alice))
            .attempt(&ConnectionRequest::new("bob"), Duration::from_secs(2))
            .await
            .unwrap();
        let (offer, from) = peer.await.unwrap();

        assert_eq!(connection.remote, Some(bob_addr));
        assert_eq!(offer.from, "alice");
        match offer.payload {
            SignalPayload::Candidates { candidates, .. } => {
                assert_eq!(candidates[0].address.port(), from.port());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_times_out_without_peer() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);

        let err = SimultaneousOpenAdapter::default()
            .attempt(
                &ConnectionRequest::new("bob").with_target(target),
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
    }
}
