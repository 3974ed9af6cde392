//! Relayed connections through a TURN server.
//!
//! The adapter allocates a relay, learns the peer's address (the request's
//! target, or the peer's own relay announced over signaling), installs a
//! permission for it and hands the live session to the caller. Any failure
//! after allocation closes the session so the server frees the relay.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use burrow_stun::turn::{TurnClient, TurnError, TurnOptions, TurnServer};
use tokio::time::timeout as with_timeout;
use tracing::{debug, info, warn};

use super::{AdapterError, MethodAdapter, resolve_target};
use crate::connection::Connection;
use crate::method::ConnectionMethod;
use crate::request::ConnectionRequest;
use crate::signaling::{SignalPayload, Signaling, SignalingError};

/// TURN relay adapter
#[derive(Debug, Clone, Default)]
pub struct TurnAdapter {
    signaling: Option<Signaling>,
    options: TurnOptions,
}

impl TurnAdapter {
    /// Adapter announcing relays over `signaling`
    #[must_use]
    pub fn new(signaling: Option<Signaling>) -> Self {
        Self {
            signaling,
            options: TurnOptions::default(),
        }
    }

    /// Session tuning for every allocation
    #[must_use]
    pub fn with_options(mut self, options: TurnOptions) -> Self {
        self.options = options;
        self
    }

    async fn relay_via(
        &self,
        server: &TurnServer,
        request: &ConnectionRequest,
        target: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let client = TurnClient::new(server.clone(), self.options.clone());
        let established = with_timeout(timeout, self.establish(&client, request, target, timeout))
            .await
            .unwrap_or(Err(AdapterError::Timeout(timeout)));

        match established {
            Ok(peer) => {
                info!(
                    peer = %request.peer_id,
                    server = %server.host,
                    relay = ?client.relayed_address(),
                    %peer,
                    "Relay ready"
                );
                Ok(Connection::relay(ConnectionMethod::Turn, client, Some(peer)))
            }
            Err(e) => {
                if let Err(close) = client.close().await {
                    debug!(server = %server.host, error = %close, "Closing failed relay");
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        client: &TurnClient,
        request: &ConnectionRequest,
        target: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<SocketAddr, AdapterError> {
        let allocation = client.connect().await?;
        let relay = allocation.relayed_address;

        let peer = match (&self.signaling, target) {
            (Some(signaling), Some(target)) => {
                signaling
                    .send(&request.peer_id, SignalPayload::Allocation { relay })
                    .await?;
                target
            }
            (Some(signaling), None) => {
                let mut inbox = signaling.inbox().await?;
                signaling
                    .send(&request.peer_id, SignalPayload::Allocation { relay })
                    .await?;
                let answer = inbox.recv_from(&request.peer_id, |payload| match payload {
                    SignalPayload::Allocation { relay } => Some(*relay),
                    _ => None,
                });
                with_timeout(timeout, answer)
                    .await
                    .map_err(|_| AdapterError::Timeout(timeout))?
                    .ok_or(AdapterError::Signaling(SignalingError::Closed))?
            }
            (None, Some(target)) => target,
            (None, None) => return Err(AdapterError::NoSignaling),
        };

        client.create_permission(peer).await?;
        if let Some(signaling) = &self.signaling {
            signaling
                .send(&request.peer_id, SignalPayload::Permission { peer })
                .await?;
        }
        Ok(peer)
    }
}

#[async_trait]
impl MethodAdapter for TurnAdapter {
    fn method(&self) -> ConnectionMethod {
        ConnectionMethod::Turn
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        if request.turn_servers.is_empty() {
            return Err(AdapterError::NoServers("TURN"));
        }
        let target = resolve_target(request).await?;
        if self.signaling.is_none() && target.is_none() {
            return Err(AdapterError::NoSignaling);
        }

        let mut last = None;
        for server in &request.turn_servers {
            match self.relay_via(server, request, target, timeout).await {
                Ok(connection) => return Ok(connection),
                Err(AdapterError::Turn(TurnError::StaleCredential)) => {
                    warn!(server = %server.host, "TURN credentials rejected");
                    last = Some(AdapterError::Turn(TurnError::StaleCredential));
                }
                Err(e) => {
                    debug!(server = %server.host, error = %e, "TURN server failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(AdapterError::NoServers("TURN")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::signaling_pair;
    use crate::connection::TransportHandle;
    use burrow_stun::{MessageClass, Method, StunAttribute, StunMessage};
    use std::sync::{Arc, Mutex};
    use tokio::net::UdpSocket;

    /// Accepts every request; the relay port mirrors the client's port
    async fn spawn_turn_server() -> (SocketAddr, Arc<Mutex<Vec<(Method, Option<SocketAddr>)>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(request) = StunMessage::decode(&buf[..len]) else {
                    continue;
                };
                if request.class() != MessageClass::Request {
                    continue;
                }
                log.lock().unwrap().push((request.method(), request.xor_peer_address()));

                let mut response = request.response(MessageClass::SuccessResponse);
                if request.method() == Method::Allocate {
                    response.add_attribute(StunAttribute::XorRelayedAddress(
                        SocketAddr::new("198.51.100.20".parse().unwrap(), from.port()),
                    ));
                    response.add_attribute(StunAttribute::XorMappedAddress(from));
                    response.add_attribute(StunAttribute::Lifetime(600));
                }
                let _ = socket.send_to(&response.encode(), from).await;
            }
        });
        (addr, seen)
    }

    fn server(addr: SocketAddr) -> TurnServer {
        TurnServer::new(addr.ip().to_string(), "alice", "secret").with_port(addr.port())
    }

    #[tokio::test]
    async fn test_relay_to_target() {
        let (addr, seen) = spawn_turn_server().await;
        let target: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let request = ConnectionRequest::new("bob")
            .with_target(target)
            .with_turn_server(server(addr));

        let connection = TurnAdapter::default()
            .attempt(&request, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(connection.method, ConnectionMethod::Turn);
        assert_eq!(connection.remote, Some(target));
        let relay = connection.details.relay_address.unwrap();
        assert_eq!(relay.ip().to_string(), "198.51.100.20");
        assert!(connection.details.external_address.is_some());

        let TransportHandle::Relay(client) = &connection.transport else {
            panic!("expected a relay transport");
        };
        assert!(client.permission(target.ip()).is_some());

        let methods = seen.lock().unwrap().clone();
        assert!(methods.contains(&(Method::CreatePermission, Some(target))));
    }

    #[tokio::test]
    async fn test_relays_exchanged_over_signaling() {
        let (addr, _) = spawn_turn_server().await;
        let (alice, bob) = signaling_pair("alice", "bob");
        let to_bob = ConnectionRequest::new("bob").with_turn_server(server(addr));
        let to_alice = ConnectionRequest::new("alice").with_turn_server(server(addr));

        let a = TurnAdapter::new(Some(alice));
        let b = TurnAdapter::new(Some(bob));
        let (ra, rb) = tokio::join!(
            a.attempt(&to_bob, Duration::from_secs(3)),
            b.attempt(&to_alice, Duration::from_secs(3)),
        );
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.remote, rb.details.relay_address);
        assert_eq!(rb.remote, ra.details.relay_address);
    }

    #[tokio::test]
    async fn test_unanswered_server_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = ConnectionRequest::new("bob")
            .with_target("203.0.113.7:40000".parse::<SocketAddr>().unwrap())
            .with_turn_server(server(silent.local_addr().unwrap()));

        let err = TurnAdapter::default()
            .attempt(&request, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_requires_servers() {
        let err = TurnAdapter::default()
            .attempt(&ConnectionRequest::new("bob"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NoServers("TURN")));
    }
}
