//! Gateway port-mapping adapter shared by UPnP and NAT-PMP/PCP.
//!
//! The attempt maps the local port, opens the listening socket on it and
//! then waits for the peer (TCP) or hands the bound socket back (UDP). The
//! mapping is owned by a [`MappingGuard`] until the connection is returned,
//! so every failure and every dropped attempt deletes it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout as with_timeout;
use tracing::{debug, info};

use super::{AdapterError, MethodAdapter, resolve_target, try_local_ports};
use crate::connection::{Connection, ConnectionDetails};
use crate::gateway::{GatewayClient, MappingGuard, MappingProtocol, NatPmpClient, UpnpClient};
use crate::method::ConnectionMethod;
use crate::request::{ConnectionRequest, TransportPreference};
use crate::signaling::{CandidateKind, SignalCandidate, SignalPayload, Signaling};
use crate::sockets::{bind_udp, listen_tcp};

/// Default mapping lifetime requested from the gateway
pub const DEFAULT_MAPPING_LIFETIME: Duration = Duration::from_secs(3600);

/// Port mapping through a gateway
pub struct PortMappingAdapter {
    method: ConnectionMethod,
    gateway: Arc<dyn GatewayClient>,
    lifetime: Duration,
    signaling: Option<Signaling>,
}

impl PortMappingAdapter {
    /// Adapter for `method` backed by `gateway`
    pub fn new(method: ConnectionMethod, gateway: Arc<dyn GatewayClient>) -> Self {
        Self {
            method,
            gateway,
            lifetime: DEFAULT_MAPPING_LIFETIME,
            signaling: None,
        }
    }

    /// UPnP adapter
    #[must_use]
    pub fn upnp(client: UpnpClient) -> Self {
        Self::new(ConnectionMethod::Upnp, Arc::new(client))
    }

    /// NAT-PMP/PCP adapter
    #[must_use]
    pub fn nat_pmp(client: NatPmpClient) -> Self {
        Self::new(ConnectionMethod::NatPmp, Arc::new(client))
    }

    /// Requested mapping lifetime
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Announce the mapped address to the peer over `signaling`
    #[must_use]
    pub fn with_signaling(mut self, signaling: Signaling) -> Self {
        self.signaling = Some(signaling);
        self
    }

    async fn map(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
    ) -> Result<MappingGuard, AdapterError> {
        let mapping = self
            .gateway
            .add_mapping(protocol, internal_port, internal_port, self.lifetime)
            .await?;
        info!(
            gateway = self.gateway.name(),
            protocol = %protocol,
            internal_port,
            external = ?mapping.external_addr(),
            "Port mapped"
        );
        Ok(MappingGuard::new(Arc::clone(&self.gateway), mapping))
    }

    async fn announce(&self, peer_id: &str, guard: &MappingGuard) -> Result<(), AdapterError> {
        let (Some(signaling), Some(external)) = (
            &self.signaling,
            guard.mapping().and_then(|m| m.external_addr()),
        ) else {
            return Ok(());
        };
        let candidate = SignalCandidate {
            kind: CandidateKind::Srflx,
            address: external,
            priority: 0,
        };
        signaling
            .send(
                peer_id,
                SignalPayload::Candidates {
                    method: self.method,
                    candidates: vec![candidate],
                },
            )
            .await?;
        Ok(())
    }

    async fn attempt_port(
        &self,
        request: &ConnectionRequest,
        port: u16,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let bind: SocketAddr = (IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into();

        match request.transport {
            TransportPreference::Tcp => {
                let listener = listen_tcp(bind)?;
                let internal = listener.local_addr()?.port();
                let guard = self.map(MappingProtocol::Tcp, internal).await?;

                let accepted = match self.announce(&request.peer_id, &guard).await {
                    Ok(()) => with_timeout(timeout, listener.accept())
                        .await
                        .map_err(|_| AdapterError::Timeout(timeout))
                        .and_then(|accepted| accepted.map_err(AdapterError::from)),
                    Err(e) => Err(e),
                };

                match accepted {
                    Ok((stream, from)) => {
                        debug!(method = %self.method, %from, "Inbound connection on mapped port");
                        let external = guard.mapping().and_then(|m| m.external_addr());
                        let connection = Connection::tcp(self.method, stream);
                        Ok(self.finish(connection, guard, external))
                    }
                    Err(e) => {
                        guard.release().await;
                        Err(e)
                    }
                }
            }
            TransportPreference::Udp => {
                let socket = bind_udp(bind)?;
                let internal = socket.local_addr()?.port();
                let guard = self.map(MappingProtocol::Udp, internal).await?;

                let prepared = match self.announce(&request.peer_id, &guard).await {
                    Ok(()) => resolve_target(request).await,
                    Err(e) => Err(e),
                };

                match prepared {
                    Ok(remote) => {
                        let external = guard.mapping().and_then(|m| m.external_addr());
                        let connection = Connection::udp(self.method, socket, remote);
                        Ok(self.finish(connection, guard, external))
                    }
                    Err(e) => {
                        guard.release().await;
                        Err(e)
                    }
                }
            }
        }
    }

    fn finish(
        &self,
        connection: Connection,
        guard: MappingGuard,
        external: Option<SocketAddr>,
    ) -> Connection {
        let details = ConnectionDetails {
            external_address: external,
            mapping: guard.keep(),
            ..connection.details.clone()
        };
        connection.with_details(details)
    }
}

impl std::fmt::Debug for PortMappingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortMappingAdapter")
            .field("method", &self.method)
            .field("gateway", &self.gateway.name())
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl MethodAdapter for PortMappingAdapter {
    fn method(&self) -> ConnectionMethod {
        self.method
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        try_local_ports(request, |port| self.attempt_port(request, port, timeout)).await
    }
}
