//! Direct connections to a known peer address.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout as with_timeout;
use tracing::debug;

use super::probe::{PROBE_INTERVAL, probe_exchange, rounds_within};
use super::{AdapterError, MethodAdapter, require_target, try_local_ports};
use crate::connection::Connection;
use crate::method::ConnectionMethod;
use crate::request::{ConnectionRequest, TransportPreference};
use crate::sockets::{bind_tcp, bind_udp, unspecified_for};

/// Direct TCP connect, UDP probe, or either over native IPv6
#[derive(Debug, Clone, Copy)]
pub struct DirectAdapter {
    method: ConnectionMethod,
}

impl DirectAdapter {
    /// TCP connect to the target
    #[must_use]
    pub const fn tcp() -> Self {
        Self {
            method: ConnectionMethod::DirectTcp,
        }
    }

    /// UDP probe/ack with the target
    #[must_use]
    pub const fn udp() -> Self {
        Self {
            method: ConnectionMethod::DirectUdp,
        }
    }

    /// Native IPv6 using the request's transport preference
    #[must_use]
    pub const fn ipv6() -> Self {
        Self {
            method: ConnectionMethod::DirectIpv6,
        }
    }

    fn transport(&self, request: &ConnectionRequest) -> TransportPreference {
        match self.method {
            ConnectionMethod::DirectTcp => TransportPreference::Tcp,
            ConnectionMethod::DirectUdp => TransportPreference::Udp,
            _ => request.transport,
        }
    }
}

/// TCP connect from `local_port` to `target`
pub(crate) async fn connect_tcp(
    method: ConnectionMethod,
    target: SocketAddr,
    local_port: u16,
    timeout: Duration,
) -> Result<Connection, AdapterError> {
    let socket = bind_tcp(unspecified_for(&target, local_port))?;
    let stream = with_timeout(timeout, socket.connect(target))
        .await
        .map_err(|_| AdapterError::Timeout(timeout))??;
    debug!(%method, %target, local = ?stream.local_addr().ok(), "TCP connected");
    Ok(Connection::tcp(method, stream))
}

/// UDP probe from `local_port` to `target`
pub(crate) async fn connect_udp(
    method: ConnectionMethod,
    target: SocketAddr,
    local_port: u16,
    timeout: Duration,
) -> Result<Connection, AdapterError> {
    let socket = bind_udp(unspecified_for(&target, local_port))?;
    let reply = probe_exchange(&socket, &[target], rounds_within(timeout), PROBE_INTERVAL)
        .await?
        .ok_or_else(|| AdapterError::Unreachable(format!("{target} did not answer UDP probes")))?;

    socket.connect(reply.from).await?;
    debug!(%method, peer = %reply.from, rtt = ?reply.round_trip, "UDP path open");
    Ok(Connection::udp(method, socket, Some(reply.from)).with_round_trip(reply.round_trip))
}

#[async_trait]
impl MethodAdapter for DirectAdapter {
    fn method(&self) -> ConnectionMethod {
        self.method
    }

    async fn attempt(
        &self,
        request: &ConnectionRequest,
        timeout: Duration,
    ) -> Result<Connection, AdapterError> {
        let target = require_target(request, self.method)?;

        if self.method == ConnectionMethod::DirectIpv6 && !target.ip().is_some_and(|ip| ip.is_ipv6())
        {
            return Err(AdapterError::Unsupported(format!(
                "{target} is not an IPv6 address"
            )));
        }

        let target = target.resolve().await?;
        let transport = self.transport(request);

        try_local_ports(request, |port| async move {
            match transport {
                TransportPreference::Tcp => connect_tcp(self.method, target, port, timeout).await,
                TransportPreference::Udp => connect_udp(self.method, target, port, timeout).await,
            }
        })
        .await
    }
}
