//! Established connections handed back to the caller.

use std::net::SocketAddr;
use std::time::Duration;

use burrow_stun::turn::TurnClient;
use tokio::net::{TcpStream, UdpSocket};

use crate::error::TraversalError;
use crate::gateway::PortMapping;
use crate::method::ConnectionMethod;

/// Outcome of a `connect` call
pub type ConnectionResult = Result<Connection, TraversalError>;

/// Opened transport, owned by the caller once returned
#[derive(Debug)]
pub enum TransportHandle {
    /// Connected TCP stream
    Tcp(TcpStream),
    /// UDP socket; connected to the peer when the remote address is known
    Udp(UdpSocket),
    /// TURN allocation with a permission for the peer
    Relay(TurnClient),
}

impl TransportHandle {
    /// Short transport label for logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Udp(_) => "udp",
            Self::Relay(_) => "relay",
        }
    }
}

/// Method-specific information about an established connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDetails {
    /// Local socket address
    pub local_addr: Option<SocketAddr>,
    /// Relayed transport address (TURN)
    pub relay_address: Option<SocketAddr>,
    /// Our public address as seen by a server or gateway
    pub external_address: Option<SocketAddr>,
    /// Measured round-trip time (ICE, UDP probes)
    pub round_trip: Option<Duration>,
    /// Gateway mapping kept open for this connection
    pub mapping: Option<PortMapping>,
}

/// A successfully established connection
#[derive(Debug)]
pub struct Connection {
    /// Method that produced the connection
    pub method: ConnectionMethod,
    /// The opened transport
    pub transport: TransportHandle,
    /// Negotiated remote address, if known
    pub remote: Option<SocketAddr>,
    /// Method-specific details
    pub details: ConnectionDetails,
}

impl Connection {
    /// Wrap a connected TCP stream
    #[must_use]
    pub fn tcp(method: ConnectionMethod, stream: TcpStream) -> Self {
        let details = ConnectionDetails {
            local_addr: stream.local_addr().ok(),
            ..ConnectionDetails::default()
        };
        Self {
            method,
            remote: stream.peer_addr().ok(),
            transport: TransportHandle::Tcp(stream),
            details,
        }
    }

    /// Wrap a UDP socket that exchanged traffic with `remote`
    #[must_use]
    pub fn udp(method: ConnectionMethod, socket: UdpSocket, remote: Option<SocketAddr>) -> Self {
        let details = ConnectionDetails {
            local_addr: socket.local_addr().ok(),
            ..ConnectionDetails::default()
        };
        Self {
            method,
            transport: TransportHandle::Udp(socket),
            remote,
            details,
        }
    }

    /// Wrap a TURN relay session
    #[must_use]
    pub fn relay(method: ConnectionMethod, client: TurnClient, remote: Option<SocketAddr>) -> Self {
        let details = ConnectionDetails {
            relay_address: client.relayed_address(),
            external_address: client.allocation().and_then(|a| a.mapped_address),
            ..ConnectionDetails::default()
        };
        Self {
            method,
            transport: TransportHandle::Relay(client),
            remote,
            details,
        }
    }

    /// Replace the details
    #[must_use]
    pub fn with_details(mut self, details: ConnectionDetails) -> Self {
        self.details = details;
        self
    }

    /// Record the measured round-trip time
    #[must_use]
    pub fn with_round_trip(mut self, rtt: Duration) -> Self {
        self.details.round_trip = Some(rtt);
        self
    }

    /// Record our public address
    #[must_use]
    pub fn with_external_address(mut self, addr: SocketAddr) -> Self {
        self.details.external_address = Some(addr);
        self
    }

    /// Take the TCP stream, if this is a TCP connection
    #[must_use]
    pub fn into_tcp(self) -> Option<TcpStream> {
        match self.transport {
            TransportHandle::Tcp(stream) => Some(stream),
            _ => None,
        }
    }

    /// Take the UDP socket, if this is a UDP connection
    #[must_use]
    pub fn into_udp(self) -> Option<UdpSocket> {
        match self.transport {
            TransportHandle::Udp(socket) => Some(socket),
            _ => None,
        }
    }
}
