//! Socket construction shared by the adapters.
//!
//! Sockets are created through `socket2` so address/port reuse can be set
//! before binding, then handed to tokio.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};

/// Unspecified address of the family matching `remote`
#[must_use]
pub fn unspecified_for(remote: &SocketAddr, port: u16) -> SocketAddr {
    if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, port).into()
    }
}

fn reusable(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a UDP socket with address reuse
///
/// # Errors
///
/// Returns an I/O error if the socket cannot be created or bound.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = reusable(addr, Type::DGRAM, Protocol::UDP)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Bind a TCP socket with address and port reuse, ready to connect
///
/// Several of these may share one local port, which is what TCP hole
/// punching and simultaneous open need.
///
/// # Errors
///
/// Returns an I/O error if the socket cannot be created or bound.
pub fn bind_tcp(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = reusable(addr, Type::STREAM, Protocol::TCP)?;
    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpSocket::from_std_stream(std_stream))
}

/// Listen on `addr` with address and port reuse
///
/// # Errors
///
/// Returns an I/O error if the socket cannot be bound or listen fails.
pub fn listen_tcp(addr: SocketAddr) -> io::Result<TcpListener> {
    bind_tcp(addr)?.listen(128)
}

/// Local interface address used to reach `remote`
///
/// Connecting a UDP socket sends nothing; it only selects a route. Falls
/// back to loopback when no route exists.
#[must_use]
pub fn local_ip_toward(remote: IpAddr) -> IpAddr {
    let (bind, fallback): (SocketAddr, IpAddr) = match remote {
        IpAddr::V4(_) => ((Ipv4Addr::UNSPECIFIED, 0).into(), Ipv4Addr::LOCALHOST.into()),
        IpAddr::V6(_) => ((Ipv6Addr::UNSPECIFIED, 0).into(), Ipv6Addr::LOCALHOST.into()),
    };
    std::net::UdpSocket::bind(bind)
        .and_then(|socket| {
            socket.connect((remote, 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(fallback)
}

/// Local IPv4 address of the default route
#[must_use]
pub fn default_local_ipv4() -> IpAddr {
    local_ip_toward(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
}
