//! STUN Binding client for server reflexive address discovery.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::StunError;
use crate::message::{MessageClass, Method, StunMessage};

/// Default STUN timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Send a Binding Request from `socket` and return the mapped address
///
/// Datagrams that are not the matching response (hole punching probes,
/// stale responses) are skipped until `timeout` elapses, so the socket can be
/// shared with other traffic.
///
/// # Errors
///
/// Returns `StunError` if:
/// - Network I/O fails
/// - STUN server doesn't respond within timeout
/// - Response is an error or missing XOR-MAPPED-ADDRESS
pub async fn query_mapped_address(
    socket: &UdpSocket,
    server: SocketAddr,
    timeout: Duration,
) -> Result<SocketAddr, StunError> {
    let request = StunMessage::binding_request();
    socket.send_to(&request.encode(), server).await?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1500];

    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| StunError::Timeout)??;

        let response = match StunMessage::decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                trace!(%from, error = %e, "Ignoring non-STUN datagram");
                continue;
            }
        };

        if response.transaction_id != request.transaction_id
            || response.method() != Method::Binding
        {
            trace!(%from, "Ignoring unrelated STUN message");
            continue;
        }

        if response.class() != MessageClass::SuccessResponse {
            debug!(%server, error = ?response.error_code(), "Binding request rejected");
            return Err(StunError::ErrorResponse);
        }

        return response
            .xor_mapped_address()
            .ok_or(StunError::MissingAttribute);
    }
}

/// STUN client owning its socket
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    /// Bind a new STUN client to a local address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn bind(addr: &str) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    /// Wrap an existing socket
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set query timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Get local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Get mapped address from STUN server
    ///
    /// # Errors
    ///
    /// See [`query_mapped_address`].
    pub async fn get_mapped_address(&self, server: SocketAddr) -> Result<SocketAddr, StunError> {
        query_mapped_address(&self.socket, server, self.timeout).await
    }

    /// Release the socket, keeping the NAT binding it created
    #[must_use]
    pub fn into_socket(self) -> UdpSocket {
        self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::StunAttribute;

    async fn spawn_binding_server(reply_garbage_first: bool) -> SocketAddr {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();

            if reply_garbage_first {
                server.send_to(b"not-a-stun-message", from).await.unwrap();
                let stray = StunMessage::binding_request()
                    .response(MessageClass::SuccessResponse)
                    .with_attribute(StunAttribute::XorMappedAddress(
                        "198.51.100.1:1".parse().unwrap(),
                    ));
                server.send_to(&stray.encode(), from).await.unwrap();
            }

            let response = request
                .response(MessageClass::SuccessResponse)
                .with_attribute(StunAttribute::XorMappedAddress(from));
            server.send_to(&response.encode(), from).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn test_get_mapped_address() {
        let server = spawn_binding_server(false).await;
        let client = StunClient::bind("127.0.0.1:0").await.unwrap();

        let mapped = client.get_mapped_address(server).await.unwrap();
        assert_eq!(mapped, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_unrelated_datagrams_are_skipped() {
        let server = spawn_binding_server(true).await;
        let client = StunClient::bind("127.0.0.1:0").await.unwrap();

        let mapped = client.get_mapped_address(server).await.unwrap();
        assert_eq!(mapped, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_timeout_when_server_silent() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = StunClient::bind("127.0.0.1:0").await.unwrap();
        client.set_timeout(Duration::from_millis(100));

        let result = client
            .get_mapped_address(silent.local_addr().unwrap())
            .await;
        assert!(matches!(result, Err(StunError::Timeout)));
    }
}
