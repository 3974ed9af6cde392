//! Shared fixtures for Burrow integration tests
//!
//! Provides in-process STUN and TURN servers bound to loopback so whole
//! traversal flows can run without external infrastructure.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use burrow_stun::{
    ErrorCode, MessageClass, Method, StunAttribute, StunAuthentication, StunMessage,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Address relays are reported on; the port mirrors the client's port
pub const RELAY_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 20));

/// Realm announced by the credentialed mock
pub const REALM: &str = "burrow.test";

const NONCE: &str = "f00dcafe";

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A request seen by [`MockTurnServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// STUN method
    pub method: Method,
    /// Carried MESSAGE-INTEGRITY
    pub authenticated: bool,
    /// XOR-PEER-ADDRESS, if any
    pub peer: Option<SocketAddr>,
}

/// Loopback TURN server accepting Allocate, Refresh and CreatePermission
///
/// With credentials, unauthenticated requests are challenged with 401 and
/// authenticated ones are checked against the long-term key.
pub struct MockTurnServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl MockTurnServer {
    /// Server that accepts every request
    pub async fn open() -> Self {
        Self::spawn(None).await
    }

    /// Server requiring long-term credentials in [`REALM`]
    pub async fn with_credentials(username: &str, password: &str) -> Self {
        Self::spawn(Some(StunAuthentication::new(
            username,
            password,
            Some(REALM.to_string()),
        )))
        .await
    }

    async fn spawn(auth: Option<StunAuthentication>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);

        let task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
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

                let authenticated = request
                    .attributes
                    .iter()
                    .any(|a| matches!(a, StunAttribute::MessageIntegrity(_)));
                log.lock().unwrap().push(RecordedRequest {
                    method: request.method(),
                    authenticated,
                    peer: request.xor_peer_address(),
                });

                let response = match &auth {
                    Some(_) if !authenticated => request
                        .response(MessageClass::ErrorResponse)
                        .with_attribute(StunAttribute::ErrorCode(ErrorCode::new(
                            ErrorCode::UNAUTHORIZED,
                            "Unauthorized",
                        )))
                        .with_attribute(StunAttribute::Realm(REALM.to_string()))
                        .with_attribute(StunAttribute::Nonce(NONCE.to_string())),
                    Some(auth) if request.verify_message_integrity(auth).is_err() => request
                        .response(MessageClass::ErrorResponse)
                        .with_attribute(StunAttribute::ErrorCode(ErrorCode::new(
                            ErrorCode::UNAUTHORIZED,
                            "Unauthorized",
                        ))),
                    _ => success(&request, from),
                };
                let _ = socket.send_to(&response.encode(), from).await;
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    /// Server address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Relay address the server hands to `client`
    pub fn relay_for(client: SocketAddr) -> SocketAddr {
        SocketAddr::new(RELAY_IP, client.port())
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockTurnServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn success(request: &StunMessage, from: SocketAddr) -> StunMessage {
    let response = request.response(MessageClass::SuccessResponse);
    match request.method() {
        Method::Allocate => response
            .with_attribute(StunAttribute::XorRelayedAddress(MockTurnServer::relay_for(
                from,
            )))
            .with_attribute(StunAttribute::XorMappedAddress(from))
            .with_attribute(StunAttribute::Lifetime(600)),
        Method::Refresh => response.with_attribute(StunAttribute::Lifetime(
            request.lifetime().unwrap_or(600),
        )),
        _ => response,
    }
}

/// Loopback STUN Binding responder, answering until the task is aborted
pub async fn spawn_stun_responder() -> (SocketAddr, JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            if request.method() == Method::Binding && request.class() == MessageClass::Request {
                let response = request
                    .response(MessageClass::SuccessResponse)
                    .with_attribute(StunAttribute::XorMappedAddress(from));
                let _ = socket.send_to(&response.encode(), from).await;
            }
        }
    });
    (addr, task)
}
