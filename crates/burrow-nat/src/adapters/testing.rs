//! Loopback fixtures for adapter tests.

use std::net::SocketAddr;
use std::sync::Arc;

use burrow_stun::{MessageClass, Method, StunAttribute, StunMessage};
use tokio::net::UdpSocket;

use crate::signaling::{MemorySignaling, Signaling};

/// STUN Binding responder on loopback, answering until dropped
pub(crate) async fn spawn_stun_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = StunMessage::decode(&buf[..len]) else {
                continue;
            };
            if request.method() != Method::Binding || request.class() != MessageClass::Request {
                continue;
            }
            let response = request
                .response(MessageClass::SuccessResponse)
                .with_attribute(StunAttribute::XorMappedAddress(from));
            let _ = socket.send_to(&response.encode(), from).await;
        }
    });
    addr
}

/// Two signaling endpoints sharing one in-memory channel
pub(crate) fn signaling_pair(a: &str, b: &str) -> (Signaling, Signaling) {
    let memory = Arc::new(MemorySignaling::new());
    (
        Signaling::new(memory.clone(), a),
        Signaling::new(memory, b),
    )
}
