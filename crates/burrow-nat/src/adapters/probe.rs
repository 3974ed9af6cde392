//! UDP reachability probes.
//!
//! A probe is answered with an ack. Receiving either from the peer proves
//! the path works in at least one direction, and the ack we send back for a
//! probe completes it in the other.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::trace;

/// Probe datagram
pub const PROBE_MARKER: &[u8] = b"BURROW_PROBE";
/// Ack datagram
pub const ACK_MARKER: &[u8] = b"BURROW_ACK";

/// Maximum probe rounds
pub const MAX_PROBE_ATTEMPTS: usize = 20;
/// Interval between probe rounds
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Answer from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    /// Address the answer came from
    pub from: SocketAddr,
    /// Time since the round that got the answer was sent
    pub round_trip: Duration,
    /// Whether the peer sent a probe (rather than an ack)
    pub was_probe: bool,
}

/// Probe rounds that fit into `budget`
#[must_use]
pub fn rounds_within(budget: Duration) -> usize {
    let rounds = budget.as_millis() / PROBE_INTERVAL.as_millis();
    usize::try_from(rounds)
        .unwrap_or(MAX_PROBE_ATTEMPTS)
        .clamp(1, MAX_PROBE_ATTEMPTS)
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

/// Probe `targets` for up to `rounds` rounds
///
/// Only datagrams from one of the target IPs count; the port may differ so
/// that a NAT picking a nearby port is still found. Returns `None` if no
/// target answered.
///
/// # Errors
///
/// Returns an I/O error if the socket fails.
pub async fn probe_exchange(
    socket: &UdpSocket,
    targets: &[SocketAddr],
    rounds: usize,
    interval: Duration,
) -> io::Result<Option<ProbeReply>> {
    let mut buf = [0u8; 1500];

    for round in 0..rounds {
        let sent = Instant::now();
        for target in targets {
            if let Err(e) = socket.send_to(PROBE_MARKER, target).await {
                trace!(%target, error = %e, "Probe send failed");
            }
        }

        let deadline = sent + interval;
        loop {
            let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_connection_error(&e) => {
                    sleep_until(deadline).await;
                    break;
                }
                Ok(Err(e)) => return Err(e),
            };

            if !targets.iter().any(|t| t.ip() == from.ip()) {
                trace!(%from, "Ignoring datagram from unexpected address");
                continue;
            }

            let datagram = &buf[..len];
            let was_probe = datagram == PROBE_MARKER;
            if was_probe {
                socket.send_to(ACK_MARKER, from).await?;
            } else if datagram != ACK_MARKER {
                trace!(%from, len, "Ignoring non-probe datagram");
                continue;
            }

            trace!(%from, round, was_probe, "Probe answered");
            return Ok(Some(ProbeReply {
                from,
                round_trip: sent.elapsed(),
                was_probe,
            }));
        }
    }

    Ok(None)
}

/// Wait for one probe and ack it
///
/// This is the listening side of a direct UDP attempt.
///
/// # Errors
///
/// Returns an I/O error if the socket fails.
pub async fn answer_probe(socket: &UdpSocket) -> io::Result<SocketAddr> {
    let mut buf = [0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if is_connection_error(&e) => continue,
            Err(e) => return Err(e),
        };
        if &buf[..len] == PROBE_MARKER {
            socket.send_to(ACK_MARKER, from).await?;
            return Ok(from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounds_within() {
        assert_eq!(rounds_within(Duration::from_millis(10)), 1);
        assert_eq!(rounds_within(Duration::from_millis(550)), 5);
        assert_eq!(rounds_within(Duration::from_secs(60)), MAX_PROBE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_probe_is_acked() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let server = tokio::spawn(async move { answer_probe(&responder).await.unwrap() });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = probe_exchange(&socket, &[responder_addr], 10, PROBE_INTERVAL)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.from, responder_addr);
        assert!(!reply.was_probe);
        assert_eq!(server.await.unwrap(), socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_both_sides_probing_meet() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let (to_b, to_a) = ([b_addr], [a_addr]);
        let (ra, rb) = tokio::join!(
            probe_exchange(&a, &to_b, 10, PROBE_INTERVAL),
            probe_exchange(&b, &to_a, 10, PROBE_INTERVAL),
        );
        assert_eq!(ra.unwrap().unwrap().from, b_addr);
        assert_eq!(rb.unwrap().unwrap().from, a_addr);
    }

    #[tokio::test]
    async fn test_silent_target_gives_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = probe_exchange(
            &socket,
            &[silent.local_addr().unwrap()],
            2,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_foreign_datagrams_ignored() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"hello", local).await.unwrap();

        // Same IP as the target but not a probe: ignored, then nothing else
        let reply = probe_exchange(
            &socket,
            &[stranger.local_addr().unwrap()],
            1,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(reply.is_none());
    }
}
