//! Signaling channel contract.
//!
//! Peers exchange candidates, relay allocations and verification probes
//! over an external pub/sub primitive. Messages are JSON records:
//!
//! ```json
//! {"type":"candidates","payload":{...},"from":"alice","timestamp":1700000000000}
//! ```
//!
//! Delivery is at-least-once and unordered, so every inbox drops messages
//! older than a recency window, byte-identical duplicates, and messages the
//! local peer sent itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::method::ConnectionMethod;

/// Messages older than this are ignored
pub const DEFAULT_RECENCY: Duration = Duration::from_secs(30);

/// Messages kept per channel for late subscribers
const HISTORY_LIMIT: usize = 64;

/// Duplicate-detection memory per inbox
const SEEN_LIMIT: usize = 256;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    /// The channel is gone
    #[error("Signaling channel closed")]
    Closed,

    /// Underlying transport failure
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// Message could not be encoded
    #[error("Signaling encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Pub/sub primitive carrying raw JSON messages
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Publish `message` on `channel`
    async fn put(&self, channel: &str, message: String) -> Result<(), SignalingError>;

    /// Receive messages published on `channel`
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, SignalingError>;
}

/// ICE-style candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Local interface address
    Host,
    /// Public address learned from STUN
    Srflx,
    /// Address learned from a connectivity check
    Prflx,
    /// TURN relayed address
    Relay,
}

/// A transport address offered to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalCandidate {
    /// Candidate type
    pub kind: CandidateKind,
    /// Transport address
    pub address: SocketAddr,
    /// Pairing priority
    #[serde(default)]
    pub priority: u32,
}

/// Method-specific payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Candidate addresses for a method
    Candidates {
        /// Method the candidates are for
        method: ConnectionMethod,
        /// Offered addresses
        candidates: Vec<SignalCandidate>,
    },
    /// A TURN relayed address the peer should send to
    Allocation {
        /// Relayed transport address
        relay: SocketAddr,
    },
    /// The sender installed a TURN permission for this address
    Permission {
        /// Address the permission covers
        peer: SocketAddr,
    },
    /// Ask the peer to prove it controls an address
    VerifyRequest {
        /// Echoed in the response
        nonce: u64,
    },
    /// Answer to a verification request
    VerifyResponse {
        /// Nonce from the request
        nonce: u64,
    },
}

/// A signaling record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    /// Typed payload (`type` and `payload` keys)
    #[serde(flatten)]
    pub payload: SignalPayload,
    /// Sending peer id
    pub from: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl SignalMessage {
    /// Message from `from` stamped now
    pub fn new(from: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            payload,
            from: from.into(),
            timestamp: unix_millis(SystemTime::now()),
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Encode` if serialization fails.
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Milliseconds since the Unix epoch, saturating at zero
#[must_use]
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Channel name of a peer's inbox
#[must_use]
pub fn inbox_channel(peer_id: &str) -> String {
    format!("burrow/{peer_id}")
}

/// A signaling channel bound to the local peer
#[derive(Clone)]
pub struct Signaling {
    channel: Arc<dyn SignalingChannel>,
    local_id: String,
    recency: Duration,
}

impl Signaling {
    /// Bind `channel` to the local peer id
    pub fn new(channel: Arc<dyn SignalingChannel>, local_id: impl Into<String>) -> Self {
        Self {
            channel,
            local_id: local_id.into(),
            recency: DEFAULT_RECENCY,
        }
    }

    /// Override the recency window
    #[must_use]
    pub fn with_recency(mut self, recency: Duration) -> Self {
        self.recency = recency;
        self
    }

    /// Local peer id
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Send `payload` to `peer_id`'s inbox
    ///
    /// # Errors
    ///
    /// Returns a `SignalingError` if encoding or publishing fails.
    pub async fn send(&self, peer_id: &str, payload: SignalPayload) -> Result<(), SignalingError> {
        let message = SignalMessage::new(self.local_id.clone(), payload);
        trace!(to = %peer_id, message = ?message.payload, "Sending signal");
        self.channel
            .put(&inbox_channel(peer_id), message.to_json()?)
            .await
    }

    /// Subscribe to the local inbox
    ///
    /// Subscribe before sending an offer so the answer cannot be missed.
    ///
    /// # Errors
    ///
    /// Returns a `SignalingError` if subscribing fails.
    pub async fn inbox(&self) -> Result<SignalInbox, SignalingError> {
        let rx = self.channel.subscribe(&inbox_channel(&self.local_id)).await?;
        Ok(SignalInbox::new(rx, self.local_id.clone(), self.recency))
    }
}

impl std::fmt::Debug for Signaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaling")
            .field("local_id", &self.local_id)
            .field("recency", &self.recency)
            .finish_non_exhaustive()
    }
}

/// Filtered stream of incoming signals
pub struct SignalInbox {
    rx: mpsc::Receiver<String>,
    local_id: String,
    recency: Duration,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl SignalInbox {
    /// Wrap a raw subscription
    pub fn new(rx: mpsc::Receiver<String>, local_id: impl Into<String>, recency: Duration) -> Self {
        Self {
            rx,
            local_id: local_id.into(),
            recency,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Apply the inbox filters to one raw message received at `now_ms`
    pub fn accept(&mut self, raw: &str, now_ms: u64) -> Option<SignalMessage> {
        let message: SignalMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Dropping malformed signal");
                return None;
            }
        };

        if message.from == self.local_id {
            return None;
        }

        let age = now_ms.saturating_sub(message.timestamp);
        if u128::from(age) > self.recency.as_millis() {
            trace!(from = %message.from, age_ms = age, "Dropping stale signal");
            return None;
        }

        if !self.seen.insert(raw.to_string()) {
            trace!(from = %message.from, "Dropping duplicate signal");
            return None;
        }
        self.seen_order.push_back(raw.to_string());
        if self.seen_order.len() > SEEN_LIMIT {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        Some(message)
    }

    /// Next message passing the filters; `None` once the channel closes
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        while let Some(raw) = self.rx.recv().await {
            if let Some(message) = self.accept(&raw, unix_millis(SystemTime::now())) {
                return Some(message);
            }
        }
        None
    }

    /// Next payload from `from` that `select` maps to a value
    pub async fn recv_from<T>(
        &mut self,
        from: &str,
        mut select: impl FnMut(&SignalPayload) -> Option<T>,
    ) -> Option<T> {
        while let Some(message) = self.recv().await {
            if message.from != from {
                continue;
            }
            if let Some(value) = select(&message.payload) {
                return Some(value);
            }
        }
        None
    }
}

#[derive(Default)]
struct Topic {
    history: VecDeque<String>,
    subscribers: Vec<mpsc::Sender<String>>,
}

/// In-process signaling for tests and peers sharing a process
///
/// Each channel keeps a short history that is replayed to new
/// subscribers.
#[derive(Default)]
pub struct MemorySignaling {
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemorySignaling {
    /// Empty signaling hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn put(&self, channel: &str, message: String) -> Result<(), SignalingError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let topic = topics.entry(channel.to_string()).or_default();

        topic.history.push_back(message.clone());
        if topic.history.len() > HISTORY_LIMIT {
            topic.history.pop_front();
        }
        topic
            .subscribers
            .retain(|tx| tx.try_send(message.clone()).is_ok() || !tx.is_closed());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, SignalingError> {
        let (tx, rx) = mpsc::channel(HISTORY_LIMIT * 2);
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let topic = topics.entry(channel.to_string()).or_default();
        for message in &topic.history {
            let _ = tx.try_send(message.clone());
        }
        topic.subscribers.push(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for MemorySignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySignaling").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> SignalPayload {
        SignalPayload::Candidates {
            method: ConnectionMethod::UdpHolePunch,
            candidates: vec![SignalCandidate {
                kind: CandidateKind::Srflx,
                address: "203.0.113.5:40000".parse().unwrap(),
                priority: 0,
            }],
        }
    }

    #[test]
    fn test_wire_shape() {
        let message = SignalMessage {
            payload: SignalPayload::VerifyRequest { nonce: 7 },
            from: "alice".into(),
            timestamp: 1_700_000_000_000,
        };
        let value: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "verify-request");
        assert_eq!(value["payload"]["nonce"], 7);
        assert_eq!(value["from"], "alice");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);

        let parsed: SignalMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_inbox_filters() {
        let (_tx, rx) = mpsc::channel(1);
        let mut inbox = SignalInbox::new(rx, "bob", DEFAULT_RECENCY);
        let now = 1_700_000_100_000;

        let fresh = SignalMessage {
            payload: candidates(),
            from: "alice".into(),
            timestamp: now - 1_000,
        }
        .to_json()
        .unwrap();
        assert!(inbox.accept(&fresh, now).is_some());
        // Duplicate delivery
        assert!(inbox.accept(&fresh, now).is_none());

        let stale = SignalMessage {
            payload: candidates(),
            from: "alice".into(),
            timestamp: now - 30_001,
        }
        .to_json()
        .unwrap();
        assert!(inbox.accept(&stale, now).is_none());

        let own = SignalMessage {
            payload: candidates(),
            from: "bob".into(),
            timestamp: now,
        }
        .to_json()
        .unwrap();
        assert!(inbox.accept(&own, now).is_none());

        assert!(inbox.accept("{\"type\":\"nonsense\"}", now).is_none());
    }

    #[tokio::test]
    async fn test_memory_signaling_exchange() {
        let hub: Arc<dyn SignalingChannel> = Arc::new(MemorySignaling::new());
        let alice = Signaling::new(hub.clone(), "alice");
        let bob = Signaling::new(hub, "bob");

        // Sent before bob subscribes: replayed from history
        alice.send("bob", candidates()).await.unwrap();

        let mut inbox = bob.inbox().await.unwrap();
        let message = inbox.recv().await.unwrap();
        assert_eq!(message.from, "alice");
        assert_eq!(message.payload, candidates());

        alice
            .send("bob", SignalPayload::VerifyResponse { nonce: 9 })
            .await
            .unwrap();
        let nonce = inbox
            .recv_from("alice", |payload| match payload {
                SignalPayload::VerifyResponse { nonce } => Some(*nonce),
                _ => None,
            })
            .await;
        assert_eq!(nonce, Some(9));
    }
}
