//! Connection requests and their validation.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use burrow_stun::turn::TurnServer;
use serde::{Deserialize, Serialize};

use crate::config::TraversalConfig;
use crate::error::TraversalError;
use crate::method::ConnectionMethod;

/// Longest accepted peer identifier
pub const MAX_PEER_ID_LEN: usize = 128;

/// Longest accepted host name (RFC 1123)
const MAX_HOST_LEN: usize = 253;

/// Default per-method timeout
pub const DEFAULT_METHOD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default overall timeout
pub const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Host and port of a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// IP literal or DNS name
    pub host: String,
    /// Port
    pub port: u16,
}

impl PeerAddress {
    /// Create a peer address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host as an IP literal, if it is one
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .ok()
    }

    /// Resolve to the first socket address
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the name does not resolve.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} did not resolve", self.host),
                )
            })
    }

    /// Validate host and port format
    ///
    /// # Errors
    ///
    /// Returns `TraversalError::Validation` naming `field`.
    pub fn validate(&self, field: &'static str) -> Result<(), TraversalError> {
        if self.port == 0 {
            return Err(TraversalError::validation(field, "port must be non-zero"));
        }
        if self.ip().is_some() {
            return Ok(());
        }
        validate_host_name(&self.host).map_err(|reason| TraversalError::validation(field, reason))
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {s}"))?;
        let port = port.parse().map_err(|_| format!("invalid port in {s}"))?;
        Ok(Self::new(host, port))
    }
}

fn validate_host_name(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("host must not be empty".into());
    }
    if host.len() > MAX_HOST_LEN {
        return Err(format!("host longer than {MAX_HOST_LEN} characters"));
    }
    for label in host.trim_end_matches('.').split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(format!("{host} is neither an IP address nor a host name"));
        }
    }
    Ok(())
}

/// Transport the caller wants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Reliable stream
    #[default]
    Tcp,
    /// Datagrams
    Udp,
}

/// Parameters for one `connect` call
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// Opaque peer identifier
    pub peer_id: String,
    /// Peer address, when known up front
    pub target: Option<PeerAddress>,
    /// Local ports to try in order; empty means an ephemeral port
    pub local_ports: Vec<u16>,
    /// Transport preference
    pub transport: TransportPreference,
    /// Bound on each method attempt
    pub method_timeout: Duration,
    /// Bound on the whole call
    pub overall_timeout: Duration,
    /// Stop at the first failing method
    pub fail_fast: bool,
    /// Methods to try, in priority order
    pub methods: Vec<ConnectionMethod>,
    /// STUN servers for reflexive address discovery
    pub stun_servers: Vec<PeerAddress>,
    /// TURN servers for relaying
    pub turn_servers: Vec<TurnServer>,
}

impl ConnectionRequest {
    /// Request with default timeouts and method order
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            target: None,
            local_ports: Vec::new(),
            transport: TransportPreference::default(),
            method_timeout: DEFAULT_METHOD_TIMEOUT,
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            fail_fast: false,
            methods: ConnectionMethod::DEFAULT_ORDER.to_vec(),
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
        }
    }

    /// Build a request for `peer_id` from configuration
    pub fn from_config(config: &TraversalConfig, peer_id: impl Into<String>) -> Self {
        Self {
            method_timeout: config.method_timeout,
            overall_timeout: config.overall_timeout,
            fail_fast: config.fail_fast,
            methods: config.methods.clone(),
            local_ports: config.local_ports.clone(),
            transport: config.transport,
            stun_servers: config.stun_servers.clone(),
            turn_servers: config.turn_servers.clone(),
            ..Self::new(peer_id)
        }
    }

    /// Set the target address
    #[must_use]
    pub fn with_target(mut self, target: impl Into<PeerAddress>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Set candidate local ports
    #[must_use]
    pub fn with_local_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.local_ports = ports.into_iter().collect();
        self
    }

    /// Set the transport preference
    #[must_use]
    pub fn with_transport(mut self, transport: TransportPreference) -> Self {
        self.transport = transport;
        self
    }

    /// Set the methods to try
    #[must_use]
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = ConnectionMethod>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Set per-method and overall timeouts
    #[must_use]
    pub fn with_timeouts(mut self, method_timeout: Duration, overall_timeout: Duration) -> Self {
        self.method_timeout = method_timeout;
        self.overall_timeout = overall_timeout;
        self
    }

    /// Stop at the first failing method
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Add a STUN server
    #[must_use]
    pub fn with_stun_server(mut self, server: impl Into<PeerAddress>) -> Self {
        self.stun_servers.push(server.into());
        self
    }

    /// Add a TURN server
    #[must_use]
    pub fn with_turn_server(mut self, server: TurnServer) -> Self {
        self.turn_servers.push(server);
        self
    }

    /// Local ports to try; a single ephemeral port when none are configured
    #[must_use]
    pub fn candidate_ports(&self) -> Vec<u16> {
        if self.local_ports.is_empty() {
            vec![0]
        } else {
            self.local_ports.clone()
        }
    }

    /// Check every field before any socket is opened
    ///
    /// # Errors
    ///
    /// Returns `TraversalError::Validation` naming the first bad field.
    pub fn validate(&self) -> Result<(), TraversalError> {
        validate_peer_id(&self.peer_id)?;

        if let Some(target) = &self.target {
            target.validate("target")?;
        }

        let mut seen = HashSet::new();
        for port in &self.local_ports {
            if !seen.insert(*port) {
                return Err(TraversalError::validation(
                    "local_ports",
                    format!("port {port} listed twice"),
                ));
            }
        }

        if self.methods.is_empty() {
            return Err(TraversalError::validation("methods", "at least one method is required"));
        }
        let mut seen = HashSet::new();
        for method in &self.methods {
            if !seen.insert(*method) {
                return Err(TraversalError::validation(
                    "methods",
                    format!("{method} listed twice"),
                ));
            }
        }

        if self.method_timeout.is_zero() {
            return Err(TraversalError::validation("method_timeout", "must be non-zero"));
        }
        if self.overall_timeout.is_zero() {
            return Err(TraversalError::validation("overall_timeout", "must be non-zero"));
        }

        for server in &self.stun_servers {
            server.validate("stun_servers")?;
        }
        for server in &self.turn_servers {
            PeerAddress::new(server.host.clone(), server.port).validate("turn_servers")?;
        }

        Ok(())
    }
}

/// Check a peer identifier against the allowed charset and length
///
/// # Errors
///
/// Returns `TraversalError::Validation` for the `peer_id` field.
pub fn validate_peer_id(peer_id: &str) -> Result<(), TraversalError> {
    if peer_id.is_empty() {
        return Err(TraversalError::validation("peer_id", "must not be empty"));
    }
    if peer_id.len() > MAX_PEER_ID_LEN {
        return Err(TraversalError::validation(
            "peer_id",
            format!("longer than {MAX_PEER_ID_LEN} characters"),
        ));
    }
    if let Some(c) = peer_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(TraversalError::validation(
            "peer_id",
            format!("character {c:?} is not allowed"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(err: TraversalError) -> &'static str {
        match err {
            TraversalError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_request_is_valid() {
        let request = ConnectionRequest::new("peer-1.example_A");
        assert!(request.validate().is_ok());
        assert_eq!(request.methods, ConnectionMethod::DEFAULT_ORDER.to_vec());
        assert_eq!(request.candidate_ports(), vec![0]);
    }

    #[test]
    fn test_peer_id_rules() {
        assert!(validate_peer_id("alice").is_ok());
        assert!(validate_peer_id(&"a".repeat(MAX_PEER_ID_LEN)).is_ok());

        assert!(validate_peer_id("").is_err());
        assert!(validate_peer_id(&"a".repeat(MAX_PEER_ID_LEN + 1)).is_err());
        assert!(validate_peer_id("alice bob").is_err());
        assert!(validate_peer_id("alice/../bob").is_err());
        assert!(validate_peer_id("alice;rm").is_err());
        assert!(validate_peer_id("ålice").is_err());
    }

    #[test]
    fn test_target_validation() {
        let ok = ConnectionRequest::new("p").with_target(PeerAddress::new("peer.example.org", 4000));
        assert!(ok.validate().is_ok());

        let ok = ConnectionRequest::new("p").with_target(PeerAddress::new("2001:db8::1", 4000));
        assert!(ok.validate().is_ok());

        let zero = ConnectionRequest::new("p").with_target(PeerAddress::new("10.0.0.1", 0));
        assert_eq!(field(zero.validate().unwrap_err()), "target");

        let bad = ConnectionRequest::new("p").with_target(PeerAddress::new("bad host!", 80));
        assert_eq!(field(bad.validate().unwrap_err()), "target");

        let dash = ConnectionRequest::new("p").with_target(PeerAddress::new("-bad.example", 80));
        assert!(dash.validate().is_err());
    }

    #[test]
    fn test_list_validation() {
        let ports = ConnectionRequest::new("p").with_local_ports([4000, 4001, 4000]);
        assert_eq!(field(ports.validate().unwrap_err()), "local_ports");

        let methods = ConnectionRequest::new("p")
            .with_methods([ConnectionMethod::DirectTcp, ConnectionMethod::DirectTcp]);
        assert_eq!(field(methods.validate().unwrap_err()), "methods");

        let empty = ConnectionRequest::new("p").with_methods(Vec::new());
        assert_eq!(field(empty.validate().unwrap_err()), "methods");
    }

    #[test]
    fn test_timeout_validation() {
        let request =
            ConnectionRequest::new("p").with_timeouts(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(field(request.validate().unwrap_err()), "method_timeout");

        let request =
            ConnectionRequest::new("p").with_timeouts(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(field(request.validate().unwrap_err()), "overall_timeout");
    }

    #[test]
    fn test_server_validation() {
        let request = ConnectionRequest::new("p").with_stun_server(PeerAddress::new("", 3478));
        assert_eq!(field(request.validate().unwrap_err()), "stun_servers");

        let request = ConnectionRequest::new("p")
            .with_turn_server(TurnServer::new("turn.example.org", "u", "p").with_port(0));
        assert_eq!(field(request.validate().unwrap_err()), "turn_servers");
    }

    #[test]
    fn test_peer_address_parsing() {
        let addr: PeerAddress = "stun.example.org:3478".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("stun.example.org", 3478));

        let addr: PeerAddress = "[2001:db8::1]:5000".parse().unwrap();
        assert_eq!(addr.ip(), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(addr.to_string(), "[2001:db8::1]:5000");

        assert!("no-port".parse::<PeerAddress>().is_err());
        assert!("host:notaport".parse::<PeerAddress>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addr = PeerAddress::new("127.0.0.1", 9000).resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }
}
