//! NAT-PMP (RFC 6886) and PCP (RFC 6887) port mapping.
//!
//! Requests go to the default gateway on UDP port 5351 and are retransmitted
//! with a doubling timeout starting at 250ms. A gateway that only speaks
//! PCP answers NAT-PMP requests with "unsupported version"; the client then
//! switches to PCP MAP requests for the rest of its life.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, trace};

use super::{GatewayClient, GatewayError, MappingProtocol, PortMapping};
use crate::sockets::unspecified_for;

/// Gateway port for both protocols
pub const NATPMP_PORT: u16 = 5351;

const NATPMP_VERSION: u8 = 0;
const PCP_VERSION: u8 = 2;

const OP_EXTERNAL_ADDRESS: u8 = 0;
const OP_MAP_UDP: u8 = 1;
const OP_MAP_TCP: u8 = 2;
const OP_PCP_MAP: u8 = 1;
const RESPONSE_BIT: u8 = 0x80;

/// Result code shared by both protocols for "unsupported version"
const RESULT_UNSUPPORTED_VERSION: u16 = 1;

const PCP_HEADER_LEN: usize = 24;
const PCP_MAP_LEN: usize = PCP_HEADER_LEN + 36;

/// First retransmission timeout (RFC 6886 Section 3.1)
pub const INITIAL_RTO: Duration = Duration::from_millis(250);

/// Default number of transmissions before giving up
pub const DEFAULT_ATTEMPTS: u32 = 4;

/// Reason text for a NAT-PMP result code
#[must_use]
pub fn natpmp_result_reason(code: u16) -> &'static str {
    match code {
        0 => "success",
        1 => "unsupported version",
        2 => "not authorized or refused",
        3 => "network failure",
        4 => "out of resources",
        5 => "unsupported opcode",
        _ => "unknown result",
    }
}

/// Reason text for a PCP result code
#[must_use]
pub fn pcp_result_reason(code: u8) -> &'static str {
    match code {
        0 => "success",
        1 => "unsupported version",
        2 => "not authorized",
        3 => "malformed request",
        4 => "unsupported opcode",
        5 => "unsupported option",
        6 => "malformed option",
        7 => "network failure",
        8 => "no resources",
        9 => "unsupported protocol",
        10 => "user exceeded quota",
        11 => "cannot provide external",
        12 => "address mismatch",
        13 => "excessive remote peers",
        _ => "unknown result",
    }
}

fn map_opcode(protocol: MappingProtocol) -> u8 {
    match protocol {
        MappingProtocol::Udp => OP_MAP_UDP,
        MappingProtocol::Tcp => OP_MAP_TCP,
    }
}

fn protocol_number(protocol: MappingProtocol) -> u8 {
    match protocol {
        MappingProtocol::Udp => 17,
        MappingProtocol::Tcp => 6,
    }
}

/// NAT-PMP external address request
#[must_use]
pub fn encode_external_address_request() -> [u8; 2] {
    [NATPMP_VERSION, OP_EXTERNAL_ADDRESS]
}

/// Parse a NAT-PMP external address response
///
/// # Errors
///
/// Returns `GatewayError::Rejected` for a non-zero result code and
/// `GatewayError::Malformed` for anything that is not a 12-byte response.
pub fn decode_external_address_response(buf: &[u8]) -> Result<Ipv4Addr, GatewayError> {
    check_natpmp_header(buf, OP_EXTERNAL_ADDRESS, 12)?;
    Ok(Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]))
}

/// NAT-PMP mapping request; lifetime zero deletes
#[must_use]
pub fn encode_map_request(
    protocol: MappingProtocol,
    internal_port: u16,
    external_port: u16,
    lifetime_secs: u32,
) -> [u8; 12] {
    let mut request = [0u8; 12];
    request[0] = NATPMP_VERSION;
    request[1] = map_opcode(protocol);
    request[4..6].copy_from_slice(&internal_port.to_be_bytes());
    request[6..8].copy_from_slice(&external_port.to_be_bytes());
    request[8..12].copy_from_slice(&lifetime_secs.to_be_bytes());
    request
}

/// Mapping granted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResponse {
    /// Internal port echoed back
    pub internal_port: u16,
    /// External port assigned
    pub external_port: u16,
    /// Lifetime granted in seconds
    pub lifetime_secs: u32,
    /// External address (PCP only)
    pub external_ip: Option<IpAddr>,
}

/// Parse a NAT-PMP mapping response
///
/// # Errors
///
/// Returns `GatewayError::Rejected` for a non-zero result code and
/// `GatewayError::Malformed` for a short or mismatched response.
pub fn decode_map_response(
    buf: &[u8],
    protocol: MappingProtocol,
) -> Result<MapResponse, GatewayError> {
    check_natpmp_header(buf, map_opcode(protocol), 16)?;
    Ok(MapResponse {
        internal_port: u16::from_be_bytes([buf[8], buf[9]]),
        external_port: u16::from_be_bytes([buf[10], buf[11]]),
        lifetime_secs: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        external_ip: None,
    })
}

fn check_natpmp_header(buf: &[u8], opcode: u8, len: usize) -> Result<(), GatewayError> {
    if buf.len() < 4 {
        return Err(GatewayError::Malformed(format!(
            "{} byte NAT-PMP response",
            buf.len()
        )));
    }
    if buf[1] != RESPONSE_BIT | opcode {
        return Err(GatewayError::Malformed(format!(
            "unexpected NAT-PMP opcode {}",
            buf[1]
        )));
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    if code != 0 {
        return Err(GatewayError::Rejected {
            code,
            reason: natpmp_result_reason(code),
        });
    }
    if buf[0] != NATPMP_VERSION || buf.len() < len {
        return Err(GatewayError::Malformed(format!(
            "{} byte NAT-PMP response, version {}",
            buf.len(),
            buf[0]
        )));
    }
    Ok(())
}

fn to_mapped_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn from_mapped_v6(ip: Ipv6Addr) -> IpAddr {
    match ip.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ip),
    }
}

/// PCP MAP request (RFC 6887 Sections 7.1 and 11.1)
#[must_use]
pub fn encode_pcp_map_request(
    nonce: &[u8; 12],
    protocol: MappingProtocol,
    client_ip: IpAddr,
    internal_port: u16,
    external_port: u16,
    lifetime_secs: u32,
) -> [u8; PCP_MAP_LEN] {
    let mut request = [0u8; PCP_MAP_LEN];
    request[0] = PCP_VERSION;
    request[1] = OP_PCP_MAP;
    request[4..8].copy_from_slice(&lifetime_secs.to_be_bytes());
    request[8..24].copy_from_slice(&to_mapped_v6(client_ip).octets());

    let body = &mut request[PCP_HEADER_LEN..];
    body[..12].copy_from_slice(nonce);
    body[12] = protocol_number(protocol);
    body[16..18].copy_from_slice(&internal_port.to_be_bytes());
    body[18..20].copy_from_slice(&external_port.to_be_bytes());
    // Suggested external address: all zeros (no preference)
    body[20..36].copy_from_slice(&Ipv4Addr::UNSPECIFIED.to_ipv6_mapped().octets());
    request
}

/// Parse a PCP MAP response carrying `nonce`
///
/// # Errors
///
/// Returns `GatewayError::Rejected` for a non-zero result code and
/// `GatewayError::Malformed` for a short response or a nonce mismatch.
pub fn decode_pcp_map_response(buf: &[u8], nonce: &[u8; 12]) -> Result<MapResponse, GatewayError> {
    if buf.len() < 4 || buf[1] != RESPONSE_BIT | OP_PCP_MAP {
        return Err(GatewayError::Malformed("not a PCP MAP response".into()));
    }
    let code = buf[3];
    if code != 0 {
        return Err(GatewayError::Rejected {
            code: u16::from(code),
            reason: pcp_result_reason(code),
        });
    }
    if buf[0] != PCP_VERSION || buf.len() < PCP_MAP_LEN {
        return Err(GatewayError::Malformed(format!(
            "{} byte PCP response, version {}",
            buf.len(),
            buf[0]
        )));
    }

    let body = &buf[PCP_HEADER_LEN..];
    if body[..12] != nonce[..] {
        return Err(GatewayError::Malformed("PCP nonce mismatch".into()));
    }
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&body[20..36]);

    Ok(MapResponse {
        internal_port: u16::from_be_bytes([body[16], body[17]]),
        external_port: u16::from_be_bytes([body[18], body[19]]),
        lifetime_secs: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        external_ip: Some(from_mapped_v6(Ipv6Addr::from(ip))),
    })
}

/// Default IPv4 gateway from a `/proc/net/route` table
#[must_use]
pub fn parse_proc_net_route(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[1] == "00000000" {
            let gateway = u32::from_str_radix(fields[2], 16).ok()?;
            // The kernel prints the address in host byte order
            let ip = Ipv4Addr::from(gateway.to_ne_bytes());
            (!ip.is_unspecified()).then_some(ip)
        } else {
            None
        }
    })
}

/// Default IPv4 gateway of this host
#[must_use]
pub fn default_gateway() -> Option<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/net/route")
            .ok()
            .and_then(|table| parse_proc_net_route(&table))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// NAT-PMP client with PCP fallback
#[derive(Debug)]
pub struct NatPmpClient {
    gateway: SocketAddr,
    initial_rto: Duration,
    attempts: u32,
    use_pcp: AtomicBool,
    pcp_nonces: Mutex<HashMap<(MappingProtocol, u16), [u8; 12]>>,
    pcp_external: Mutex<Option<IpAddr>>,
}

impl NatPmpClient {
    /// Client for the gateway at `gateway` on port 5351
    #[must_use]
    pub fn new(gateway: IpAddr) -> Self {
        Self::with_address(SocketAddr::new(gateway, NATPMP_PORT))
    }

    /// Client for a gateway listening on an arbitrary address
    #[must_use]
    pub fn with_address(gateway: SocketAddr) -> Self {
        Self {
            gateway,
            initial_rto: INITIAL_RTO,
            attempts: DEFAULT_ATTEMPTS,
            use_pcp: AtomicBool::new(false),
            pcp_nonces: Mutex::new(HashMap::new()),
            pcp_external: Mutex::new(None),
        }
    }

    /// Client for the host's default gateway
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::NotFound` if no default route exists.
    pub fn discover() -> Result<Self, GatewayError> {
        let gateway = default_gateway().ok_or(GatewayError::NotFound)?;
        debug!(gateway = %gateway, "Using default gateway for NAT-PMP");
        Ok(Self::new(IpAddr::V4(gateway)))
    }

    /// Override retransmission timing
    #[must_use]
    pub fn with_retransmission(mut self, initial_rto: Duration, attempts: u32) -> Self {
        self.initial_rto = initial_rto;
        self.attempts = attempts.max(1);
        self
    }

    /// Gateway address
    #[must_use]
    pub fn gateway(&self) -> SocketAddr {
        self.gateway
    }

    /// Whether the gateway was found to speak PCP only
    #[must_use]
    pub fn uses_pcp(&self) -> bool {
        self.use_pcp.load(Ordering::Relaxed)
    }

    async fn open_socket(&self) -> Result<UdpSocket, GatewayError> {
        let socket = UdpSocket::bind(unspecified_for(&self.gateway, 0)).await?;
        socket.connect(self.gateway).await?;
        Ok(socket)
    }

    /// Send `request` and wait for a datagram that `parse` accepts
    ///
    /// `parse` returns `None` for datagrams that belong to some other
    /// exchange; those are ignored.
    async fn exchange<T>(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        parse: impl Fn(&[u8]) -> Option<Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let mut rto = self.initial_rto;
        let mut buf = [0u8; 1100];

        for attempt in 1..=self.attempts {
            trace!(gateway = %self.gateway, attempt, "Sending gateway request");
            socket.send(request).await?;

            let deadline = Instant::now() + rto;
            loop {
                match timeout_at(deadline, socket.recv(&mut buf)).await {
                    Err(_) => break,
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(len)) => {
                        if let Some(result) = parse(&buf[..len]) {
                            return result;
                        }
                    }
                }
            }
            rto *= 2;
        }
        Err(GatewayError::Timeout)
    }

    async fn natpmp_map(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<MapResponse, GatewayError> {
        let socket = self.open_socket().await?;
        let request = encode_map_request(protocol, internal_port, external_port, lifetime_secs);
        let opcode = RESPONSE_BIT | map_opcode(protocol);
        self.exchange(&socket, &request, |buf| {
            // PCP servers answer version 0 with a version 2 error header
            if buf.len() >= 4 && buf[0] == PCP_VERSION {
                return Some(Err(GatewayError::Rejected {
                    code: RESULT_UNSUPPORTED_VERSION,
                    reason: natpmp_result_reason(RESULT_UNSUPPORTED_VERSION),
                }));
            }
            (buf.len() >= 2 && buf[1] == opcode).then(|| decode_map_response(buf, protocol))
        })
        .await
    }

    async fn pcp_map(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<MapResponse, GatewayError> {
        let nonce = {
            let mut nonces = self.pcp_nonces.lock().unwrap_or_else(PoisonError::into_inner);
            *nonces
                .entry((protocol, internal_port))
                .or_insert_with(rand::random::<[u8; 12]>)
        };

        let socket = self.open_socket().await?;
        let client_ip = socket.local_addr()?.ip();
        let request = encode_pcp_map_request(
            &nonce,
            protocol,
            client_ip,
            internal_port,
            external_port,
            lifetime_secs,
        );
        let response = self
            .exchange(&socket, &request, |buf| {
                let ours = buf.len() >= PCP_MAP_LEN
                    && buf[1] == RESPONSE_BIT | OP_PCP_MAP
                    && buf[PCP_HEADER_LEN..PCP_HEADER_LEN + 12] == nonce[..];
                let error = buf.len() >= 4 && buf[1] == RESPONSE_BIT | OP_PCP_MAP && buf[3] != 0;
                (ours || error).then(|| decode_pcp_map_response(buf, &nonce))
            })
            .await?;

        if lifetime_secs == 0 {
            self.pcp_nonces
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(protocol, internal_port));
        } else if let Some(ip) = response.external_ip {
            *self
                .pcp_external
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(ip);
        }
        Ok(response)
    }

    async fn map(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
        external_port: u16,
        lifetime_secs: u32,
    ) -> Result<MapResponse, GatewayError> {
        if !self.uses_pcp() {
            match self
                .natpmp_map(protocol, internal_port, external_port, lifetime_secs)
                .await
            {
                Err(GatewayError::Rejected {
                    code: RESULT_UNSUPPORTED_VERSION,
                    ..
                }) => {
                    info!(gateway = %self.gateway, "Gateway does not speak NAT-PMP, switching to PCP");
                    self.use_pcp.store(true, Ordering::Relaxed);
                }
                other => return other,
            }
        }
        self.pcp_map(protocol, internal_port, external_port, lifetime_secs)
            .await
    }
}

#[async_trait]
impl GatewayClient for NatPmpClient {
    fn name(&self) -> &'static str {
        if self.uses_pcp() { "pcp" } else { "nat-pmp" }
    }

    async fn external_address(&self) -> Result<IpAddr, GatewayError> {
        if self.uses_pcp() {
            let cached = *self
                .pcp_external
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            return cached.ok_or_else(|| {
                GatewayError::Malformed("PCP reports the external address per mapping".into())
            });
        }

        let socket = self.open_socket().await?;
        let ip = self
            .exchange(&socket, &encode_external_address_request(), |buf| {
                (buf.len() >= 2 && buf[1] == RESPONSE_BIT | OP_EXTERNAL_ADDRESS)
                    .then(|| decode_external_address_response(buf))
            })
            .await?;
        Ok(IpAddr::V4(ip))
    }

    async fn add_mapping(
        &self,
        protocol: MappingProtocol,
        internal_port: u16,
        external_port: u16,
        lifetime: Duration,
    ) -> Result<PortMapping, GatewayError> {
        let lifetime_secs = u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX).max(1);
        let response = self
            .map(protocol, internal_port, external_port, lifetime_secs)
            .await?;

        let external_ip = match response.external_ip {
            Some(ip) => Some(ip),
            None => self.external_address().await.ok(),
        };

        debug!(
            gateway = self.name(),
            protocol = %protocol,
            internal_port,
            external_port = response.external_port,
            lifetime = response.lifetime_secs,
            "Port mapping created"
        );

        Ok(PortMapping {
            protocol,
            internal_port: response.internal_port,
            external_port: response.external_port,
            external_ip,
            lifetime: Duration::from_secs(u64::from(response.lifetime_secs)),
        })
    }

    async fn remove_mapping(&self, mapping: &PortMapping) -> Result<(), GatewayError> {
        // Deletion: lifetime 0 and, for NAT-PMP, external port 0
        let external = if self.uses_pcp() { mapping.external_port } else { 0 };
        self.map(mapping.protocol, mapping.internal_port, external, 0)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const ROUTE_TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0000A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0
";

    #[test]
    fn test_parse_route_table() {
        assert_eq!(
            parse_proc_net_route(ROUTE_TABLE),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(parse_proc_net_route("Iface\tDestination\tGateway\n"), None);
    }

    #[test]
    fn test_map_request_layout() {
        let request = encode_map_request(MappingProtocol::Tcp, 4000, 4001, 3600);
        assert_eq!(request[0], 0);
        assert_eq!(request[1], 2);
        assert_eq!(&request[2..4], &[0, 0]);
        assert_eq!(u16::from_be_bytes([request[4], request[5]]), 4000);
        assert_eq!(u16::from_be_bytes([request[6], request[7]]), 4001);
        assert_eq!(
            u32::from_be_bytes([request[8], request[9], request[10], request[11]]),
            3600
        );
        assert_eq!(encode_external_address_request(), [0, 0]);
    }

    #[test]
    fn test_decode_responses() {
        let response = [0, 128, 0, 0, 0, 0, 0, 7, 203, 0, 113, 9];
        assert_eq!(
            decode_external_address_response(&response).unwrap(),
            Ipv4Addr::new(203, 0, 113, 9)
        );

        let mut map = [0u8; 16];
        map[1] = 129;
        map[8..10].copy_from_slice(&4000u16.to_be_bytes());
        map[10..12].copy_from_slice(&40000u16.to_be_bytes());
        map[12..16].copy_from_slice(&7200u32.to_be_bytes());
        let parsed = decode_map_response(&map, MappingProtocol::Udp).unwrap();
        assert_eq!(parsed.internal_port, 4000);
        assert_eq!(parsed.external_port, 40000);
        assert_eq!(parsed.lifetime_secs, 7200);

        // Wrong opcode for TCP
        assert!(matches!(
            decode_map_response(&map, MappingProtocol::Tcp),
            Err(GatewayError::Malformed(_))
        ));

        let refused = [0, 129, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_map_response(&refused, MappingProtocol::Udp),
            Err(GatewayError::Rejected { code: 2, .. })
        ));

        assert!(decode_external_address_response(&[0, 128]).is_err());
    }

    #[test]
    fn test_pcp_map_layout() {
        let nonce = [7u8; 12];
        let client: IpAddr = "192.168.1.20".parse().unwrap();
        let request = encode_pcp_map_request(&nonce, MappingProtocol::Udp, client, 5000, 0, 600);

        assert_eq!(request.len(), 60);
        assert_eq!(request[0], 2);
        assert_eq!(request[1], 1);
        assert_eq!(u32::from_be_bytes([request[4], request[5], request[6], request[7]]), 600);
        assert_eq!(&request[8..24], &Ipv4Addr::new(192, 168, 1, 20).to_ipv6_mapped().octets());
        assert_eq!(&request[24..36], &nonce);
        assert_eq!(request[36], 17);
        assert_eq!(u16::from_be_bytes([request[40], request[41]]), 5000);
    }

    /// Build the PCP response a gateway would send for `request`
    fn pcp_answer(request: &[u8], external: Ipv4Addr, external_port: u16) -> Vec<u8> {
        let mut response = vec![0u8; PCP_MAP_LEN];
        response[0] = PCP_VERSION;
        response[1] = RESPONSE_BIT | OP_PCP_MAP;
        response[4..8].copy_from_slice(&request[4..8]);
        response[PCP_HEADER_LEN..PCP_HEADER_LEN + 20]
            .copy_from_slice(&request[PCP_HEADER_LEN..PCP_HEADER_LEN + 20]);
        response[PCP_HEADER_LEN + 18..PCP_HEADER_LEN + 20]
            .copy_from_slice(&external_port.to_be_bytes());
        response[PCP_HEADER_LEN + 20..].copy_from_slice(&external.to_ipv6_mapped().octets());
        response
    }

    #[test]
    fn test_pcp_response_roundtrip_and_nonce_check() {
        let nonce = [3u8; 12];
        let request = encode_pcp_map_request(
            &nonce,
            MappingProtocol::Tcp,
            "10.0.0.2".parse().unwrap(),
            7000,
            7000,
            120,
        );
        let response = pcp_answer(&request, Ipv4Addr::new(198, 51, 100, 4), 17000);

        let parsed = decode_pcp_map_response(&response, &nonce).unwrap();
        assert_eq!(parsed.internal_port, 7000);
        assert_eq!(parsed.external_port, 17000);
        assert_eq!(parsed.lifetime_secs, 120);
        assert_eq!(parsed.external_ip, Some("198.51.100.4".parse().unwrap()));

        assert!(decode_pcp_map_response(&response, &[4u8; 12]).is_err());
    }

    /// NAT-PMP gateway on loopback answering a fixed number of requests
    async fn spawn_natpmp_gateway(
        external: Ipv4Addr,
        drop_first: usize,
    ) -> (SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let mut count = 0usize;
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request = buf[..len].to_vec();
                log.lock().unwrap().push(request.clone());
                count += 1;
                if count <= drop_first {
                    continue;
                }

                let response = match request[1] {
                    0 => {
                        let mut r = vec![0, 128, 0, 0, 0, 0, 0, 1];
                        r.extend_from_slice(&external.octets());
                        r
                    }
                    op @ (1 | 2) => {
                        let mut r = vec![0, 128 | op, 0, 0, 0, 0, 0, 1];
                        r.extend_from_slice(&request[4..6]);
                        let asked = u16::from_be_bytes([request[6], request[7]]);
                        let port = if asked == 0 { 0 } else { asked + 10000 };
                        r.extend_from_slice(&port.to_be_bytes());
                        r.extend_from_slice(&request[8..12]);
                        r
                    }
                    _ => continue,
                };
                socket.send_to(&response, from).await.unwrap();
            }
        });

        (addr, seen)
    }

    #[tokio::test]
    async fn test_natpmp_map_and_delete() {
        let external = Ipv4Addr::new(203, 0, 113, 50);
        let (addr, seen) = spawn_natpmp_gateway(external, 0).await;
        let client = NatPmpClient::with_address(addr)
            .with_retransmission(Duration::from_millis(100), 3);

        assert_eq!(client.external_address().await.unwrap(), IpAddr::V4(external));

        let mapping = client
            .add_mapping(MappingProtocol::Tcp, 4000, 4000, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(mapping.external_port, 14000);
        assert_eq!(mapping.external_ip, Some(IpAddr::V4(external)));
        assert_eq!(mapping.lifetime, Duration::from_secs(3600));
        assert_eq!(client.name(), "nat-pmp");

        client.remove_mapping(&mapping).await.unwrap();
        let requests = seen.lock().unwrap();
        let delete = requests.last().unwrap();
        assert_eq!(delete[1], 2);
        assert_eq!(&delete[6..12], &[0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_natpmp_retransmits() {
        let (addr, seen) = spawn_natpmp_gateway(Ipv4Addr::new(203, 0, 113, 51), 2).await;
        let client = NatPmpClient::with_address(addr)
            .with_retransmission(Duration::from_millis(50), 4);

        assert!(client.external_address().await.is_ok());
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_natpmp_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = NatPmpClient::with_address(silent.local_addr().unwrap())
            .with_retransmission(Duration::from_millis(20), 2);

        assert!(matches!(
            client.external_address().await,
            Err(GatewayError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_pcp_fallback() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let external = Ipv4Addr::new(198, 51, 100, 77);

        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let request = &buf[..len];
                let response = if request[0] == NATPMP_VERSION {
                    // PCP-only server: version 2 header, UNSUPP_VERSION
                    let mut r = vec![0u8; PCP_HEADER_LEN];
                    r[0] = PCP_VERSION;
                    r[1] = RESPONSE_BIT | request[1];
                    r[3] = 1;
                    r
                } else {
                    pcp_answer(request, external, 25000)
                };
                socket.send_to(&response, from).await.unwrap();
            }
        });

        let client = NatPmpClient::with_address(addr)
            .with_retransmission(Duration::from_millis(100), 3);
        let mapping = client
            .add_mapping(MappingProtocol::Udp, 6000, 0, Duration::from_secs(600))
            .await
            .unwrap();

        assert!(client.uses_pcp());
        assert_eq!(client.name(), "pcp");
        assert_eq!(mapping.external_port, 25000);
        assert_eq!(mapping.external_ip, Some(IpAddr::V4(external)));
        assert_eq!(client.external_address().await.unwrap(), IpAddr::V4(external));

        client.remove_mapping(&mapping).await.unwrap();
    }
}
