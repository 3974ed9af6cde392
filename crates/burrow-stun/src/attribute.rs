//! STUN and TURN attributes (RFC 5389 Section 15, RFC 5766 Section 14).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::StunError;
use crate::message::{MAGIC_COOKIE, TransactionId};

/// Attribute type codes
pub mod codes {
    /// MAPPED-ADDRESS
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    /// USERNAME
    pub const USERNAME: u16 = 0x0006;
    /// MESSAGE-INTEGRITY
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    /// ERROR-CODE
    pub const ERROR_CODE: u16 = 0x0009;
    /// CHANNEL-NUMBER
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    /// LIFETIME
    pub const LIFETIME: u16 = 0x000D;
    /// XOR-PEER-ADDRESS
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    /// DATA
    pub const DATA: u16 = 0x0013;
    /// REALM
    pub const REALM: u16 = 0x0014;
    /// NONCE
    pub const NONCE: u16 = 0x0015;
    /// XOR-RELAYED-ADDRESS
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    /// REQUESTED-TRANSPORT
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    /// XOR-MAPPED-ADDRESS
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    /// SOFTWARE
    pub const SOFTWARE: u16 = 0x8022;
    /// FINGERPRINT
    pub const FINGERPRINT: u16 = 0x8028;
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// ERROR-CODE attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    /// Numeric code (300-699)
    pub code: u16,
    /// Human readable reason phrase
    pub reason: String,
}

impl ErrorCode {
    /// 400 Bad Request
    pub const BAD_REQUEST: u16 = 400;
    /// 401 Unauthorized
    pub const UNAUTHORIZED: u16 = 401;
    /// 403 Forbidden
    pub const FORBIDDEN: u16 = 403;
    /// 437 Allocation Mismatch
    pub const ALLOCATION_MISMATCH: u16 = 437;
    /// 438 Stale Nonce
    pub const STALE_NONCE: u16 = 438;
    /// 441 Wrong Credentials
    pub const WRONG_CREDENTIALS: u16 = 441;
    /// 442 Unsupported Transport Protocol
    pub const UNSUPPORTED_TRANSPORT: u16 = 442;
    /// 486 Allocation Quota Reached
    pub const ALLOCATION_QUOTA_REACHED: u16 = 486;
    /// 508 Insufficient Capacity
    pub const INSUFFICIENT_CAPACITY: u16 = 508;

    /// Create an error code with its reason phrase
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// A decoded STUN/TURN attribute
///
/// Attribute kinds outside this set decode to [`StunAttribute::Unknown`] and
/// are ignored by the typed accessors on [`crate::StunMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// Mapped address (0x0001)
    MappedAddress(SocketAddr),
    /// XOR-Mapped address (0x0020)
    XorMappedAddress(SocketAddr),
    /// XOR-Relayed address (0x0016)
    XorRelayedAddress(SocketAddr),
    /// XOR-Peer address (0x0012)
    XorPeerAddress(SocketAddr),
    /// Username (0x0006)
    Username(String),
    /// Realm (0x0014)
    Realm(String),
    /// Nonce (0x0015)
    Nonce(String),
    /// Message integrity (0x0008), HMAC-SHA1
    MessageIntegrity([u8; 20]),
    /// Error code (0x0009)
    ErrorCode(ErrorCode),
    /// Allocation or permission lifetime in seconds (0x000D)
    Lifetime(u32),
    /// Channel number (0x000C)
    ChannelNumber(u16),
    /// Application data (0x0013)
    Data(Vec<u8>),
    /// Requested relay transport protocol number (0x0019)
    RequestedTransport(u8),
    /// Software identifier (0x8022)
    Software(String),
    /// Fingerprint (0x8028), CRC-32
    Fingerprint(u32),
    /// Unknown attribute type
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    /// Attribute type code
    #[must_use]
    pub fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => codes::MAPPED_ADDRESS,
            Self::XorMappedAddress(_) => codes::XOR_MAPPED_ADDRESS,
            Self::XorRelayedAddress(_) => codes::XOR_RELAYED_ADDRESS,
            Self::XorPeerAddress(_) => codes::XOR_PEER_ADDRESS,
            Self::Username(_) => codes::USERNAME,
            Self::Realm(_) => codes::REALM,
            Self::Nonce(_) => codes::NONCE,
            Self::MessageIntegrity(_) => codes::MESSAGE_INTEGRITY,
            Self::ErrorCode(_) => codes::ERROR_CODE,
            Self::Lifetime(_) => codes::LIFETIME,
            Self::ChannelNumber(_) => codes::CHANNEL_NUMBER,
            Self::Data(_) => codes::DATA,
            Self::RequestedTransport(_) => codes::REQUESTED_TRANSPORT,
            Self::Software(_) => codes::SOFTWARE,
            Self::Fingerprint(_) => codes::FINGERPRINT,
            Self::Unknown(t, _) => *t,
        }
    }

    /// Encode type, length, value and (optionally) padding
    ///
    /// Fails with `StunError::TooLarge` when the value exceeds 65535 bytes.
    pub(crate) fn encode(
        &self,
        transaction_id: &TransactionId,
        pad: bool,
    ) -> Result<Vec<u8>, StunError> {
        let value = self.encode_value(transaction_id);
        let len = u16::try_from(value.len()).map_err(|_| StunError::TooLarge(value.len()))?;

        let mut bytes = Vec::with_capacity(4 + value.len() + 3);
        bytes.extend_from_slice(&self.attr_type().to_be_bytes());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&value);

        if pad {
            bytes.extend(std::iter::repeat_n(0, padding_for(value.len())));
        }

        Ok(bytes)
    }

    fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Self::MappedAddress(addr) => encode_address(*addr),
            Self::XorMappedAddress(addr)
            | Self::XorRelayedAddress(addr)
            | Self::XorPeerAddress(addr) => encode_address(xor_address(*addr, transaction_id)),
            Self::Username(s) | Self::Realm(s) | Self::Nonce(s) | Self::Software(s) => {
                s.as_bytes().to_vec()
            }
            Self::MessageIntegrity(hmac) => hmac.to_vec(),
            Self::ErrorCode(err) => {
                let mut value = vec![0, 0, (err.code / 100) as u8, (err.code % 100) as u8];
                value.extend_from_slice(err.reason.as_bytes());
                value
            }
            Self::Lifetime(secs) => secs.to_be_bytes().to_vec(),
            Self::ChannelNumber(number) => {
                let mut value = number.to_be_bytes().to_vec();
                value.extend_from_slice(&[0, 0]); // RFFU
                value
            }
            Self::Data(data) => data.clone(),
            Self::RequestedTransport(protocol) => vec![*protocol, 0, 0, 0],
            Self::Fingerprint(f) => f.to_be_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Decode attribute from its type code and value bytes
    ///
    /// # Errors
    ///
    /// Returns `StunError::InvalidAttribute` if a known attribute has a
    /// malformed value.
    pub fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, StunError> {
        let attr = match attr_type {
            codes::MAPPED_ADDRESS => Self::MappedAddress(decode_address(value)?),
            codes::XOR_MAPPED_ADDRESS => {
                Self::XorMappedAddress(xor_address(decode_address(value)?, transaction_id))
            }
            codes::XOR_RELAYED_ADDRESS => {
                Self::XorRelayedAddress(xor_address(decode_address(value)?, transaction_id))
            }
            codes::XOR_PEER_ADDRESS => {
                Self::XorPeerAddress(xor_address(decode_address(value)?, transaction_id))
            }
            codes::USERNAME => Self::Username(decode_text(value)),
            codes::REALM => Self::Realm(decode_text(value)),
            codes::NONCE => Self::Nonce(decode_text(value)),
            codes::SOFTWARE => Self::Software(decode_text(value)),
            codes::MESSAGE_INTEGRITY => {
                let hmac: [u8; 20] = value.try_into().map_err(|_| StunError::InvalidAttribute)?;
                Self::MessageIntegrity(hmac)
            }
            codes::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute);
                }
                let class = u16::from(value[2] & 0x07);
                let number = u16::from(value[3]);
                if !(3..=6).contains(&class) || number > 99 {
                    return Err(StunError::InvalidAttribute);
                }
                Self::ErrorCode(ErrorCode {
                    code: class * 100 + number,
                    reason: decode_text(&value[4..]),
                })
            }
            codes::LIFETIME => Self::Lifetime(u32::from_be_bytes(
                value.try_into().map_err(|_| StunError::InvalidAttribute)?,
            )),
            codes::CHANNEL_NUMBER => {
                if value.len() != 4 {
                    return Err(StunError::InvalidAttribute);
                }
                Self::ChannelNumber(u16::from_be_bytes([value[0], value[1]]))
            }
            codes::DATA => Self::Data(value.to_vec()),
            codes::REQUESTED_TRANSPORT => {
                if value.len() != 4 {
                    return Err(StunError::InvalidAttribute);
                }
                Self::RequestedTransport(value[0])
            }
            codes::FINGERPRINT => Self::Fingerprint(u32::from_be_bytes(
                value.try_into().map_err(|_| StunError::InvalidAttribute)?,
            )),
            _ => Self::Unknown(attr_type, value.to_vec()),
        };
        Ok(attr)
    }
}

/// Bytes of padding that follow a value of `len` bytes
pub(crate) fn padding_for(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn decode_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).into_owned()
}

fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0); // Reserved
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

fn decode_address(value: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = match (value[1], value.len()) {
        (FAMILY_IPV4, 8) => {
            let octets: [u8; 4] = value[4..8]
                .try_into()
                .map_err(|_| StunError::InvalidAttribute)?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (FAMILY_IPV6, 20) => {
            let octets: [u8; 16] = value[4..20]
                .try_into()
                .map_err(|_| StunError::InvalidAttribute)?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// XOR an address with the magic cookie (and transaction id for IPv6)
///
/// The transform is its own inverse.
fn xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let ip = match addr.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            for (byte, key) in octets.iter_mut().zip(cookie) {
                *byte ^= key;
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            let key = cookie.iter().chain(transaction_id.iter());
            for (byte, key) in octets.iter_mut().zip(key) {
                *byte ^= key;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}
