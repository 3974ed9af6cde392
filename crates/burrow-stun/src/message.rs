//! STUN message header, method/class encoding and message codec (RFC 5389).

use std::net::SocketAddr;

use rand::RngCore;
use tracing::{trace, warn};

use crate::attribute::{ErrorCode, StunAttribute, padding_for};
use crate::auth::StunAuthentication;
use crate::error::StunError;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// 96-bit transaction identifier
pub type TransactionId = [u8; 12];

/// XOR constant applied to the FINGERPRINT CRC
const FINGERPRINT_XOR: u32 = 0x5354_554e;

/// MESSAGE-INTEGRITY attribute size on the wire (4 header + 20 HMAC)
const INTEGRITY_ATTR_SIZE: usize = 24;

/// FINGERPRINT attribute size on the wire (4 header + 4 CRC)
const FINGERPRINT_ATTR_SIZE: usize = 8;

/// STUN/TURN method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Binding (0x001)
    Binding,
    /// Allocate (0x003)
    Allocate,
    /// Refresh (0x004)
    Refresh,
    /// Send (0x006), indication only
    Send,
    /// Data (0x007), indication only
    Data,
    /// CreatePermission (0x008)
    CreatePermission,
    /// ChannelBind (0x009)
    ChannelBind,
}

impl Method {
    /// 12-bit method number
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
            Self::ChannelBind => 0x009,
        }
    }

    /// Method from its 12-bit number
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0x001 => Some(Self::Binding),
            0x003 => Some(Self::Allocate),
            0x004 => Some(Self::Refresh),
            0x006 => Some(Self::Send),
            0x007 => Some(Self::Data),
            0x008 => Some(Self::CreatePermission),
            0x009 => Some(Self::ChannelBind),
            _ => None,
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Request message
    Request,
    /// Indication (no response expected)
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

impl MessageClass {
    const fn bits(self) -> u16 {
        match self {
            Self::Request => 0b00,
            Self::Indication => 0b01,
            Self::SuccessResponse => 0b10,
            Self::ErrorResponse => 0b11,
        }
    }

    const fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Self::Request,
            0b01 => Self::Indication,
            0b10 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }

    /// Whether this is a success or error response
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::SuccessResponse | Self::ErrorResponse)
    }
}

/// Method and class pair carried in the 16-bit message type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    /// Method
    pub method: Method,
    /// Class
    pub class: MessageClass,
}

impl MessageType {
    /// Create a message type
    #[must_use]
    pub const fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    /// Encode method and class into a 16-bit value
    ///
    /// RFC 5389 Section 6 encoding:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    #[must_use]
    pub const fn encode(self) -> u16 {
        let method = self.method.code();
        let class_bits = self.class.bits();

        // Bits 0-3: M0-M3
        let m0_m3 = method & 0x0F;
        // Bit 4: C0
        let c0 = (class_bits & 0x01) << 4;
        // Bits 5-7: M4-M6
        let m4_m6 = (method & 0x70) << 1;
        // Bit 8: C1
        let c1 = (class_bits & 0x02) << 7;
        // Bits 9-13: M7-M11
        let m7_m11 = (method & 0xF80) << 2;

        m0_m3 | c0 | m4_m6 | c1 | m7_m11
    }

    /// Decode a 16-bit message type field
    ///
    /// # Errors
    ///
    /// Returns `StunError::InvalidMessageType` if the two most significant
    /// bits are set or the method is not supported.
    pub fn decode(value: u16) -> Result<Self, StunError> {
        if value & 0xC000 != 0 {
            return Err(StunError::InvalidMessageType);
        }

        let class_bits = ((value >> 4) & 0x01) | ((value >> 7) & 0x02);
        let method_code = (value & 0x000F) | ((value >> 1) & 0x0070) | ((value >> 2) & 0x0F80);

        let method = Method::from_code(method_code).ok_or(StunError::InvalidMessageType)?;
        Ok(Self {
            method,
            class: MessageClass::from_bits(class_bits),
        })
    }
}

/// Attribute padding mode
///
/// RFC 5389 pads every attribute value to a 4-byte boundary. Some deployed
/// peers emit attributes back to back without padding; `Unpadded` reproduces
/// that framing for interoperability. Decoding in either mode accepts a final
/// attribute whose padding is missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Padding {
    /// Pad each attribute value to a multiple of 4 bytes
    #[default]
    Rfc5389,
    /// No padding between attributes
    Unpadded,
}

impl Padding {
    const fn enabled(self) -> bool {
        matches!(self, Self::Rfc5389)
    }
}

/// STUN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Method and class
    pub message_type: MessageType,
    /// Transaction ID (96 bits)
    pub transaction_id: TransactionId,
    /// Message attributes, in wire order
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a message with a fresh random transaction id
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Create a request for `method`
    #[must_use]
    pub fn request(method: Method) -> Self {
        Self::new(MessageType::new(method, MessageClass::Request))
    }

    /// Create an indication for `method`
    #[must_use]
    pub fn indication(method: Method) -> Self {
        Self::new(MessageType::new(method, MessageClass::Indication))
    }

    /// Create a STUN Binding Request
    #[must_use]
    pub fn binding_request() -> Self {
        Self::request(Method::Binding)
    }

    /// Create a response of `class` answering this message
    ///
    /// The response reuses this message's method and transaction id.
    #[must_use]
    pub fn response(&self, class: MessageClass) -> Self {
        Self {
            message_type: MessageType::new(self.message_type.method, class),
            transaction_id: self.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Method of this message
    #[must_use]
    pub fn method(&self) -> Method {
        self.message_type.method
    }

    /// Class of this message
    #[must_use]
    pub fn class(&self) -> MessageClass {
        self.message_type.class
    }

    /// Add an attribute
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Builder form of [`StunMessage::add_attribute`]
    #[must_use]
    pub fn with_attribute(mut self, attr: StunAttribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Encode message to bytes with RFC 5389 padding
    ///
    /// A message whose attributes overflow the 16-bit length field encodes
    /// to an empty buffer; [`StunMessage::try_encode`] reports the error.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with(Padding::Rfc5389)
    }

    /// Encode message to bytes with the given padding mode
    ///
    /// See [`StunMessage::encode`] for oversized messages.
    #[must_use]
    pub fn encode_with(&self, padding: Padding) -> Vec<u8> {
        self.try_encode_with(padding).unwrap_or_else(|e| {
            warn!(error = %e, "Refusing to encode oversized STUN message");
            Vec::new()
        })
    }

    /// Encode message to bytes with RFC 5389 padding
    ///
    /// # Errors
    ///
    /// Returns `StunError::TooLarge` if an attribute value or the attribute
    /// section does not fit its 16-bit length field.
    pub fn try_encode(&self) -> Result<Vec<u8>, StunError> {
        self.try_encode_with(Padding::Rfc5389)
    }

    /// Encode message to bytes with the given padding mode
    ///
    /// # Errors
    ///
    /// See [`StunMessage::try_encode`].
    pub fn try_encode_with(&self, padding: Padding) -> Result<Vec<u8>, StunError> {
        self.encode_prefix(&self.attributes, 0, padding.enabled())
    }

    /// Header plus `attributes`, with `extra` bytes added to the length field
    fn encode_prefix(
        &self,
        attributes: &[StunAttribute],
        extra: usize,
        pad: bool,
    ) -> Result<Vec<u8>, StunError> {
        let mut body = Vec::new();
        for attr in attributes {
            body.extend(attr.encode(&self.transaction_id, pad)?);
        }
        let total = body.len() + extra;
        let len = u16::try_from(total).map_err(|_| StunError::TooLarge(total))?;

        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&self.message_type.encode().to_be_bytes());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode message from bytes, expecting RFC 5389 padding
    ///
    /// # Errors
    ///
    /// Returns `StunError` if the buffer is shorter than the header or the
    /// declared length, the magic cookie is wrong, or the message type is
    /// invalid. Malformed known attributes are skipped.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        Self::decode_with(bytes, Padding::Rfc5389)
    }

    /// Decode message from bytes with the given padding mode
    ///
    /// # Errors
    ///
    /// See [`StunMessage::decode`].
    pub fn decode_with(bytes: &[u8], padding: Padding) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let message_type = MessageType::decode(u16::from_be_bytes([bytes[0], bytes[1]]))?;
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let available = bytes.len() - HEADER_SIZE;
        if available < declared {
            return Err(StunError::Truncated {
                declared,
                available,
            });
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let end = HEADER_SIZE + declared;
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            offset += 4;

            if offset + attr_len > end {
                trace!(attr_type, attr_len, "STUN attribute overruns message, stopping");
                break;
            }

            let value = &bytes[offset..offset + attr_len];
            match StunAttribute::decode(attr_type, value, &transaction_id) {
                Ok(attr) => attributes.push(attr),
                Err(e) => {
                    trace!(attr_type, attr_len, error = %e, "Skipping malformed STUN attribute");
                }
            }

            offset += attr_len;
            if padding.enabled() {
                offset = (offset + padding_for(attr_len)).min(end);
            }
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// Whether `bytes` starts with a plausible STUN header
    #[must_use]
    pub fn is_stun(bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_SIZE
            && bytes[0] & 0xC0 == 0
            && u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) == MAGIC_COOKIE
    }

    fn find<T>(&self, pick: impl Fn(&StunAttribute) -> Option<T>) -> Option<T> {
        self.attributes.iter().find_map(pick)
    }

    /// XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    #[must_use]
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
        .or_else(|| self.mapped_address())
    }

    /// MAPPED-ADDRESS
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// XOR-RELAYED-ADDRESS
    #[must_use]
    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// XOR-PEER-ADDRESS
    #[must_use]
    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.find(|attr| match attr {
            StunAttribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// LIFETIME in seconds
    #[must_use]
    pub fn lifetime(&self) -> Option<u32> {
        self.find(|attr| match attr {
            StunAttribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    /// CHANNEL-NUMBER
    #[must_use]
    pub fn channel_number(&self) -> Option<u16> {
        self.find(|attr| match attr {
            StunAttribute::ChannelNumber(n) => Some(*n),
            _ => None,
        })
    }

    /// ERROR-CODE
    #[must_use]
    pub fn error_code(&self) -> Option<&ErrorCode> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ErrorCode(code) => Some(code),
            _ => None,
        })
    }

    /// REALM
    #[must_use]
    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Realm(realm) => Some(realm.as_str()),
            _ => None,
        })
    }

    /// NONCE
    #[must_use]
    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Nonce(nonce) => Some(nonce.as_str()),
            _ => None,
        })
    }

    /// DATA
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::Data(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    /// Add MESSAGE-INTEGRITY attribute
    ///
    /// Computes HMAC-SHA1 over the message up to (but not including) the
    /// MESSAGE-INTEGRITY attribute itself, with the length field covering
    /// it. Any existing MESSAGE-INTEGRITY or FINGERPRINT is replaced, so
    /// call [`StunMessage::add_fingerprint`] afterwards.
    ///
    /// # Errors
    ///
    /// Returns `StunError::AuthenticationFailed` if the HMAC cannot be keyed
    /// and `StunError::TooLarge` if the message cannot be encoded.
    ///
    /// # Examples
    ///
    /// ```
    /// use burrow_stun::{StunAuthentication, StunMessage};
    ///
    /// let mut msg = StunMessage::binding_request();
    /// let auth = StunAuthentication::new("user", "pass", None);
    /// msg.add_message_integrity(&auth).unwrap();
    /// assert!(msg.verify_message_integrity(&auth).is_ok());
    /// ```
    pub fn add_message_integrity(&mut self, auth: &StunAuthentication) -> Result<(), StunError> {
        self.attributes.retain(|attr| {
            !matches!(
                attr,
                StunAttribute::MessageIntegrity(_) | StunAttribute::Fingerprint(_)
            )
        });

        let bytes = self.encode_prefix(&self.attributes, INTEGRITY_ATTR_SIZE, true)?;
        let hmac = auth.sign(&bytes)?;
        self.attributes.push(StunAttribute::MessageIntegrity(hmac));
        Ok(())
    }

    /// Verify MESSAGE-INTEGRITY attribute
    ///
    /// # Errors
    ///
    /// Returns `StunError::MissingAttribute` if absent and
    /// `StunError::AuthenticationFailed` if the HMAC does not match.
    pub fn verify_message_integrity(&self, auth: &StunAuthentication) -> Result<(), StunError> {
        let (index, expected) = self
            .attributes
            .iter()
            .enumerate()
            .find_map(|(i, attr)| match attr {
                StunAttribute::MessageIntegrity(hmac) => Some((i, *hmac)),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute)?;

        let bytes = self.encode_prefix(&self.attributes[..index], INTEGRITY_ATTR_SIZE, true)?;
        auth.verify(&bytes, &expected)
    }

    /// Add FINGERPRINT attribute
    ///
    /// Computes CRC-32 over the message and XORs with 0x5354554e. Must be
    /// called after MESSAGE-INTEGRITY if both are used. An oversized message
    /// is left without a FINGERPRINT; encoding it fails regardless.
    pub fn add_fingerprint(&mut self) {
        self.attributes
            .retain(|attr| !matches!(attr, StunAttribute::Fingerprint(_)));

        match self.encode_prefix(&self.attributes, FINGERPRINT_ATTR_SIZE, true) {
            Ok(bytes) => self
                .attributes
                .push(StunAttribute::Fingerprint(crc32(&bytes) ^ FINGERPRINT_XOR)),
            Err(e) => trace!(error = %e, "Skipping FINGERPRINT on oversized message"),
        }
    }

    /// Verify FINGERPRINT attribute
    ///
    /// # Errors
    ///
    /// Returns error if FINGERPRINT is missing or invalid
    pub fn verify_fingerprint(&self) -> Result<(), StunError> {
        let (index, value) = self
            .attributes
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, attr)| match attr {
                StunAttribute::Fingerprint(fp) => Some((i, *fp)),
                _ => None,
            })
            .ok_or(StunError::MissingAttribute)?;

        let bytes = self.encode_prefix(&self.attributes[..index], FINGERPRINT_ATTR_SIZE, true)?;
        if crc32(&bytes) ^ FINGERPRINT_XOR == value {
            Ok(())
        } else {
            Err(StunError::FingerprintMismatch)
        }
    }
}

/// CRC-32 (ISO/IEEE 802.3, reflected polynomial 0xEDB88320)
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_encoding() {
        let cases = [
            (Method::Binding, MessageClass::Request, 0x0001),
            (Method::Binding, MessageClass::SuccessResponse, 0x0101),
            (Method::Allocate, MessageClass::Request, 0x0003),
            (Method::Allocate, MessageClass::SuccessResponse, 0x0103),
            (Method::Allocate, MessageClass::ErrorResponse, 0x0113),
            (Method::Refresh, MessageClass::Request, 0x0004),
            (Method::Send, MessageClass::Indication, 0x0016),
            (Method::Data, MessageClass::Indication, 0x0017),
            (Method::CreatePermission, MessageClass::Request, 0x0008),
            (Method::ChannelBind, MessageClass::SuccessResponse, 0x0109),
        ];

        for (method, class, expected) in cases {
            let message_type = MessageType::new(method, class);
            assert_eq!(message_type.encode(), expected, "{method:?} {class:?}");
            assert_eq!(MessageType::decode(expected).unwrap(), message_type);
        }
    }

    #[test]
    fn test_message_type_rejects_high_bits_and_unknown_methods() {
        assert!(MessageType::decode(0xC001).is_err());
        // Method 0x00A is not a STUN/TURN method we speak
        assert!(MessageType::decode(0x000A).is_err());
    }

    #[test]
    fn test_stun_message_roundtrip() {
        let msg = StunMessage::request(Method::Allocate)
            .with_attribute(StunAttribute::RequestedTransport(17))
            .with_attribute(StunAttribute::Lifetime(600))
            .with_attribute(StunAttribute::Username("alice".to_string()))
            .with_attribute(StunAttribute::Realm("example.org".to_string()));
        let encoded = msg.encode();

        assert_eq!(encoded.len() % 4, 0);
        let decoded = StunMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_oversized_messages_are_refused() {
        // A single value past 65535 bytes cannot carry its own length
        let huge = StunMessage::indication(Method::Send)
            .with_attribute(StunAttribute::Data(vec![0u8; 70_000]));
        assert!(matches!(huge.try_encode(), Err(StunError::TooLarge(70_000))));
        assert!(huge.encode().is_empty());

        // Each value fits, the attribute section does not
        let split = StunMessage::indication(Method::Send)
            .with_attribute(StunAttribute::Data(vec![0u8; 40_000]))
            .with_attribute(StunAttribute::Data(vec![0u8; 40_000]));
        assert!(matches!(split.try_encode(), Err(StunError::TooLarge(_))));

        // Largest attribute section that still fits
        let edge = StunMessage::indication(Method::Send)
            .with_attribute(StunAttribute::Data(vec![0u8; 65_528]));
        let bytes = edge.try_encode().unwrap();
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 65_532);
    }

    #[test]
    fn test_header_layout() {
        let msg = StunMessage::binding_request();
        let encoded = msg.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[0..2], &[0x00, 0x01]);
        assert_eq!(&encoded[2..4], &[0x00, 0x00]);
        assert_eq!(&encoded[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&encoded[8..20], &msg.transaction_id);
    }

    #[test]
    fn test_decode_error_too_short() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort)
        ));
    }

    #[test]
    fn test_decode_error_invalid_magic_cookie() {
        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0xFF;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidMagicCookie)
        ));
    }

    #[test]
    fn test_decode_error_truncated() {
        let msg = StunMessage::binding_request().with_attribute(StunAttribute::Lifetime(60));
        let bytes = msg.encode();
        assert!(matches!(
            StunMessage::decode(&bytes[..bytes.len() - 2]),
            Err(StunError::Truncated { declared: 8, available: 6 })
        ));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let msg = StunMessage::binding_request();
        let mut bytes = msg.encode();
        bytes.extend_from_slice(&[0xAB; 7]);
        assert_eq!(StunMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_unknown_attribute_ignored_by_accessors() {
        let msg = StunMessage::binding_request()
            .with_attribute(StunAttribute::Unknown(0x8055, vec![1, 2, 3]))
            .with_attribute(StunAttribute::Lifetime(300));
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.lifetime(), Some(300));
        assert_eq!(decoded.xor_mapped_address(), None);
    }

    #[test]
    fn test_malformed_known_attribute_is_skipped() {
        let mut msg = StunMessage::binding_request();
        // LIFETIME with a 2-byte value is malformed
        msg.add_attribute(StunAttribute::Unknown(0x000D, vec![0, 1]));
        msg.add_attribute(StunAttribute::Nonce("n".to_string()));

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.lifetime(), None);
        assert_eq!(decoded.nonce(), Some("n"));
        assert_eq!(decoded.attributes.len(), 1);
    }

    #[test]
    fn test_padding_modes_disagree_on_odd_lengths() {
        let msg = StunMessage::request(Method::Allocate)
            .with_attribute(StunAttribute::Username("bob".to_string()))
            .with_attribute(StunAttribute::Lifetime(600));

        let padded = msg.encode_with(Padding::Rfc5389);
        let unpadded = msg.encode_with(Padding::Unpadded);
        assert_eq!(padded.len(), HEADER_SIZE + 8 + 8);
        assert_eq!(unpadded.len(), HEADER_SIZE + 7 + 8);

        // Each mode reads its own framing
        assert_eq!(StunMessage::decode_with(&padded, Padding::Rfc5389).unwrap(), msg);
        assert_eq!(StunMessage::decode_with(&unpadded, Padding::Unpadded).unwrap(), msg);

        // Reading unpadded framing as RFC 5389 misaligns the next attribute
        let misread = StunMessage::decode_with(&unpadded, Padding::Rfc5389).unwrap();
        assert_ne!(misread, msg);
        assert_eq!(misread.lifetime(), None);
    }

    #[test]
    fn test_unpadded_final_attribute_tolerated() {
        let msg = StunMessage::binding_request()
            .with_attribute(StunAttribute::Software("abc".to_string()));
        let unpadded = msg.encode_with(Padding::Unpadded);
        assert_eq!(StunMessage::decode(&unpadded).unwrap(), msg);
    }

    #[test]
    fn test_response_keeps_transaction_id() {
        let request = StunMessage::request(Method::Refresh);
        let response = request.response(MessageClass::ErrorResponse);
        assert_eq!(response.transaction_id, request.transaction_id);
        assert_eq!(response.method(), Method::Refresh);
        assert_eq!(response.class(), MessageClass::ErrorResponse);
    }

    #[test]
    fn test_is_stun() {
        let bytes = StunMessage::binding_request().encode();
        assert!(StunMessage::is_stun(&bytes));
        assert!(!StunMessage::is_stun(&[0x40, 0x00, 0x00, 0x04, 1, 2, 3, 4]));
    }

    #[test]
    fn test_message_integrity_roundtrip() {
        let mut msg = StunMessage::binding_request();
        let auth = StunAuthentication::new("user", "pass", None);

        msg.add_message_integrity(&auth).unwrap();
        assert!(
            msg.attributes
                .iter()
                .any(|attr| matches!(attr, StunAttribute::MessageIntegrity(_)))
        );
        assert!(msg.verify_message_integrity(&auth).is_ok());

        // Survives the wire
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.verify_message_integrity(&auth).is_ok());
    }

    #[test]
    fn test_message_integrity_wrong_password() {
        let mut msg = StunMessage::binding_request();
        let auth1 = StunAuthentication::new("user", "pass1", None);
        let auth2 = StunAuthentication::new("user", "pass2", None);

        msg.add_message_integrity(&auth1).unwrap();
        assert!(matches!(
            msg.verify_message_integrity(&auth2),
            Err(StunError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_message_integrity_long_term_credentials() {
        let mut msg = StunMessage::request(Method::Allocate)
            .with_attribute(StunAttribute::Username("user".to_string()))
            .with_attribute(StunAttribute::Realm("realm".to_string()))
            .with_attribute(StunAttribute::Nonce("nonce".to_string()));
        let auth = StunAuthentication::new("user", "pass", Some("realm".to_string()));

        msg.add_message_integrity(&auth).unwrap();
        assert!(msg.verify_message_integrity(&auth).is_ok());

        let short_term = StunAuthentication::new("user", "pass", None);
        assert!(msg.verify_message_integrity(&short_term).is_err());
    }

    #[test]
    fn test_message_integrity_missing() {
        let msg = StunMessage::binding_request();
        let auth = StunAuthentication::new("user", "pass", None);
        assert!(matches!(
            msg.verify_message_integrity(&auth),
            Err(StunError::MissingAttribute)
        ));
    }

    #[test]
    fn test_fingerprint_roundtrip() {
        let mut msg = StunMessage::binding_request();
        msg.add_fingerprint();
        assert!(msg.verify_fingerprint().is_ok());

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.verify_fingerprint().is_ok());
    }

    #[test]
    fn test_fingerprint_tampered_message() {
        let mut msg = StunMessage::binding_request();
        msg.add_fingerprint();
        msg.transaction_id[0] ^= 0xFF;
        assert!(matches!(
            msg.verify_fingerprint(),
            Err(StunError::FingerprintMismatch)
        ));
    }

    #[test]
    fn test_message_integrity_and_fingerprint() {
        let mut msg = StunMessage::request(Method::Refresh)
            .with_attribute(StunAttribute::Lifetime(0));
        let auth = StunAuthentication::new("user", "pass", None);

        msg.add_message_integrity(&auth).unwrap();
        msg.add_fingerprint();

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert!(decoded.verify_message_integrity(&auth).is_ok());
        assert!(decoded.verify_fingerprint().is_ok());
    }

    #[test]
    fn test_crc32_check_value() {
        // Standard CRC-32 check value
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }
}
