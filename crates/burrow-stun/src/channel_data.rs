//! TURN ChannelData framing (RFC 5766 Section 11.4).

use crate::attribute::padding_for;
use crate::error::StunError;
use crate::message::HEADER_SIZE;

/// Lowest valid channel number
pub const CHANNEL_MIN: u16 = 0x4000;

/// Highest valid channel number
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// ChannelData header size (channel number + length)
pub const CHANNEL_HEADER_SIZE: usize = 4;

/// Largest payload the 16-bit length field can describe
pub const MAX_CHANNEL_PAYLOAD: usize = u16::MAX as usize;

/// Application data relayed over a bound channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel number (0x4000-0x7FFF)
    pub channel: u16,
    /// Payload
    pub payload: Vec<u8>,
}

impl ChannelData {
    /// Create a ChannelData frame
    #[must_use]
    pub fn new(channel: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Encode the frame
    ///
    /// Over stream transports the frame must be padded to a multiple of four
    /// bytes; over UDP padding is optional and omitted.
    ///
    /// # Errors
    ///
    /// Returns `StunError::TooLarge` if the payload exceeds
    /// [`MAX_CHANNEL_PAYLOAD`].
    pub fn encode(&self, pad: bool) -> Result<Vec<u8>, StunError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| StunError::TooLarge(self.payload.len()))?;

        let mut bytes = Vec::with_capacity(CHANNEL_HEADER_SIZE + self.payload.len() + 3);
        bytes.extend_from_slice(&self.channel.to_be_bytes());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        if pad {
            bytes.extend(std::iter::repeat_n(0, padding_for(self.payload.len())));
        }
        Ok(bytes)
    }

    /// Decode a frame, ignoring trailing padding
    ///
    /// # Errors
    ///
    /// Returns `StunError::InvalidChannelData` if the channel number is out
    /// of range or the buffer is shorter than the declared length.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < CHANNEL_HEADER_SIZE {
            return Err(StunError::InvalidChannelData);
        }
        let channel = u16::from_be_bytes([bytes[0], bytes[1]]);
        if !is_valid_channel(channel) {
            return Err(StunError::InvalidChannelData);
        }
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let payload = bytes
            .get(CHANNEL_HEADER_SIZE..CHANNEL_HEADER_SIZE + len)
            .ok_or(StunError::InvalidChannelData)?;
        Ok(Self {
            channel,
            payload: payload.to_vec(),
        })
    }
}

/// Whether `channel` lies in the ChannelBind range
#[must_use]
pub const fn is_valid_channel(channel: u16) -> bool {
    channel >= CHANNEL_MIN && channel <= CHANNEL_MAX
}

/// Whether `bytes` starts with a ChannelData header
///
/// STUN messages start with `0b00`, ChannelData with `0b01`.
#[must_use]
pub fn is_channel_data(bytes: &[u8]) -> bool {
    bytes.len() >= CHANNEL_HEADER_SIZE && bytes[0] & 0xC0 == 0x40
}

/// Length of the next complete frame in a stream buffer
///
/// Returns `Ok(None)` until enough bytes have arrived to know the length.
/// ChannelData frames on streams always carry padding.
///
/// # Errors
///
/// Returns `StunError::InvalidMessageType` when the first byte starts neither
/// a STUN message nor a ChannelData frame.
pub fn stream_frame_len(buffer: &[u8]) -> Result<Option<usize>, StunError> {
    if buffer.len() < CHANNEL_HEADER_SIZE {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    match buffer[0] & 0xC0 {
        0x00 => Ok(Some(HEADER_SIZE + len)),
        0x40 => Ok(Some(CHANNEL_HEADER_SIZE + len + padding_for(len))),
        _ => Err(StunError::InvalidMessageType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StunMessage;

    #[test]
    fn test_channel_data_layout() {
        let frame = ChannelData::new(0x4001, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(frame.encode(false).unwrap(), vec![0x40, 0x01, 0x00, 0x03, 0xAA, 0xBB, 0xCC]);
        assert_eq!(
            frame.encode(true).unwrap(),
            vec![0x40, 0x01, 0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x00]
        );
    }

    #[test]
    fn test_channel_data_decode_ignores_padding() {
        let frame = ChannelData::new(0x7FFF, b"hello".to_vec());
        assert_eq!(ChannelData::decode(&frame.encode(true).unwrap()).unwrap(), frame);
        assert_eq!(ChannelData::decode(&frame.encode(false).unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_channel_data_rejects_bad_channel_and_truncation() {
        assert!(ChannelData::decode(&[0x3F, 0xFF, 0x00, 0x00]).is_err());
        assert!(ChannelData::decode(&[0x40, 0x00, 0x00, 0x08, 1, 2]).is_err());
        assert!(ChannelData::decode(&[0x40]).is_err());
    }

    #[test]
    fn test_channel_data_payload_limit() {
        let full = ChannelData::new(0x4000, vec![7u8; MAX_CHANNEL_PAYLOAD]);
        let bytes = full.encode(true).unwrap();
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(bytes.len(), CHANNEL_HEADER_SIZE + MAX_CHANNEL_PAYLOAD + 1);

        let over = ChannelData::new(0x4000, vec![7u8; MAX_CHANNEL_PAYLOAD + 1]);
        assert!(matches!(
            over.encode(true),
            Err(StunError::TooLarge(len)) if len == MAX_CHANNEL_PAYLOAD + 1
        ));
    }

    #[test]
    fn test_demultiplexing() {
        let stun = StunMessage::binding_request().encode();
        let channel = ChannelData::new(0x4000, vec![1]).encode(false).unwrap();
        assert!(!is_channel_data(&stun));
        assert!(is_channel_data(&channel));
    }

    #[test]
    fn test_stream_frame_len() {
        assert_eq!(stream_frame_len(&[0x40, 0x00]).unwrap(), None);
        assert_eq!(stream_frame_len(&[0x40, 0x00, 0x00, 0x05]).unwrap(), Some(12));
        assert_eq!(stream_frame_len(&[0x00, 0x03, 0x00, 0x08]).unwrap(), Some(28));
        assert!(stream_frame_len(&[0xC0, 0x00, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_channel_range() {
        assert!(is_valid_channel(CHANNEL_MIN));
        assert!(is_valid_channel(CHANNEL_MAX));
        assert!(!is_valid_channel(0x3FFF));
        assert!(!is_valid_channel(0x8000));
    }
}
