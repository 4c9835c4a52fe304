use bytes::{BufMut, Bytes, BytesMut};

use crate::error::StunError;

/// Lowest valid channel number (RFC 5766 Section 11)
pub const CHANNEL_MIN: u16 = 0x4000;

/// Highest valid channel number
pub const CHANNEL_MAX: u16 = 0x7FFF;

/// ChannelData header: channel number + length
pub const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// Check a channel number against the 0x4000..=0x7FFF range
pub fn is_valid_channel(channel: u16) -> bool {
    (CHANNEL_MIN..=CHANNEL_MAX).contains(&channel)
}

/// ChannelData message (RFC 5766 Section 11.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: u16,
    pub payload: Bytes,
}

impl ChannelData {
    pub fn new(channel: u16, payload: impl Into<Bytes>) -> Self {
        Self { channel, payload: payload.into() }
    }

    /// Frame the payload, padding to a 4-byte boundary
    pub fn encode(&self) -> Result<Bytes, StunError> {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| StunError::MessageTooLarge(self.payload.len()))?;
        let pad = (4 - (self.payload.len() % 4)) % 4;

        let mut buf = BytesMut::with_capacity(CHANNEL_DATA_HEADER_SIZE + self.payload.len() + pad);
        buf.put_u16(self.channel);
        buf.put_u16(len);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, pad);
        Ok(buf.freeze())
    }

    /// Parse a ChannelData datagram. Trailing padding is tolerated.
    pub fn decode(raw: Bytes) -> Result<Self, StunError> {
        if raw.len() < CHANNEL_DATA_HEADER_SIZE {
            return Err(StunError::MalformedChannelData("shorter than header".into()));
        }

        let channel = u16::from_be_bytes([raw[0], raw[1]]);
        if !is_valid_channel(channel) {
            return Err(StunError::MalformedChannelData(format!(
                "channel {:#06x} out of range",
                channel
            )));
        }

        let len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        let available = raw.len() - CHANNEL_DATA_HEADER_SIZE;
        if len > available || available - len > 3 {
            return Err(StunError::MalformedChannelData(format!(
                "length {} does not fit {} bytes",
                len, available
            )));
        }

        Ok(Self {
            channel,
            payload: raw.slice(CHANNEL_DATA_HEADER_SIZE..CHANNEL_DATA_HEADER_SIZE + len),
        })
    }
}

/// What the first two bits of a datagram on the listen socket announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// 0b00: STUN message
    Stun,
    /// 0b01: ChannelData
    ChannelData,
    /// Anything else is not ours
    Unknown,
}

/// Demultiplex a datagram by its leading bits (RFC 7983 style)
pub fn classify(datagram: &[u8]) -> PacketKind {
    match datagram.first().map(|b| b >> 6) {
        Some(0b00) => PacketKind::Stun,
        Some(0b01) => PacketKind::ChannelData,
        _ => PacketKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_data_framing() {
        let frame = ChannelData::new(0x4000, Bytes::from_static(b"hello"));
        let encoded = frame.encode().unwrap();

        assert_eq!(&encoded[..4], &[0x40, 0x00, 0x00, 0x05]);
        assert_eq!(encoded.len(), 12);
        assert_eq!(ChannelData::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_channel_data_without_padding() {
        let raw = Bytes::from_static(&[0x7f, 0xff, 0x00, 0x01, 0xaa]);
        let frame = ChannelData::decode(raw).unwrap();
        assert_eq!(frame.channel, 0x7fff);
        assert_eq!(&frame.payload[..], &[0xaa]);
    }

    #[test]
    fn test_channel_data_rejects_bad_frames() {
        assert!(ChannelData::decode(Bytes::from_static(&[0x40, 0x00])).is_err());
        assert!(ChannelData::decode(Bytes::from_static(&[0x80, 0x00, 0x00, 0x00])).is_err());
        assert!(ChannelData::decode(Bytes::from_static(&[0x40, 0x00, 0x00, 0x08, 1, 2])).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[0x00, 0x03]), PacketKind::Stun);
        assert_eq!(classify(&[0x40, 0x00]), PacketKind::ChannelData);
        assert_eq!(classify(&[0x7f, 0xff]), PacketKind::ChannelData);
        assert_eq!(classify(&[0x80]), PacketKind::Unknown);
        assert_eq!(classify(&[]), PacketKind::Unknown);
    }

    #[test]
    fn test_channel_range() {
        assert!(!is_valid_channel(0x3fff));
        assert!(is_valid_channel(0x4000));
        assert!(is_valid_channel(0x7fff));
        assert!(!is_valid_channel(0x8000));
    }
}
