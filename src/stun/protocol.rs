use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::error::StunError;

/// STUN magic cookie (RFC 5389 Section 6)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Largest datagram the server will read
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// MESSAGE-INTEGRITY value length (HMAC-SHA1)
pub const INTEGRITY_SIZE: usize = 20;

const FINGERPRINT_XOR: u32 = 0x5354554E;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// TURN/STUN methods handled by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Method {
    Binding = 0x001,
    Allocate = 0x003,
    Refresh = 0x004,
    Send = 0x006,
    Data = 0x007,
    CreatePermission = 0x008,
    ChannelBind = 0x009,
}

impl Method {
    /// Map a 12-bit method number to a known method
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
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
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::SuccessResponse => 0x0100,
            Self::ErrorResponse => 0x0110,
        }
    }

    fn from_bits(value: u16) -> Self {
        match value & 0x0110 {
            0x0000 => Self::Request,
            0x0010 => Self::Indication,
            0x0100 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

/// Method and class pair carried in the 14-bit type field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub const fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    /// Wire value with method bits interleaved around the class bits (RFC 5389 Section 6)
    pub fn value(&self) -> u16 {
        let method = self.method as u16;
        let m0 = method & 0x000F;
        let m1 = (method & 0x0070) << 1;
        let m2 = (method & 0x0F80) << 2;
        m0 | m1 | m2 | self.class.bits()
    }

    /// Parse a wire type value
    pub fn from_value(value: u16) -> Result<Self, StunError> {
        let method = (value & 0x000F) | ((value & 0x00E0) >> 1) | ((value & 0x3E00) >> 2);
        let method = Method::from_u16(method).ok_or(StunError::UnknownMessageType(value))?;
        Ok(Self::new(method, MessageClass::from_bits(value)))
    }

    /// Success response type for this request
    pub fn success(&self) -> Self {
        Self::new(self.method, MessageClass::SuccessResponse)
    }

    /// Error response type for this request
    pub fn error(&self) -> Self {
        Self::new(self.method, MessageClass::ErrorResponse)
    }
}

/// STUN/TURN attribute types understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttributeType {
    // Comprehension-required (0x0000-0x7FFF)
    MappedAddress = 0x0001,
    Username = 0x0006,
    MessageIntegrity = 0x0008,
    ErrorCode = 0x0009,
    UnknownAttributes = 0x000A,
    ChannelNumber = 0x000C,
    Lifetime = 0x000D,
    XorPeerAddress = 0x0012,
    Data = 0x0013,
    Realm = 0x0014,
    Nonce = 0x0015,
    XorRelayedAddress = 0x0016,
    RequestedTransport = 0x0019,
    DontFragment = 0x001A,
    XorMappedAddress = 0x0020,

    // Comprehension-optional (0x8000-0xFFFF)
    Software = 0x8022,
    AlternateServer = 0x8023,
    Fingerprint = 0x8028,
}

impl AttributeType {
    /// Map a wire code to a known attribute type
    pub fn from_u16(value: u16) -> Option<Self> {
        let attr_type = match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x000C => Self::ChannelNumber,
            0x000D => Self::Lifetime,
            0x0012 => Self::XorPeerAddress,
            0x0013 => Self::Data,
            0x0014 => Self::Realm,
            0x0015 => Self::Nonce,
            0x0016 => Self::XorRelayedAddress,
            0x0019 => Self::RequestedTransport,
            0x001A => Self::DontFragment,
            0x0020 => Self::XorMappedAddress,
            0x8022 => Self::Software,
            0x8023 => Self::AlternateServer,
            0x8028 => Self::Fingerprint,
            _ => return None,
        };
        Some(attr_type)
    }

    /// Check if attribute is comprehension-required
    pub fn is_comprehension_required(&self) -> bool {
        (*self as u16) < 0x8000
    }

    fn is_xor_address(&self) -> bool {
        matches!(
            self,
            Self::XorMappedAddress | Self::XorPeerAddress | Self::XorRelayedAddress
        )
    }
}

/// STUN transaction ID (96 bits)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate new random transaction ID
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(self.0))
    }
}

/// Decoded STUN/TURN message. Attribute order is wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl Message {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Add attribute to message
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Builder-style variant of [`Message::add_attribute`]
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// First attribute of a type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// All attributes of a type, in wire order
    pub fn get_attributes(&self, attr_type: AttributeType) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.attr_type == attr_type)
    }

    pub fn has_attribute(&self, attr_type: AttributeType) -> bool {
        self.get_attribute(attr_type).is_some()
    }

    pub fn username(&self) -> Option<&str> {
        match &self.get_attribute(AttributeType::Username)?.value {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn realm(&self) -> Option<&str> {
        match &self.get_attribute(AttributeType::Realm)?.value {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn nonce(&self) -> Option<&[u8]> {
        match &self.get_attribute(AttributeType::Nonce)?.value {
            AttributeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn lifetime(&self) -> Option<u32> {
        match self.get_attribute(AttributeType::Lifetime)?.value {
            AttributeValue::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn channel_number(&self) -> Option<u16> {
        match self.get_attribute(AttributeType::ChannelNumber)?.value {
            AttributeValue::ChannelNumber(v) => Some(v),
            _ => None,
        }
    }

    pub fn requested_transport(&self) -> Option<u8> {
        match self.get_attribute(AttributeType::RequestedTransport)?.value {
            AttributeValue::Transport(v) => Some(v),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.get_attribute(AttributeType::Data)?.value {
            AttributeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// First address attribute of a type
    pub fn address(&self, attr_type: AttributeType) -> Option<SocketAddr> {
        match self.get_attribute(attr_type)?.value {
            AttributeValue::Address(addr) => Some(addr),
            _ => None,
        }
    }

    /// Every XOR-PEER-ADDRESS in the message
    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.get_attributes(AttributeType::XorPeerAddress)
            .filter_map(|a| match a.value {
                AttributeValue::Address(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        match &self.get_attribute(AttributeType::ErrorCode)?.value {
            AttributeValue::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        }
    }

    /// Encode message to bytes.
    ///
    /// Attributes are written in insertion order. With `integrity_key` a
    /// MESSAGE-INTEGRITY is appended, then FINGERPRINT if requested.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Result<Bytes, StunError> {
        self.encode_as(self.message_type.value(), integrity_key, fingerprint)
    }

    /// Encode under an explicit wire type value instead of `message_type`.
    /// Used to answer requests whose method has no `Method` variant.
    pub fn encode_as(
        &self,
        type_value: u16,
        integrity_key: Option<&[u8]>,
        fingerprint: bool,
    ) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_u16(type_value & 0x3FFF);
        buf.put_u16(0); // Message length (patched below)
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            attr.encode(&mut buf, &self.transaction_id)?;
        }

        if let Some(key) = integrity_key {
            // Length must already cover the integrity attribute
            let len = buf.len() - HEADER_SIZE + 4 + INTEGRITY_SIZE;
            set_length(&mut buf, len)?;

            let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::InvalidKey)?;
            mac.update(&buf);
            let digest = mac.finalize().into_bytes();

            buf.put_u16(AttributeType::MessageIntegrity as u16);
            buf.put_u16(INTEGRITY_SIZE as u16);
            buf.put_slice(&digest);
        }

        if fingerprint {
            let len = buf.len() - HEADER_SIZE + 8;
            set_length(&mut buf, len)?;
            let checksum = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;

            buf.put_u16(AttributeType::Fingerprint as u16);
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        let len = buf.len() - HEADER_SIZE;
        set_length(&mut buf, len)?;
        Ok(buf.freeze())
    }

    /// Decode message from bytes.
    ///
    /// Verifies FINGERPRINT when present. Attributes following
    /// MESSAGE-INTEGRITY, other than FINGERPRINT, are ignored.
    /// MESSAGE-INTEGRITY itself is kept as a raw attribute for the
    /// authenticator to check.
    pub fn decode(raw: Bytes) -> Result<Self, StunError> {
        let header = MessageHeader::peek(&raw)?;
        if header.length % 4 != 0 || HEADER_SIZE + header.length != raw.len() {
            return Err(StunError::MalformedHeader(format!(
                "length field {} does not match datagram of {} bytes",
                header.length,
                raw.len()
            )));
        }

        let message_type = MessageType::from_value(header.raw_type)?;
        let transaction_id = header.transaction_id;

        let mut buf = raw.slice(HEADER_SIZE..);
        let mut attributes = Vec::new();
        let mut unknown_required = Vec::new();
        let mut integrity_seen = false;

        while buf.has_remaining() {
            let offset = raw.len() - buf.remaining();
            if buf.remaining() < 4 {
                return Err(StunError::MalformedHeader("incomplete attribute header".into()));
            }

            let attr_type_raw = buf.get_u16();
            let attr_len = buf.get_u16() as usize;
            if buf.remaining() < attr_len {
                return Err(StunError::AttributeParse {
                    attr_type: attr_type_raw,
                    reason: format!("value of {} bytes overruns message", attr_len),
                });
            }
            let value = buf.split_to(attr_len);
            buf.advance(padding(attr_len).min(buf.remaining()));

            if attr_type_raw == AttributeType::Fingerprint as u16 {
                if value.len() != 4 {
                    return Err(StunError::FingerprintMismatch);
                }
                let expected = CRC32.checksum(&raw[..offset]) ^ FINGERPRINT_XOR;
                if u32::from_be_bytes([value[0], value[1], value[2], value[3]]) != expected {
                    return Err(StunError::FingerprintMismatch);
                }
                if buf.has_remaining() {
                    return Err(StunError::AttributeParse {
                        attr_type: attr_type_raw,
                        reason: "attributes follow FINGERPRINT".into(),
                    });
                }
                attributes.push(Attribute::new(
                    AttributeType::Fingerprint,
                    AttributeValue::Bytes(value),
                ));
                break;
            }

            if integrity_seen {
                continue;
            }

            match AttributeType::from_u16(attr_type_raw) {
                Some(attr_type) => {
                    if attr_type == AttributeType::MessageIntegrity {
                        integrity_seen = true;
                    }
                    attributes.push(Attribute::decode(attr_type, value, &transaction_id)?);
                }
                None if attr_type_raw < 0x8000 => unknown_required.push(attr_type_raw),
                None => {} // Unknown comprehension-optional, skip
            }
        }

        if !unknown_required.is_empty() {
            return Err(StunError::UnknownComprehensionRequired(unknown_required));
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }
}

/// Verify MESSAGE-INTEGRITY of a raw message against a long-term key.
///
/// The HMAC covers everything before the integrity attribute, with the
/// header length field rewritten to end just after it. Returns `false`
/// when the attribute is absent or the digest does not match.
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> Result<bool, StunError> {
    let Some(pos) = find_attribute_position(raw, AttributeType::MessageIntegrity) else {
        return Ok(false);
    };
    let end = pos + 4 + INTEGRITY_SIZE;
    if raw.len() < end {
        return Ok(false);
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&raw[..HEADER_SIZE]);
    header[2..4].copy_from_slice(&((end - HEADER_SIZE) as u16).to_be_bytes());

    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::InvalidKey)?;
    mac.update(&header);
    mac.update(&raw[HEADER_SIZE..pos]);
    Ok(mac.verify_slice(&raw[pos + 4..end]).is_ok())
}

/// Byte offset of the first attribute of `attr_type` in a raw message
fn find_attribute_position(raw: &[u8], attr_type: AttributeType) -> Option<usize> {
    let mut pos = HEADER_SIZE;

    while pos + 4 <= raw.len() {
        let attr = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;

        if attr == attr_type as u16 {
            return Some(pos);
        }

        pos += 4 + len + padding(len);
    }

    None
}

/// Fixed STUN header fields, readable even when the body is malformed
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub raw_type: u16,
    pub length: usize,
    pub transaction_id: TransactionId,
}

impl MessageHeader {
    /// Parse the 20-byte header without touching attributes
    pub fn peek(raw: &[u8]) -> Result<Self, StunError> {
        if raw.len() < HEADER_SIZE {
            return Err(StunError::MalformedHeader(format!("{} bytes is too short", raw.len())));
        }

        let mut buf = &raw[..HEADER_SIZE];
        let raw_type = buf.get_u16();
        if raw_type & 0xC000 != 0 {
            return Err(StunError::MalformedHeader("leading type bits must be zero".into()));
        }
        let length = buf.get_u16() as usize;
        let magic = buf.get_u32();
        if magic != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic));
        }

        let mut tid = [0u8; 12];
        buf.copy_to_slice(&mut tid);

        Ok(Self {
            raw_type,
            length,
            transaction_id: TransactionId::from_bytes(tid),
        })
    }

    /// Type of the request, if the method is one the server knows
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_value(self.raw_type).ok()
    }

    pub fn class(&self) -> MessageClass {
        MessageClass::from_bits(self.raw_type)
    }

    /// Wire type of an error response to this message, keeping its method
    /// bits even when the method is unknown
    pub fn error_type_value(&self) -> u16 {
        self.raw_type | MessageClass::ErrorResponse.bits()
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: AttributeType,
    pub value: AttributeValue,
}

/// STUN attribute values; the layout on the wire is chosen by the attribute type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Transport address; XOR'd for the XOR-* types
    Address(SocketAddr),
    /// UTF-8 text (USERNAME, REALM, SOFTWARE)
    Text(String),
    /// Opaque bytes (NONCE, DATA, MESSAGE-INTEGRITY, FINGERPRINT)
    Bytes(Bytes),
    /// 32-bit integer (LIFETIME)
    U32(u32),
    /// CHANNEL-NUMBER followed by RFFU
    ChannelNumber(u16),
    /// REQUESTED-TRANSPORT protocol number
    Transport(u8),
    ErrorCode { code: u16, reason: String },
    UnknownAttributes(Vec<u16>),
    /// Zero-length flag attribute (DONT-FRAGMENT)
    Empty,
}

impl Attribute {
    pub fn new(attr_type: AttributeType, value: AttributeValue) -> Self {
        Self { attr_type, value }
    }

    pub fn username(name: impl Into<String>) -> Self {
        Self::new(AttributeType::Username, AttributeValue::Text(name.into()))
    }

    pub fn realm(realm: impl Into<String>) -> Self {
        Self::new(AttributeType::Realm, AttributeValue::Text(realm.into()))
    }

    pub fn nonce(nonce: impl Into<Bytes>) -> Self {
        Self::new(AttributeType::Nonce, AttributeValue::Bytes(nonce.into()))
    }

    pub fn software(software: impl Into<String>) -> Self {
        Self::new(AttributeType::Software, AttributeValue::Text(software.into()))
    }

    pub fn lifetime(seconds: u32) -> Self {
        Self::new(AttributeType::Lifetime, AttributeValue::U32(seconds))
    }

    pub fn channel_number(channel: u16) -> Self {
        Self::new(AttributeType::ChannelNumber, AttributeValue::ChannelNumber(channel))
    }

    pub fn requested_transport(protocol: u8) -> Self {
        Self::new(AttributeType::RequestedTransport, AttributeValue::Transport(protocol))
    }

    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(AttributeType::Data, AttributeValue::Bytes(payload.into()))
    }

    pub fn xor_mapped_address(addr: SocketAddr) -> Self {
        Self::new(AttributeType::XorMappedAddress, AttributeValue::Address(addr))
    }

    pub fn xor_peer_address(addr: SocketAddr) -> Self {
        Self::new(AttributeType::XorPeerAddress, AttributeValue::Address(addr))
    }

    pub fn xor_relayed_address(addr: SocketAddr) -> Self {
        Self::new(AttributeType::XorRelayedAddress, AttributeValue::Address(addr))
    }

    pub fn alternate_server(addr: SocketAddr) -> Self {
        Self::new(AttributeType::AlternateServer, AttributeValue::Address(addr))
    }

    pub fn error_code(code: u16, reason: impl Into<String>) -> Self {
        Self::new(
            AttributeType::ErrorCode,
            AttributeValue::ErrorCode { code, reason: reason.into() },
        )
    }

    pub fn unknown_attributes(codes: Vec<u16>) -> Self {
        Self::new(AttributeType::UnknownAttributes, AttributeValue::UnknownAttributes(codes))
    }

    /// Encode attribute with padding
    pub fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) -> Result<(), StunError> {
        let start_pos = buf.len();

        buf.put_u16(self.attr_type as u16);
        buf.put_u16(0); // Length placeholder

        match &self.value {
            AttributeValue::Address(addr) => {
                encode_address(buf, addr, self.attr_type.is_xor_address(), tid);
            }
            AttributeValue::Text(text) => buf.put_slice(text.as_bytes()),
            AttributeValue::Bytes(data) => buf.put_slice(data),
            AttributeValue::U32(v) => buf.put_u32(*v),
            AttributeValue::ChannelNumber(channel) => {
                buf.put_u16(*channel);
                buf.put_u16(0); // RFFU
            }
            AttributeValue::Transport(protocol) => {
                buf.put_u8(*protocol);
                buf.put_slice(&[0, 0, 0]); // RFFU
            }
            AttributeValue::ErrorCode { code, reason } => {
                buf.put_u16(0); // Reserved
                buf.put_u8((code / 100) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            AttributeValue::UnknownAttributes(codes) => {
                for code in codes {
                    buf.put_u16(*code);
                }
            }
            AttributeValue::Empty => {}
        }

        let value_len = buf.len() - start_pos - 4;
        if value_len > u16::MAX as usize {
            return Err(StunError::MessageTooLarge(value_len));
        }
        buf[start_pos + 2..start_pos + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        buf.put_bytes(0, padding(value_len));
        Ok(())
    }

    /// Decode one attribute value of a known type
    pub fn decode(attr_type: AttributeType, mut value: Bytes, tid: &TransactionId) -> Result<Self, StunError> {
        let code = attr_type as u16;
        let too_short = |what: &str| StunError::AttributeParse {
            attr_type: code,
            reason: format!("{} too short", what),
        };

        let parsed = match attr_type {
            AttributeType::MappedAddress
            | AttributeType::AlternateServer
            | AttributeType::XorMappedAddress
            | AttributeType::XorPeerAddress
            | AttributeType::XorRelayedAddress => {
                AttributeValue::Address(decode_address(&mut value, attr_type.is_xor_address(), tid, code)?)
            }
            AttributeType::Username | AttributeType::Realm | AttributeType::Software => {
                let text = String::from_utf8(value.to_vec()).map_err(|e| StunError::AttributeParse {
                    attr_type: code,
                    reason: e.to_string(),
                })?;
                AttributeValue::Text(text)
            }
            AttributeType::Nonce
            | AttributeType::Data
            | AttributeType::MessageIntegrity
            | AttributeType::Fingerprint => AttributeValue::Bytes(value),
            AttributeType::Lifetime => {
                if value.len() != 4 {
                    return Err(too_short("LIFETIME"));
                }
                AttributeValue::U32(value.get_u32())
            }
            AttributeType::ChannelNumber => {
                if value.len() != 4 {
                    return Err(too_short("CHANNEL-NUMBER"));
                }
                AttributeValue::ChannelNumber(value.get_u16())
            }
            AttributeType::RequestedTransport => {
                if value.len() != 4 {
                    return Err(too_short("REQUESTED-TRANSPORT"));
                }
                AttributeValue::Transport(value.get_u8())
            }
            AttributeType::ErrorCode => {
                if value.len() < 4 {
                    return Err(too_short("ERROR-CODE"));
                }
                value.advance(2); // Reserved
                let class = (value.get_u8() & 0x07) as u16;
                let number = value.get_u8() as u16;
                let reason = String::from_utf8_lossy(&value).into_owned();
                AttributeValue::ErrorCode { code: class * 100 + number, reason }
            }
            AttributeType::UnknownAttributes => {
                let mut codes = Vec::with_capacity(value.len() / 2);
                while value.remaining() >= 2 {
                    codes.push(value.get_u16());
                }
                AttributeValue::UnknownAttributes(codes)
            }
            AttributeType::DontFragment => AttributeValue::Empty,
        };

        Ok(Self::new(attr_type, parsed))
    }
}

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn set_length(buf: &mut BytesMut, len: usize) -> Result<(), StunError> {
    let len = u16::try_from(len).map_err(|_| StunError::MessageTooLarge(len))?;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Encode a transport address, optionally XOR'd (RFC 5389 Section 15.2)
fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    buf.put_u8(0); // Reserved

    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, &xor_mask(tid));
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, &xor_mask(tid));
            }
            buf.put_slice(&octets);
        }
    }
}

/// Decode a transport address, optionally XOR'd
fn decode_address(buf: &mut Bytes, xor: bool, tid: &TransactionId, code: u16) -> Result<SocketAddr, StunError> {
    let malformed = |reason: String| StunError::AttributeParse { attr_type: code, reason };

    if buf.remaining() < 8 {
        return Err(malformed("address too short".into()));
    }

    buf.advance(1); // Reserved
    let family = buf.get_u8();
    let mut port = buf.get_u16();
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            if buf.remaining() != 4 {
                return Err(malformed("IPv4 address must be 4 bytes".into()));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            if xor {
                xor_in_place(&mut octets, &xor_mask(tid));
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            if buf.remaining() != 16 {
                return Err(malformed("IPv6 address must be 16 bytes".into()));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            if xor {
                xor_in_place(&mut octets, &xor_mask(tid));
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(malformed(format!("unknown address family {}", other))),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Magic cookie followed by the transaction ID
fn xor_mask(tid: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(tid.as_bytes());
    mask
}

fn xor_in_place(octets: &mut [u8], mask: &[u8; 16]) {
    for (byte, m) in octets.iter_mut().zip(mask.iter()) {
        *byte ^= m;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate_request() -> Message {
        Message::new(
            MessageType::new(Method::Allocate, MessageClass::Request),
            TransactionId::new(),
        )
        .with(Attribute::requested_transport(17))
        .with(Attribute::lifetime(600))
        .with(Attribute::username("user"))
        .with(Attribute::realm("realm"))
        .with(Attribute::nonce(Bytes::from_static(b"abc")))
    }

    #[test]
    fn test_message_type_bits() {
        let cases = [
            (Method::Binding, MessageClass::Request, 0x0001),
            (Method::Binding, MessageClass::SuccessResponse, 0x0101),
            (Method::Allocate, MessageClass::ErrorResponse, 0x0113),
            (Method::Send, MessageClass::Indication, 0x0016),
            (Method::Data, MessageClass::Indication, 0x0017),
            (Method::ChannelBind, MessageClass::SuccessResponse, 0x0109),
        ];
        for (method, class, value) in cases {
            let ty = MessageType::new(method, class);
            assert_eq!(ty.value(), value);
            assert_eq!(MessageType::from_value(value).unwrap(), ty);
        }
        assert!(MessageType::from_value(0x0002).is_err());
    }

    #[test]
    fn test_message_encode_decode() {
        let msg = allocate_request()
            .with(Attribute::xor_peer_address("192.0.2.1:4000".parse().unwrap()))
            .with(Attribute::xor_peer_address("[2001:db8::1]:5000".parse().unwrap()))
            .with(Attribute::data(Bytes::from_static(b"hello")))
            .with(Attribute::channel_number(0x4001))
            .with(Attribute::error_code(438, "Stale Nonce"))
            .with(Attribute::unknown_attributes(vec![0x0018, 0x0022]))
            .with(Attribute::alternate_server("198.51.100.7:3478".parse().unwrap()))
            .with(Attribute::new(AttributeType::DontFragment, AttributeValue::Empty))
            .with(Attribute::software("SHARP TURN"));

        let encoded = msg.encode(None, false).unwrap();
        assert_eq!(encoded.len() % 4, 0);

        let decoded = Message::decode(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_xor_address_encoding() {
        let tid = TransactionId::from_bytes([0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae]);
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();

        let mut buf = BytesMut::new();
        encode_address(&mut buf, &addr, true, &tid);
        // RFC 5769 Section 2.2 sample
        assert_eq!(&buf[..], &[0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]);

        let mut bytes = buf.freeze();
        assert_eq!(decode_address(&mut bytes, true, &tid, 0x0020).unwrap(), addr);
    }

    #[test]
    fn test_message_integrity() {
        let msg = allocate_request();
        let key = b"0123456789abcdef";

        let encoded = msg.encode(Some(key), true).unwrap();
        assert!(verify_integrity(&encoded, key).unwrap());
        assert!(!verify_integrity(&encoded, b"wrong-key").unwrap());

        let decoded = Message::decode(encoded.clone()).unwrap();
        assert!(decoded.has_attribute(AttributeType::MessageIntegrity));
        assert!(decoded.has_attribute(AttributeType::Fingerprint));

        let plain = msg.encode(None, false).unwrap();
        assert!(!verify_integrity(&plain, key).unwrap());
    }

    #[test]
    fn test_fingerprint_rejects_corruption() {
        let encoded = allocate_request().encode(None, true).unwrap();
        assert!(Message::decode(encoded.clone()).is_ok());

        let mut corrupted = encoded.to_vec();
        corrupted[HEADER_SIZE + 4] ^= 0xff;
        assert!(matches!(
            Message::decode(Bytes::from(corrupted)),
            Err(StunError::FingerprintMismatch)
        ));
    }

    #[test]
    fn test_error_type_for_unknown_method() {
        // Method 0x002 request
        let mut raw = BytesMut::new();
        raw.put_u16(0x0002);
        raw.put_u16(0);
        raw.put_u32(MAGIC_COOKIE);
        raw.put_slice(&[7u8; 12]);

        let header = MessageHeader::peek(&raw).unwrap();
        assert!(header.message_type().is_none());
        assert_eq!(header.class(), MessageClass::Request);
        assert_eq!(header.error_type_value(), 0x0112);
        assert!(matches!(Message::decode(raw.freeze()), Err(StunError::UnknownMessageType(0x0002))));

        let response = Message::new(MessageType::new(Method::Binding, MessageClass::ErrorResponse), header.transaction_id)
            .with(Attribute::error_code(400, "Bad Request"))
            .encode_as(header.error_type_value(), None, true)
            .unwrap();
        assert_eq!(&response[0..2], &[0x01, 0x12]);
        assert_eq!(&response[8..20], &[7u8; 12]);
    }

    #[test]
    fn test_fingerprint_must_be_last() {
        let body = allocate_request().encode(None, false).unwrap();
        let mut raw = BytesMut::from(&body[..]);

        // Valid FINGERPRINT over a length that also covers a trailing SOFTWARE
        let len = (raw.len() - HEADER_SIZE + 8 + 4) as u16;
        raw[2..4].copy_from_slice(&len.to_be_bytes());
        let checksum = CRC32.checksum(&raw) ^ FINGERPRINT_XOR;
        raw.put_u16(AttributeType::Fingerprint as u16);
        raw.put_u16(4);
        raw.put_u32(checksum);
        raw.put_slice(&[0x80, 0x22, 0x00, 0x00]);

        assert!(matches!(
            Message::decode(raw.freeze()),
            Err(StunError::AttributeParse { attr_type: 0x8028, .. })
        ));
    }

    #[test]
    fn test_unknown_comprehension_required() {
        let msg = allocate_request();
        let mut raw = BytesMut::from(&msg.encode(None, false).unwrap()[..]);
        // EVEN-PORT is not supported
        raw.put_slice(&[0x00, 0x18, 0x00, 0x01, 0x80, 0x00, 0x00, 0x00]);
        // Unknown comprehension-optional attribute is skipped
        raw.put_slice(&[0x80, 0x99, 0x00, 0x00]);
        let len = (raw.len() - HEADER_SIZE) as u16;
        raw[2..4].copy_from_slice(&len.to_be_bytes());

        match Message::decode(raw.freeze()) {
            Err(StunError::UnknownComprehensionRequired(codes)) => assert_eq!(codes, vec![0x0018]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_headers() {
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0u8; 8])),
            Err(StunError::MalformedHeader(_))
        ));

        let mut raw = allocate_request().encode(None, false).unwrap().to_vec();
        raw[4] = 0;
        assert!(matches!(
            Message::decode(Bytes::from(raw.clone())),
            Err(StunError::InvalidMagicCookie(_))
        ));

        let mut raw = allocate_request().encode(None, false).unwrap().to_vec();
        raw.truncate(raw.len() - 4);
        assert!(matches!(
            Message::decode(Bytes::from(raw)),
            Err(StunError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_header_peek_survives_bad_body() {
        let msg = allocate_request();
        let mut raw = msg.encode(None, false).unwrap().to_vec();
        raw.extend_from_slice(&[0x00, 0x18, 0x00, 0x04, 0, 0, 0, 0]);

        let header = MessageHeader::peek(&raw).unwrap();
        assert_eq!(header.transaction_id, msg.transaction_id);
        assert_eq!(header.message_type(), Some(msg.message_type));
    }

    #[test]
    fn test_transaction_id_randomness() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }
}
