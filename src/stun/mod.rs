//! STUN/TURN wire codec (RFC 5389, RFC 5766).

pub mod channel_data;
pub mod protocol;

pub use channel_data::{classify, is_valid_channel, ChannelData, PacketKind, CHANNEL_MAX, CHANNEL_MIN};
pub use protocol::{
    verify_integrity, Attribute, AttributeType, AttributeValue, Message, MessageClass, MessageHeader,
    MessageType, Method, TransactionId, HEADER_SIZE, MAGIC_COOKIE, MAX_MESSAGE_SIZE,
};
