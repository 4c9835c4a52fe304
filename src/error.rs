use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Top-level error type for the TURN server
#[derive(Debug, Error)]
pub enum TurnError {
    /// STUN wire format errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Long-term credential failures
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Five-tuple already owns an allocation
    #[error("Allocation already exists for {0}")]
    AllocationExists(SocketAddr),

    /// Request needs an allocation that is absent (or a different one exists)
    #[error("Allocation mismatch")]
    AllocationMismatch,

    /// Relay port range exhausted
    #[error("No relay ports available")]
    NoPortsAvailable,

    /// Per-client allocation cap hit
    #[error("Allocation quota reached for {0}")]
    QuotaExceeded(std::net::IpAddr),

    /// Server-wide or per-allocation capacity hit
    #[error("Insufficient capacity: {0}")]
    CapacityExceeded(&'static str),

    /// Peer has no installed permission
    #[error("No permission for peer {0}")]
    NoPermission(SocketAddr),

    /// Channel or peer already bound to something else
    #[error("Channel {channel:#06x} conflicts with existing binding")]
    ChannelConflict { channel: u16 },

    /// Channel number outside 0x4000..=0x7FFF
    #[error("Invalid channel number {0:#06x}")]
    InvalidChannelNumber(u16),

    /// Peer family differs from relay family
    #[error("Peer address family mismatch for {0}")]
    PeerAddressFamilyMismatch(SocketAddr),

    /// Peer rejected by address filter
    #[error("Peer {0} forbidden by policy")]
    PeerForbidden(SocketAddr),

    /// Request authenticated as a different user than the allocation owner
    #[error("Wrong credentials for allocation")]
    WrongCredentials,

    /// REQUESTED-TRANSPORT names something other than UDP
    #[error("Unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// Request missing or carrying malformed attributes
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Outbound relay queue closed or full
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(&'static str),
}

/// STUN wire format errors
#[derive(Debug, Error)]
pub enum StunError {
    /// Header too short or length field inconsistent
    #[error("Malformed STUN header: {0}")]
    MalformedHeader(String),

    /// Invalid magic cookie
    #[error("Invalid magic cookie: expected 0x2112A442, got 0x{0:08X}")]
    InvalidMagicCookie(u32),

    /// Method/class pair not handled by this server
    #[error("Unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),

    /// Unknown comprehension required
    #[error("Unknown comprehension-required attributes: {0:?}")]
    UnknownComprehensionRequired(Vec<u16>),

    /// Attribute parsing error
    #[error("Failed to parse attribute 0x{attr_type:04X}: {reason}")]
    AttributeParse { attr_type: u16, reason: String },

    /// Fingerprint mismatch
    #[error("FINGERPRINT check failed")]
    FingerprintMismatch,

    /// ChannelData framing error
    #[error("Malformed ChannelData: {0}")]
    MalformedChannelData(String),

    /// Attribute or message exceeds the 16-bit length field
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// HMAC key rejected
    #[error("Invalid integrity key")]
    InvalidKey,
}

/// Long-term credential mechanism failures
#[derive(Debug, Error)]
pub enum AuthError {
    /// No MESSAGE-INTEGRITY: first contact, answer with a challenge
    #[error("Missing MESSAGE-INTEGRITY")]
    Unauthorized,

    /// Nonce expired, forged or bound to another client
    #[error("Stale nonce")]
    StaleNonce,

    /// HMAC did not match
    #[error("MESSAGE-INTEGRITY check failed")]
    IntegrityFailure,

    /// MESSAGE-INTEGRITY present but a companion attribute is not
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// Credential store has no entry
    #[error("Unknown user {0}")]
    UnknownUser(String),

    /// Credential store backend failure
    #[error("Credential lookup failed: {0}")]
    Backend(String),
}

/// Result alias used throughout the crate
pub type TurnResult<T> = Result<T, TurnError>;

impl TurnError {
    /// STUN ERROR-CODE number and reason phrase for this failure.
    ///
    /// Errors without a wire representation map to 500.
    pub fn error_code(&self) -> (u16, &'static str) {
        match self {
            Self::Stun(StunError::UnknownComprehensionRequired(_)) => (420, "Unknown Attribute"),
            Self::Stun(_) | Self::BadRequest(_) => (400, "Bad Request"),
            Self::InvalidChannelNumber(_) | Self::ChannelConflict { .. } => (400, "Bad Request"),
            Self::Auth(AuthError::StaleNonce) => (438, "Stale Nonce"),
            Self::Auth(AuthError::MissingAttribute(_)) => (400, "Bad Request"),
            Self::Auth(AuthError::Backend(_)) => (500, "Server Error"),
            Self::Auth(_) => (401, "Unauthorized"),
            Self::PeerForbidden(_) => (403, "Forbidden"),
            Self::AllocationExists(_) | Self::AllocationMismatch => (437, "Allocation Mismatch"),
            Self::WrongCredentials => (441, "Wrong Credentials"),
            Self::UnsupportedTransport(_) => (442, "Unsupported Transport Protocol"),
            Self::PeerAddressFamilyMismatch(_) => (443, "Peer Address Family Mismatch"),
            Self::QuotaExceeded(_) => (486, "Allocation Quota Reached"),
            Self::NoPortsAvailable | Self::CapacityExceeded(_) => (508, "Insufficient Capacity"),
            Self::NoPermission(_) => (403, "Forbidden"),
            Self::Io(_) | Self::Config(_) | Self::RelayUnavailable(_) => (500, "Server Error"),
        }
    }

    /// True for failures caused by exhausted server resources
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::NoPortsAvailable | Self::CapacityExceeded(_))
    }
}
