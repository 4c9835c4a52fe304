// src/turn/mod.rs
//! TURN relay server (RFC 5766/8656).
//!
//! Layout:
//! - [`auth_security`]: long-term credentials and nonces
//! - [`allocation_manager`]: allocation table, relay ports, expiry sweep
//! - [`permission_channel_manager`]: per-allocation permissions and channels
//! - [`relay`]: per-allocation relay task and the client-to-peer send path
//! - [`server`]: request dispatch over the UDP listen socket

use std::fmt;
use std::net::SocketAddr;

pub mod allocation_manager;
pub mod auth_security;
pub mod clock;
pub mod filter;
pub mod permission_channel_manager;
pub mod rate_limiter;
pub mod relay;
pub mod server;

pub use allocation_manager::{Allocation, AllocationTable, TableConfig};
pub use auth_security::{
    long_term_key, Authenticated, Authenticator, Credential, CredentialStore, NonceManager, StaticCredentials,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use filter::{Cidr, PeerAction, PeerFilter, PeerRule};
pub use permission_channel_manager::{ChannelBinding, PeerPermissions, PermissionPolicy};
pub use server::{ServerStats, StatsSnapshot, TurnServer, TurnServerBuilder};

/// IANA protocol number for UDP, as carried in REQUESTED-TRANSPORT
pub const PROTOCOL_UDP: u8 = 17;

/// Client-facing transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Udp,
}

/// Client association: one allocation per five-tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiveTuple {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub transport: Transport,
}

impl FiveTuple {
    pub fn udp(client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            client,
            server,
            transport: Transport::Udp,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}/{:?}", self.client, self.server, self.transport)
    }
}
