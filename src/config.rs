//! Server configuration.
//!
//! Every field has a default. An empty TOML document still fails
//! validation, since some address to advertise in XOR-RELAYED-ADDRESS
//! must be given explicitly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{TurnError, TurnResult};
use crate::turn::filter::{PeerAction, PeerRule};

/// Static long-term credential entry, in the server realm
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

/// TURN server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// UDP listen address
    pub listen: SocketAddr,
    /// Address relay sockets bind to
    pub relay_ip: IpAddr,
    /// Address advertised in XOR-RELAYED-ADDRESS
    pub external_ip: Option<IpAddr>,
    /// Relay port range, inclusive
    pub min_port: u16,
    pub max_port: u16,

    pub realm: String,
    /// SOFTWARE attribute; empty string disables it
    pub software: Option<String>,
    /// Append FINGERPRINT to every response
    pub fingerprint: bool,

    pub default_lifetime_secs: u64,
    pub max_lifetime_secs: u64,
    pub permission_lifetime_secs: u64,
    pub channel_lifetime_secs: u64,
    pub nonce_lifetime_secs: u64,
    pub sweep_interval_ms: u64,

    pub max_allocations: usize,
    pub max_allocations_per_ip: usize,
    pub max_permissions_per_allocation: usize,
    pub max_channels_per_allocation: usize,

    /// Per-allocation relay budget in bytes per second
    pub bandwidth_limit: Option<u64>,
    /// Redirect target when out of capacity (300 Try Alternate)
    pub alternate_server: Option<SocketAddr>,

    pub users: Vec<UserConfig>,
    /// Ordered; first match wins
    pub peer_rules: Vec<PeerRule>,
    pub peer_default: PeerAction,

    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3478),
            relay_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            external_ip: None,
            min_port: 49152,
            max_port: 65535,
            realm: "sharp-turn".into(),
            software: Some(format!("SHARP TURN {}", crate::VERSION)),
            fingerprint: true,
            default_lifetime_secs: 600,
            max_lifetime_secs: 3600,
            permission_lifetime_secs: 300,
            channel_lifetime_secs: 600,
            nonce_lifetime_secs: 300,
            sweep_interval_ms: 1000,
            max_allocations: 10_000,
            max_allocations_per_ip: 10,
            max_permissions_per_allocation: 100,
            max_channels_per_allocation: 100,
            bandwidth_limit: None,
            alternate_server: None,
            users: Vec::new(),
            peer_rules: Vec::new(),
            peer_default: PeerAction::Allow,
            log_level: "info".into(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> TurnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TurnError::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> TurnResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TurnError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> TurnResult<()> {
        if self.realm.is_empty() {
            return Err(TurnError::Config("realm must not be empty".into()));
        }
        if self.min_port == 0 || self.min_port > self.max_port {
            return Err(TurnError::Config(format!(
                "invalid relay port range {}-{}",
                self.min_port, self.max_port
            )));
        }
        if self.default_lifetime_secs == 0
            || self.permission_lifetime_secs == 0
            || self.channel_lifetime_secs == 0
            || self.nonce_lifetime_secs == 0
            || self.sweep_interval_ms == 0
        {
            return Err(TurnError::Config("lifetimes and intervals must be non-zero".into()));
        }
        if self.default_lifetime_secs > self.max_lifetime_secs {
            return Err(TurnError::Config(
                "default_lifetime_secs exceeds max_lifetime_secs".into(),
            ));
        }
        if self.users.iter().any(|u| u.username.is_empty()) {
            return Err(TurnError::Config("users entry with empty username".into()));
        }
        if self.advertised_ip().is_unspecified() {
            return Err(TurnError::Config(
                "no routable relay address: set external_ip, relay_ip or a specific listen address".into(),
            ));
        }
        Ok(())
    }

    /// Address put in XOR-RELAYED-ADDRESS: `external_ip`, else a specific
    /// `relay_ip`, else the listen address.
    pub fn advertised_ip(&self) -> IpAddr {
        match self.external_ip {
            Some(ip) => ip,
            None if !self.relay_ip.is_unspecified() => self.relay_ip,
            None => self.listen.ip(),
        }
    }

    pub fn default_lifetime(&self) -> Duration {
        Duration::from_secs(self.default_lifetime_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    pub fn permission_lifetime(&self) -> Duration {
        Duration::from_secs(self.permission_lifetime_secs)
    }

    pub fn channel_lifetime(&self) -> Duration {
        Duration::from_secs(self.channel_lifetime_secs)
    }

    pub fn nonce_lifetime(&self) -> Duration {
        Duration::from_secs(self.nonce_lifetime_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// SOFTWARE value to attach, if any
    pub fn software(&self) -> Option<&str> {
        self.software.as_deref().filter(|s| !s.is_empty())
    }

    /// Grant a lifetime for an Allocate or Refresh request.
    ///
    /// Missing or short requests get the default; long ones are clamped.
    pub fn grant_lifetime(&self, requested: Option<u32>) -> Duration {
        let requested = requested.map(u64::from).unwrap_or(self.default_lifetime_secs);
        Duration::from_secs(requested.clamp(self.default_lifetime_secs, self.max_lifetime_secs))
    }
}
