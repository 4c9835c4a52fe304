// src/turn/permission_channel_manager.rs
//! Permission and channel state for a single allocation
//!
//! Implements:
//! - RFC 5766 (TURN) Permission management (Section 8)
//! - RFC 5766 (TURN) Channel management (Section 11)
//!
//! Entries expire lazily: lookups compare against the stored expiry, and
//! the allocation sweep calls [`PeerPermissions::prune`] to drop dead ones.
//! Callers hold the owning allocation's lock, so every operation here is
//! linearized per allocation.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::{TurnError, TurnResult};
use crate::stun::is_valid_channel;

/// Lifetimes and caps applied to every allocation
#[derive(Debug, Clone, Copy)]
pub struct PermissionPolicy {
    pub permission_lifetime: Duration,
    pub channel_lifetime: Duration,
    pub max_permissions: usize,
    pub max_channels: usize,
}

impl PermissionPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            permission_lifetime: config.permission_lifetime(),
            channel_lifetime: config.channel_lifetime(),
            max_permissions: config.max_permissions_per_allocation,
            max_channels: config.max_channels_per_allocation,
        }
    }
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Channel number bound to a peer transport address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: u16,
    pub peer: SocketAddr,
    pub expires_at: Instant,
}

/// Permissions and channel bindings of one allocation
#[derive(Debug)]
pub struct PeerPermissions {
    policy: PermissionPolicy,

    /// Peer IP -> expiry. Ports are ignored (RFC 5766 Section 8).
    permissions: HashMap<IpAddr, Instant>,

    /// Channel number -> binding
    channels: HashMap<u16, ChannelBinding>,

    /// Peer address -> channel number reverse lookup
    peer_channels: HashMap<SocketAddr, u16>,
}

impl PeerPermissions {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            permissions: HashMap::new(),
            channels: HashMap::new(),
            peer_channels: HashMap::new(),
        }
    }

    /// Install or refresh a permission for `peer_ip`
    pub fn permit(&mut self, peer_ip: IpAddr, now: Instant) -> TurnResult<()> {
        self.check_permission_capacity(peer_ip, now)?;
        self.permissions.insert(peer_ip, now + self.policy.permission_lifetime);
        Ok(())
    }

    /// Install several permissions at once; either all land or none do
    pub fn permit_all(&mut self, peer_ips: &[IpAddr], now: Instant) -> TurnResult<()> {
        let mut fresh: Vec<IpAddr> = peer_ips
            .iter()
            .copied()
            .filter(|ip| !self.permissions.contains_key(ip))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();

        if self.permissions.len() + fresh.len() > self.policy.max_permissions {
            self.permissions.retain(|_, expires_at| *expires_at > now);
            if self.permissions.len() + fresh.len() > self.policy.max_permissions {
                return Err(TurnError::CapacityExceeded("permissions per allocation"));
            }
        }

        let expires_at = now + self.policy.permission_lifetime;
        for ip in peer_ips {
            self.permissions.insert(*ip, expires_at);
        }
        Ok(())
    }

    pub fn has_permission(&self, peer_ip: IpAddr, now: Instant) -> bool {
        self.permissions
            .get(&peer_ip)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Extend a live permission after relayed traffic. Returns false when
    /// there is no live permission, in which case nothing changes.
    pub fn refresh_permission(&mut self, peer_ip: IpAddr, now: Instant) -> bool {
        match self.permissions.get_mut(&peer_ip) {
            Some(expires_at) if *expires_at > now => {
                *expires_at = now + self.policy.permission_lifetime;
                true
            }
            _ => false,
        }
    }

    /// Bind `channel` to `peer`, or refresh an identical binding.
    ///
    /// Also installs (or refreshes) the permission for the peer IP.
    pub fn bind(&mut self, channel: u16, peer: SocketAddr, now: Instant) -> TurnResult<()> {
        if !is_valid_channel(channel) {
            return Err(TurnError::InvalidChannelNumber(channel));
        }

        self.drop_expired_binding(channel, now);
        if let Some(&bound) = self.peer_channels.get(&peer) {
            self.drop_expired_binding(bound, now);
        }

        if let Some(existing) = self.channels.get(&channel) {
            if existing.peer != peer {
                return Err(TurnError::ChannelConflict { channel });
            }
        }
        if let Some(&bound) = self.peer_channels.get(&peer) {
            if bound != channel {
                return Err(TurnError::ChannelConflict { channel });
            }
        }

        if !self.channels.contains_key(&channel) && self.channels.len() >= self.policy.max_channels {
            return Err(TurnError::CapacityExceeded("channels per allocation"));
        }
        self.check_permission_capacity(peer.ip(), now)?;

        self.channels.insert(
            channel,
            ChannelBinding {
                channel,
                peer,
                expires_at: now + self.policy.channel_lifetime,
            },
        );
        self.peer_channels.insert(peer, channel);
        self.permissions.insert(peer.ip(), now + self.policy.permission_lifetime);
        Ok(())
    }

    /// Remove a binding regardless of expiry
    pub fn unbind(&mut self, channel: u16) -> Option<ChannelBinding> {
        let binding = self.channels.remove(&channel)?;
        self.peer_channels.remove(&binding.peer);
        Some(binding)
    }

    /// Live channel bound to exactly this peer address
    pub fn channel_for_peer(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        let channel = *self.peer_channels.get(&peer)?;
        self.channels
            .get(&channel)
            .filter(|b| b.expires_at > now)
            .map(|b| b.channel)
    }

    /// Peer behind a live channel
    pub fn peer_for_channel(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        self.channels
            .get(&channel)
            .filter(|b| b.expires_at > now)
            .map(|b| b.peer)
    }

    /// Drop expired permissions and bindings; returns how many of each went
    pub fn prune(&mut self, now: Instant) -> (usize, usize) {
        let permissions_before = self.permissions.len();
        self.permissions.retain(|_, expires_at| *expires_at > now);

        let expired: Vec<u16> = self
            .channels
            .values()
            .filter(|b| b.expires_at <= now)
            .map(|b| b.channel)
            .collect();
        for channel in &expired {
            self.unbind(*channel);
        }

        (permissions_before - self.permissions.len(), expired.len())
    }

    pub fn permission_count(&self) -> usize {
        self.permissions.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn check_permission_capacity(&mut self, peer_ip: IpAddr, now: Instant) -> TurnResult<()> {
        if self.permissions.contains_key(&peer_ip) || self.permissions.len() < self.policy.max_permissions {
            return Ok(());
        }
        // Reclaim dead slots before refusing
        self.permissions.retain(|_, expires_at| *expires_at > now);
        if self.permissions.len() < self.policy.max_permissions {
            Ok(())
        } else {
            Err(TurnError::CapacityExceeded("permissions per allocation"))
        }
    }

    fn drop_expired_binding(&mut self, channel: u16, now: Instant) {
        if self.channels.get(&channel).is_some_and(|b| b.expires_at <= now) {
            self.unbind(channel);
        }
    }
}
