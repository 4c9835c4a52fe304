// src/turn/allocation_manager.rs
//! Allocation table for the TURN relay
//!
//! Allocations are looked up concurrently through [`DashMap`] indexes (by
//! five-tuple and by relay address). Anything that changes which relay
//! ports are leased (create, delete, sweep) runs under one table mutex, so
//! a port is never handed out twice and a relay socket is never used after
//! its allocation is gone.
//!
//! Expiry is tracked in a min-heap keyed by deadline. Refreshing pushes a
//! new entry with a bumped generation; stale entries are skipped when they
//! surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::SharedClock;
use super::permission_channel_manager::{PeerPermissions, PermissionPolicy};
use super::rate_limiter::TokenBucket;
use super::relay::{RelayEndpoint, RelayHandle, RELAY_QUEUE_DEPTH};
use super::FiveTuple;
use crate::config::ServerConfig;
use crate::error::{TurnError, TurnResult};
use crate::stun::TransactionId;

/// Settings the table needs from the server configuration
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Address relay sockets bind to
    pub relay_ip: IpAddr,
    /// Address written into XOR-RELAYED-ADDRESS
    pub advertised_ip: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
    pub max_allocations: usize,
    pub max_allocations_per_ip: usize,
    pub bandwidth_limit: Option<u64>,
    pub permissions: PermissionPolicy,
}

impl TableConfig {
    /// Derive table settings from a validated configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            relay_ip: config.relay_ip,
            advertised_ip: config.advertised_ip(),
            min_port: config.min_port,
            max_port: config.max_port,
            max_allocations: config.max_allocations,
            max_allocations_per_ip: config.max_allocations_per_ip,
            bandwidth_limit: config.bandwidth_limit,
            permissions: PermissionPolicy::from_config(config),
        }
    }
}

/// Per-allocation traffic counters
#[derive(Debug, Default)]
pub struct AllocationStats {
    pub packets_to_peer: AtomicU64,
    pub bytes_to_peer: AtomicU64,
    pub packets_to_client: AtomicU64,
    pub bytes_to_client: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Expiry {
    at: Instant,
    generation: u64,
}

/// A TURN allocation. Owned by the [`AllocationTable`]; everyone else
/// holds the five-tuple or a short-lived `Arc`.
#[derive(Debug)]
pub struct Allocation {
    pub five_tuple: FiveTuple,
    /// Advertised relay transport address
    pub relay_addr: SocketAddr,
    /// User that created the allocation
    pub username: String,
    pub created_at: Instant,
    pub stats: AllocationStats,

    expiry: Mutex<Expiry>,
    permissions: Mutex<PeerPermissions>,
    bandwidth: Option<Mutex<TokenBucket>>,
    /// Success response to the Allocate that created this allocation
    allocate_response: Mutex<Option<(TransactionId, Bytes)>>,
    relay: RelayHandle,
}

impl Allocation {
    pub fn expires_at(&self) -> Instant {
        self.expiry.lock().at
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    /// Permission and channel state; do not hold across an await
    pub fn permissions(&self) -> MutexGuard<'_, PeerPermissions> {
        self.permissions.lock()
    }

    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    /// Charge `len` bytes against the bandwidth limit, if any
    pub fn consume_bandwidth(&self, len: usize, now: Instant) -> bool {
        match &self.bandwidth {
            Some(bucket) => bucket.lock().consume_tokens(len, now),
            None => true,
        }
    }

    /// Cached Allocate response, if `transaction_id` is a retransmission
    pub fn cached_response(&self, transaction_id: TransactionId) -> Option<Bytes> {
        match &*self.allocate_response.lock() {
            Some((tid, bytes)) if *tid == transaction_id => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn set_cached_response(&self, transaction_id: TransactionId, response: Bytes) {
        *self.allocate_response.lock() = Some((transaction_id, response));
    }

    /// True once deleted or expired
    pub fn is_closed(&self) -> bool {
        self.relay.is_closed()
    }
}

/// Relay port range with a rotating cursor
#[derive(Debug)]
struct PortPool {
    min: u16,
    max: u16,
    cursor: u16,
    in_use: HashSet<u16>,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            cursor: rand::thread_rng().gen_range(min..=max),
            in_use: HashSet::new(),
        }
    }

    fn size(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    /// Lease the next free port after the cursor
    fn acquire(&mut self) -> Option<u16> {
        if self.in_use.len() >= self.size() {
            return None;
        }

        for _ in 0..self.size() {
            let port = self.cursor;
            self.cursor = if self.cursor == self.max { self.min } else { self.cursor + 1 };

            if self.in_use.insert(port) {
                return Some(port);
            }
        }

        None
    }

    fn release(&mut self, port: u16) -> bool {
        self.in_use.remove(&port)
    }
}

/// State mutated only under the table lock
#[derive(Debug)]
struct TableState {
    ports: PortPool,
    expiry_queue: BinaryHeap<Reverse<(Instant, u64, FiveTuple)>>,
    per_ip: HashMap<IpAddr, usize>,
    next_generation: u64,
}

impl TableState {
    fn schedule(&mut self, key: FiveTuple, at: Instant) -> u64 {
        self.next_generation += 1;
        self.expiry_queue.push(Reverse((at, self.next_generation, key)));
        self.next_generation
    }
}

/// Concurrency-safe allocation table
pub struct AllocationTable {
    /// Active allocations by five-tuple
    allocations: DashMap<FiveTuple, Arc<Allocation>>,

    /// Relay address to five-tuple reverse lookup
    relay_lookup: DashMap<SocketAddr, FiveTuple>,

    state: Mutex<TableState>,
    config: TableConfig,
    clock: SharedClock,

    /// Parent of every relay task's cancellation token
    shutdown: CancellationToken,
}

impl AllocationTable {
    pub fn new(config: TableConfig, clock: SharedClock, shutdown: CancellationToken) -> Self {
        info!(
            "Allocation table using relay ports {}-{} on {} (advertised as {})",
            config.min_port, config.max_port, config.relay_ip, config.advertised_ip
        );

        Self {
            allocations: DashMap::new(),
            relay_lookup: DashMap::new(),
            state: Mutex::new(TableState {
                ports: PortPool::new(config.min_port, config.max_port),
                expiry_queue: BinaryHeap::new(),
                per_ip: HashMap::new(),
                next_generation: 0,
            }),
            config,
            clock,
            shutdown,
        }
    }

    /// Current time on the table's clock
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Create an allocation and bind its relay socket.
    ///
    /// Returns the allocation plus the relay endpoint the caller must
    /// hand to a relay task. On error nothing is left behind.
    pub fn create(
        &self,
        five_tuple: FiveTuple,
        username: &str,
        lifetime: Duration,
    ) -> TurnResult<(Arc<Allocation>, RelayEndpoint)> {
        let mut state = self.state.lock();
        let client_ip = five_tuple.client.ip();

        if let Some(existing) = self.allocations.get(&five_tuple).map(|entry| entry.value().clone()) {
            if existing.expires_at() > self.clock.now() {
                return Err(TurnError::AllocationExists(five_tuple.client));
            }
            // Expired but not yet swept
            self.remove_locked(&mut state, &five_tuple);
            info!("Allocation {} expired ({})", five_tuple, existing.relay_addr);
        }
        if self.allocations.len() >= self.config.max_allocations {
            return Err(TurnError::CapacityExceeded("allocations"));
        }
        if state.per_ip.get(&client_ip).copied().unwrap_or(0) >= self.config.max_allocations_per_ip {
            return Err(TurnError::QuotaExceeded(client_ip));
        }

        let (port, socket) = self.bind_relay_socket(&mut state)?;
        let relay_addr = SocketAddr::new(self.config.advertised_ip, port);
        debug_assert!(
            !self.relay_lookup.contains_key(&relay_addr),
            "relay address {} assigned twice",
            relay_addr
        );

        let now = self.clock.now();
        let expires_at = now + lifetime;
        let generation = state.schedule(five_tuple, expires_at);

        let (tx, rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
        let cancel = self.shutdown.child_token();

        let allocation = Arc::new(Allocation {
            five_tuple,
            relay_addr,
            username: username.to_string(),
            created_at: now,
            stats: AllocationStats::default(),
            expiry: Mutex::new(Expiry { at: expires_at, generation }),
            permissions: Mutex::new(PeerPermissions::new(self.config.permissions)),
            bandwidth: self
                .config
                .bandwidth_limit
                .map(|limit| Mutex::new(TokenBucket::new(limit, now))),
            allocate_response: Mutex::new(None),
            relay: RelayHandle::new(tx, cancel.clone()),
        });

        self.allocations.insert(five_tuple, allocation.clone());
        self.relay_lookup.insert(relay_addr, five_tuple);
        *state.per_ip.entry(client_ip).or_insert(0) += 1;

        info!(
            "Created allocation {} -> {} for user {:?} (lifetime {:?})",
            five_tuple, relay_addr, username, lifetime
        );

        Ok((allocation, RelayEndpoint { socket, rx, cancel }))
    }

    /// Lease a port and bind it, skipping ports held by other processes
    fn bind_relay_socket(&self, state: &mut TableState) -> TurnResult<(u16, tokio::net::UdpSocket)> {
        for _ in 0..state.ports.size() {
            let port = state.ports.acquire().ok_or(TurnError::NoPortsAvailable)?;

            let bound = std::net::UdpSocket::bind(SocketAddr::new(self.config.relay_ip, port))
                .and_then(|socket| {
                    socket.set_nonblocking(true)?;
                    tokio::net::UdpSocket::from_std(socket)
                });

            match bound {
                Ok(socket) => return Ok((port, socket)),
                Err(e) => {
                    debug!("Relay port {} unusable: {}", port, e);
                    state.ports.release(port);
                }
            }
        }

        warn!("Relay port range {}-{} exhausted", self.config.min_port, self.config.max_port);
        Err(TurnError::NoPortsAvailable)
    }

    /// Live allocation for `five_tuple`. One past its expiry is treated
    /// as gone even before the sweep removes it.
    pub fn get(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let allocation = self.allocations.get(five_tuple).map(|entry| entry.value().clone())?;
        (allocation.expires_at() > self.clock.now()).then_some(allocation)
    }

    /// Allocation owning an advertised relay address
    pub fn get_by_relay(&self, relay_addr: &SocketAddr) -> Option<Arc<Allocation>> {
        let key = *self.relay_lookup.get(relay_addr)?;
        self.get(&key)
    }

    /// Extend an allocation. A zero lifetime deletes it and returns `None`.
    /// An allocation already past its expiry cannot be revived.
    pub fn refresh(&self, five_tuple: &FiveTuple, lifetime: Duration) -> TurnResult<Option<Instant>> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let allocation = self
            .allocations
            .get(five_tuple)
            .map(|entry| entry.value().clone())
            .ok_or(TurnError::AllocationMismatch)?;

        if allocation.expires_at() <= now {
            self.remove_locked(&mut state, five_tuple);
            info!("Allocation {} expired ({})", five_tuple, allocation.relay_addr);
            return Err(TurnError::AllocationMismatch);
        }
        if lifetime.is_zero() {
            self.remove_locked(&mut state, five_tuple);
            info!("Deleted allocation {} ({})", five_tuple, allocation.relay_addr);
            return Ok(None);
        }

        let expires_at = now + lifetime;
        let generation = state.schedule(*five_tuple, expires_at);
        *allocation.expiry.lock() = Expiry { at: expires_at, generation };

        debug!("Refreshed allocation {} (lifetime {:?})", five_tuple, lifetime);
        Ok(Some(expires_at))
    }

    /// Remove an allocation and stop its relay task
    pub fn delete(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let mut state = self.state.lock();
        let allocation = self.remove_locked(&mut state, five_tuple)?;

        info!("Deleted allocation {} ({})", five_tuple, allocation.relay_addr);
        Some(allocation)
    }

    /// Remove every allocation whose expiry is at or before `now`, and
    /// prune stale permissions and channels in the survivors.
    pub fn sweep(&self, now: Instant) -> Vec<Arc<Allocation>> {
        let mut expired = Vec::new();

        {
            let mut state = self.state.lock();
            while let Some(Reverse((at, generation, key))) = state.expiry_queue.peek().copied() {
                if at > now {
                    break;
                }
                state.expiry_queue.pop();

                let current = self
                    .allocations
                    .get(&key)
                    .map(|entry| entry.value().expiry.lock().generation);
                if current != Some(generation) {
                    continue; // Refreshed or already deleted
                }

                if let Some(allocation) = self.remove_locked(&mut state, &key) {
                    info!("Allocation {} expired ({})", key, allocation.relay_addr);
                    expired.push(allocation);
                }
            }
        }

        let mut pruned = (0, 0);
        for entry in self.allocations.iter() {
            let (permissions, channels) = entry.value().permissions().prune(now);
            pruned.0 += permissions;
            pruned.1 += channels;
        }
        if pruned != (0, 0) {
            debug!("Pruned {} permissions and {} channel bindings", pruned.0, pruned.1);
        }

        expired
    }

    /// Delete everything, e.g. at shutdown
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<FiveTuple> = self.allocations.iter().map(|entry| *entry.key()).collect();
        keys.iter()
            .filter_map(|key| self.remove_locked(&mut state, key))
            .count()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Allocations currently held by `ip`
    pub fn count_for_ip(&self, ip: IpAddr) -> usize {
        self.state.lock().per_ip.get(&ip).copied().unwrap_or(0)
    }

    fn remove_locked(&self, state: &mut TableState, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        let (_, allocation) = self.allocations.remove(five_tuple)?;
        self.relay_lookup.remove(&allocation.relay_addr);

        let released = state.ports.release(allocation.relay_addr.port());
        debug_assert!(released, "relay port {} was not leased", allocation.relay_addr.port());

        let client_ip = five_tuple.client.ip();
        if let Some(count) = state.per_ip.get_mut(&client_ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_ip.remove(&client_ip);
            }
        }

        allocation.relay.close();
        Some(allocation)
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
