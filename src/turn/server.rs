// src/turn/server.rs
//! TURN server front end
//!
//! Owns the UDP listen socket, demultiplexes STUN from ChannelData,
//! authenticates requests and dispatches them against the allocation
//! table. A background sweeper expires allocations on a fixed interval.
//!
//! Per-message failures never escape this module: malformed requests get
//! an error response, malformed indications are dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::allocation_manager::{Allocation, AllocationTable, TableConfig};
use super::auth_security::{Authenticated, Authenticator, CredentialStore, NonceManager, StaticCredentials};
use super::clock::{SharedClock, SystemClock};
use super::filter::PeerFilter;
use super::relay;
use super::{FiveTuple, PROTOCOL_UDP};
use crate::config::ServerConfig;
use crate::error::{AuthError, StunError, TurnError, TurnResult};
use crate::stun::{
    classify, Attribute, AttributeType, ChannelData, Message, MessageClass, MessageHeader, MessageType, Method,
    PacketKind, MAX_MESSAGE_SIZE,
};

/// Server-wide counters
#[derive(Debug, Default)]
pub struct ServerStats {
    pub requests: AtomicU64,
    pub indications: AtomicU64,
    pub channel_data: AtomicU64,
    pub error_responses: AtomicU64,
    pub auth_failures: AtomicU64,
    pub allocations_created: AtomicU64,
    pub allocations_expired: AtomicU64,
    pub packets_to_peer: AtomicU64,
    pub bytes_to_peer: AtomicU64,
    pub packets_to_client: AtomicU64,
    pub bytes_to_client: AtomicU64,
    pub packets_dropped: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_allocations: usize,
    pub requests: u64,
    pub indications: u64,
    pub channel_data: u64,
    pub error_responses: u64,
    pub auth_failures: u64,
    pub allocations_created: u64,
    pub allocations_expired: u64,
    pub packets_to_peer: u64,
    pub bytes_to_peer: u64,
    pub packets_to_client: u64,
    pub bytes_to_client: u64,
    pub packets_dropped: u64,
}

impl ServerStats {
    pub fn snapshot(&self, active_allocations: usize) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            active_allocations,
            requests: load(&self.requests),
            indications: load(&self.indications),
            channel_data: load(&self.channel_data),
            error_responses: load(&self.error_responses),
            auth_failures: load(&self.auth_failures),
            allocations_created: load(&self.allocations_created),
            allocations_expired: load(&self.allocations_expired),
            packets_to_peer: load(&self.packets_to_peer),
            bytes_to_peer: load(&self.bytes_to_peer),
            packets_to_client: load(&self.packets_to_client),
            bytes_to_client: load(&self.bytes_to_client),
            packets_dropped: load(&self.packets_dropped),
        }
    }
}

/// Outcome of a request handler
enum Reply {
    Message(Message),
    /// Pre-encoded response, e.g. a cached Allocate success
    Raw(Bytes),
}

/// Builder for [`TurnServer`]
pub struct TurnServerBuilder {
    config: ServerConfig,
    credentials: Option<Arc<dyn CredentialStore>>,
    clock: Option<SharedClock>,
}

impl TurnServerBuilder {
    /// Credential backend; defaults to the users in the configuration
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Time source; defaults to [`SystemClock`]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Bind the listen socket. Nothing is served until [`TurnServer::run`].
    pub async fn bind(self) -> TurnResult<TurnServer> {
        let config = self.config;
        config.validate()?;

        let socket = UdpSocket::bind(config.listen).await?;
        let local_addr = socket.local_addr()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(StaticCredentials::from_config(&config)));

        let shutdown = CancellationToken::new();
        let table = Arc::new(AllocationTable::new(
            TableConfig::from_config(&config),
            clock.clone(),
            shutdown.child_token(),
        ));
        let auth = Authenticator::new(
            config.realm.clone(),
            credentials,
            NonceManager::new(config.nonce_lifetime(), clock.now()),
        );
        let filter = PeerFilter::new(config.peer_rules.clone(), config.peer_default);

        info!("TURN server bound to {} (realm {:?})", local_addr, config.realm);

        Ok(TurnServer {
            inner: Arc::new(ServerInner {
                config,
                socket: Arc::new(socket),
                local_addr,
                table,
                auth,
                filter,
                clock,
                stats: Arc::new(ServerStats::default()),
                shutdown,
            }),
        })
    }
}

/// TURN server over UDP. Cheap to clone; clones share one server.
#[derive(Clone)]
pub struct TurnServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    table: Arc<AllocationTable>,
    auth: Authenticator,
    filter: PeerFilter,
    clock: SharedClock,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
}

impl TurnServer {
    pub fn builder(config: ServerConfig) -> TurnServerBuilder {
        TurnServerBuilder {
            config,
            credentials: None,
            clock: None,
        }
    }

    /// Bind with default credentials and clock
    pub async fn bind(config: ServerConfig) -> TurnResult<Self> {
        Self::builder(config).bind().await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn allocations(&self) -> &Arc<AllocationTable> {
        &self.inner.table
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.table.len())
    }

    /// Run one expiry sweep now; returns the number of expired allocations
    pub fn sweep_now(&self) -> usize {
        self.inner.sweep()
    }

    /// Ask [`run`](Self::run) to stop; relay tasks stop with it
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown");
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Serve until [`shutdown`](Self::shutdown) or a fatal socket error
    pub async fn run(&self) -> TurnResult<()> {
        let inner = &self.inner;
        info!("TURN server running on {}", inner.local_addr);

        let sweeper = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(inner.config.sweep_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = interval.tick() => {
                            inner.sweep();
                        }
                    }
                }
            })
        };

        let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);
        let result = loop {
            buf.clear();
            buf.reserve(MAX_MESSAGE_SIZE);

            tokio::select! {
                _ = inner.shutdown.cancelled() => break Ok(()),

                received = inner.socket.recv_buf_from(&mut buf) => match received {
                    Ok((_, source)) => {
                        let datagram = buf.split().freeze();
                        inner.handle_datagram(datagram, source).await;
                    }
                    Err(e) if relay::is_transient(&e) => {
                        trace!("Listen socket reported {}", e);
                    }
                    Err(e) => {
                        error!("Listen socket failed: {}", e);
                        break Err(TurnError::Io(e));
                    }
                }
            }
        };

        inner.shutdown.cancel();
        if let Err(e) = sweeper.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }

        let closed = inner.table.clear();
        info!("TURN server shutdown complete ({} allocations closed)", closed);
        result
    }
}

impl ServerInner {
    fn sweep(&self) -> usize {
        let expired = self.table.sweep(self.clock.now()).len();
        if expired > 0 {
            self.stats
                .allocations_expired
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
        expired
    }

    fn five_tuple(&self, client: SocketAddr) -> FiveTuple {
        FiveTuple::udp(client, self.local_addr)
    }

    async fn handle_datagram(&self, datagram: Bytes, source: SocketAddr) {
        match classify(&datagram) {
            PacketKind::Stun => self.handle_stun(datagram, source).await,
            PacketKind::ChannelData => self.handle_channel_data(datagram, source),
            PacketKind::Unknown => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Dropped unrecognised datagram from {}", source);
            }
        }
    }

    #[instrument(skip(self, datagram), level = "trace")]
    async fn handle_stun(&self, datagram: Bytes, source: SocketAddr) {
        let header = match MessageHeader::peek(&datagram) {
            Ok(header) => header,
            Err(e) => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Failed to parse STUN header from {}: {}", source, e);
                return;
            }
        };

        let message = match Message::decode(datagram.clone()) {
            Ok(message) => message,
            Err(e) => {
                self.reject_undecodable(header, e, source).await;
                return;
            }
        };

        match (message.message_type.method, message.message_type.class) {
            (Method::Binding, MessageClass::Request) => {
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                let response = Message::new(message.message_type.success(), message.transaction_id)
                    .with(Attribute::xor_mapped_address(source));
                self.send_message(response, None, source).await;
            }
            (Method::Send, MessageClass::Indication) => {
                self.stats.indications.fetch_add(1, Ordering::Relaxed);
                self.handle_send_indication(&message, source);
            }
            (_, MessageClass::Request) => {
                self.stats.requests.fetch_add(1, Ordering::Relaxed);
                self.handle_authenticated_request(&message, &datagram, source).await;
            }
            (method, class) => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Ignoring {:?} {:?} from {}", method, class, source);
            }
        }
    }

    /// Answer requests that failed to decode; drop everything else.
    /// Requests for unknown methods get 400 under their own method bits.
    async fn reject_undecodable(&self, header: MessageHeader, err: StunError, source: SocketAddr) {
        debug!("Failed to parse STUN message from {}: {}", source, err);

        if header.class() != MessageClass::Request || matches!(err, StunError::FingerprintMismatch) {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let request_type = header
            .message_type()
            .unwrap_or(MessageType::new(Method::Binding, MessageClass::Request));
        let request = Message::new(request_type, header.transaction_id);
        let response = self.error_response(&request, &TurnError::Stun(err));

        self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
        match self.encode_as(response, header.error_type_value(), None) {
            Ok(bytes) => self.send_raw(&bytes, source).await,
            Err(e) => error!("Failed to encode response for {}: {}", source, e),
        }
    }

    #[instrument(skip(self, request, raw), fields(method = ?request.message_type.method), level = "debug")]
    async fn handle_authenticated_request(&self, request: &Message, raw: &[u8], source: SocketAddr) {
        let now = self.clock.now();

        let auth = match self.auth.authenticate(request, raw, source, now).await {
            Ok(auth) => auth,
            Err(e) => {
                self.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
                let rechallenge = matches!(
                    e,
                    AuthError::Unauthorized | AuthError::StaleNonce | AuthError::IntegrityFailure | AuthError::UnknownUser(_)
                );
                let mut response = self.error_response(request, &TurnError::Auth(e));
                if rechallenge {
                    let (realm, nonce) = self.auth.challenge(source, now);
                    response.add_attribute(Attribute::realm(realm));
                    response.add_attribute(Attribute::nonce(nonce.into_bytes()));
                }
                self.send_message(response, None, source).await;
                return;
            }
        };

        let five_tuple = self.five_tuple(source);
        let result = match request.message_type.method {
            Method::Allocate => self.handle_allocate(request, five_tuple, &auth),
            Method::Refresh => self.handle_refresh(request, five_tuple, &auth),
            Method::CreatePermission => self.handle_create_permission(request, five_tuple, &auth),
            Method::ChannelBind => self.handle_channel_bind(request, five_tuple, &auth),
            method => Err(TurnError::BadRequest(format!("{:?} is not a request method", method))),
        };

        match result {
            Ok(Reply::Message(response)) => self.send_message(response, Some(&auth.key), source).await,
            Ok(Reply::Raw(bytes)) => self.send_raw(&bytes, source).await,
            Err(e) => {
                let (code, _) = e.error_code();
                if code >= 500 {
                    warn!("{:?} from {} failed: {}", request.message_type.method, source, e);
                } else {
                    debug!("{:?} from {} rejected: {}", request.message_type.method, source, e);
                }
                let response = self.error_response(request, &e);
                self.send_message(response, Some(&auth.key), source).await;
            }
        }
    }

    #[instrument(skip(self, request, auth), fields(user = %auth.username), level = "debug")]
    fn handle_allocate(&self, request: &Message, five_tuple: FiveTuple, auth: &Authenticated) -> TurnResult<Reply> {
        if let Some(existing) = self.table.get(&five_tuple) {
            // Retransmission of the request that created it
            if existing.username == auth.username {
                if let Some(cached) = existing.cached_response(request.transaction_id) {
                    debug!("Replaying Allocate response for {}", five_tuple);
                    return Ok(Reply::Raw(cached));
                }
            }
            return Err(TurnError::AllocationExists(five_tuple.client));
        }

        match request.requested_transport() {
            Some(PROTOCOL_UDP) => {}
            Some(protocol) => return Err(TurnError::UnsupportedTransport(protocol)),
            None => return Err(TurnError::BadRequest("missing REQUESTED-TRANSPORT".into())),
        }

        let lifetime = self.config.grant_lifetime(request.lifetime());
        let (allocation, endpoint) = self.table.create(five_tuple, &auth.username, lifetime)?;

        let response = self
            .success_response(request)
            .with(Attribute::xor_relayed_address(allocation.relay_addr))
            .with(Attribute::lifetime(lifetime.as_secs() as u32))
            .with(Attribute::xor_mapped_address(five_tuple.client));
        let encoded = match self.encode(response, Some(&auth.key)) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.table.delete(&five_tuple);
                return Err(e);
            }
        };
        allocation.set_cached_response(request.transaction_id, encoded.clone());

        tokio::spawn(relay::run(
            five_tuple,
            endpoint,
            self.table.clone(),
            self.socket.clone(),
            self.stats.clone(),
        ));
        self.stats.allocations_created.fetch_add(1, Ordering::Relaxed);

        Ok(Reply::Raw(encoded))
    }

    fn handle_refresh(&self, request: &Message, five_tuple: FiveTuple, auth: &Authenticated) -> TurnResult<Reply> {
        self.owned_allocation(five_tuple, auth)?;

        let lifetime = match request.lifetime() {
            Some(0) => Duration::ZERO,
            requested => self.config.grant_lifetime(requested),
        };
        self.table.refresh(&five_tuple, lifetime)?;

        Ok(Reply::Message(
            self.success_response(request)
                .with(Attribute::lifetime(lifetime.as_secs() as u32)),
        ))
    }

    fn handle_create_permission(
        &self,
        request: &Message,
        five_tuple: FiveTuple,
        auth: &Authenticated,
    ) -> TurnResult<Reply> {
        let allocation = self.owned_allocation(five_tuple, auth)?;

        let peers = request.peer_addresses();
        if peers.is_empty() {
            return Err(TurnError::BadRequest("missing XOR-PEER-ADDRESS".into()));
        }
        let peer_ips = peers
            .into_iter()
            .map(|peer| self.check_peer(&allocation, peer).map(|_| peer.ip()))
            .collect::<TurnResult<Vec<_>>>()?;

        allocation.permissions().permit_all(&peer_ips, self.clock.now())?;
        debug!("Installed permissions {:?} on {}", peer_ips, allocation.relay_addr);

        Ok(Reply::Message(self.success_response(request)))
    }

    fn handle_channel_bind(&self, request: &Message, five_tuple: FiveTuple, auth: &Authenticated) -> TurnResult<Reply> {
        let allocation = self.owned_allocation(five_tuple, auth)?;

        let channel = request
            .channel_number()
            .ok_or_else(|| TurnError::BadRequest("missing CHANNEL-NUMBER".into()))?;
        let peer = request
            .address(AttributeType::XorPeerAddress)
            .ok_or_else(|| TurnError::BadRequest("missing XOR-PEER-ADDRESS".into()))?;
        self.check_peer(&allocation, peer)?;

        allocation.permissions().bind(channel, peer, self.clock.now())?;
        info!("Bound channel {:#06x} for {} -> {}", channel, five_tuple.client, peer);

        Ok(Reply::Message(self.success_response(request)))
    }

    fn handle_send_indication(&self, indication: &Message, source: SocketAddr) {
        let Some(allocation) = self.table.get(&self.five_tuple(source)) else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Send indication from {} without allocation", source);
            return;
        };
        let (Some(peer), Some(data)) = (indication.address(AttributeType::XorPeerAddress), indication.data()) else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Send indication from {} missing XOR-PEER-ADDRESS or DATA", source);
            return;
        };

        self.relay_to_peer(&allocation, peer, data.clone());
    }

    fn handle_channel_data(&self, datagram: Bytes, source: SocketAddr) {
        self.stats.channel_data.fetch_add(1, Ordering::Relaxed);

        let channel_data = match ChannelData::decode(datagram) {
            Ok(channel_data) => channel_data,
            Err(e) => {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Malformed ChannelData from {}: {}", source, e);
                return;
            }
        };
        let Some(allocation) = self.table.get(&self.five_tuple(source)) else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let peer = allocation
            .permissions()
            .peer_for_channel(channel_data.channel, self.clock.now());
        let Some(peer) = peer else {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("ChannelData on unbound channel {:#06x} from {}", channel_data.channel, source);
            return;
        };

        self.relay_to_peer(&allocation, peer, channel_data.payload);
    }

    fn relay_to_peer(&self, allocation: &Allocation, peer: SocketAddr, payload: Bytes) {
        if let Err(e) = relay::send(allocation, peer, payload, self.clock.now()) {
            self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped data from {} to {}: {}", allocation.five_tuple.client, peer, e);
        }
    }

    /// Allocation for `five_tuple`, which must belong to the caller
    fn owned_allocation(&self, five_tuple: FiveTuple, auth: &Authenticated) -> TurnResult<Arc<Allocation>> {
        let allocation = self.table.get(&five_tuple).ok_or(TurnError::AllocationMismatch)?;
        if allocation.username != auth.username {
            return Err(TurnError::WrongCredentials);
        }
        Ok(allocation)
    }

    /// Peer must match the relay's address family and pass the filter
    fn check_peer(&self, allocation: &Allocation, peer: SocketAddr) -> TurnResult<()> {
        if peer.is_ipv4() != allocation.relay_addr.is_ipv4() {
            return Err(TurnError::PeerAddressFamilyMismatch(peer));
        }
        if !self.filter.is_allowed(peer.ip()) {
            return Err(TurnError::PeerForbidden(peer));
        }
        Ok(())
    }

    fn success_response(&self, request: &Message) -> Message {
        Message::new(request.message_type.success(), request.transaction_id)
    }

    fn error_response(&self, request: &Message, err: &TurnError) -> Message {
        let error_type: MessageType = request.message_type.error();
        let response = Message::new(error_type, request.transaction_id);

        if err.is_capacity() && request.message_type.method == Method::Allocate {
            if let Some(alternate) = self.config.alternate_server {
                return response
                    .with(Attribute::error_code(300, "Try Alternate"))
                    .with(Attribute::alternate_server(alternate));
            }
        }

        let (code, reason) = err.error_code();
        let response = response.with(Attribute::error_code(code, reason));
        match err {
            TurnError::Stun(StunError::UnknownComprehensionRequired(codes)) => {
                response.with(Attribute::unknown_attributes(codes.clone()))
            }
            _ => response,
        }
    }

    /// Encode with SOFTWARE, optional MESSAGE-INTEGRITY and FINGERPRINT
    fn encode(&self, message: Message, key: Option<&[u8]>) -> TurnResult<Bytes> {
        let type_value = message.message_type.value();
        self.encode_as(message, type_value, key)
    }

    fn encode_as(&self, mut message: Message, type_value: u16, key: Option<&[u8]>) -> TurnResult<Bytes> {
        if let Some(software) = self.config.software() {
            message.add_attribute(Attribute::software(software));
        }
        Ok(message.encode_as(type_value, key, self.config.fingerprint)?)
    }

    async fn send_message(&self, message: Message, key: Option<&[u8]>, dest: SocketAddr) {
        if message.message_type.class == MessageClass::ErrorResponse {
            self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
        }

        match self.encode(message, key) {
            Ok(bytes) => self.send_raw(&bytes, dest).await,
            Err(e) => error!("Failed to encode response for {}: {}", dest, e),
        }
    }

    async fn send_raw(&self, bytes: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, dest).await {
            debug!("Failed to send response to {}: {}", dest, e);
        }
    }
}
