// src/turn/relay.rs
//! Relay data path
//!
//! Each allocation owns a relay socket driven by one task ([`run`]). The
//! task writes client traffic queued through [`send`] to peers, and wraps
//! peer datagrams into ChannelData or Data indications for the client.
//! The task holds only the allocation's five-tuple; it re-resolves the
//! allocation for every inbound datagram and stops when the allocation's
//! cancellation token fires.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::allocation_manager::{Allocation, AllocationTable};
use super::server::ServerStats;
use super::FiveTuple;
use crate::error::{TurnError, TurnResult};
use crate::stun::{Attribute, ChannelData, Message, MessageClass, MessageType, Method, TransactionId, MAX_MESSAGE_SIZE};

/// Datagrams queued per allocation before `send` starts dropping
pub const RELAY_QUEUE_DEPTH: usize = 256;

const DATA_INDICATION: MessageType = MessageType::new(Method::Data, MessageClass::Indication);

/// Client payload waiting to go out of the relay socket
#[derive(Debug)]
pub struct Outbound {
    pub peer: SocketAddr,
    pub payload: Bytes,
}

/// Dispatcher-side handle to an allocation's relay task
#[derive(Debug)]
pub struct RelayHandle {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl RelayHandle {
    pub(crate) fn new(tx: mpsc::Sender<Outbound>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Stop the relay task; its socket closes when the task exits
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Everything a relay task owns
#[derive(Debug)]
pub struct RelayEndpoint {
    pub socket: UdpSocket,
    pub rx: mpsc::Receiver<Outbound>,
    pub cancel: CancellationToken,
}

/// Queue a client payload for `peer`.
///
/// Requires a live permission for the peer IP, which this refreshes.
pub fn send(allocation: &Allocation, peer: SocketAddr, payload: Bytes, now: Instant) -> TurnResult<()> {
    if !allocation.permissions().refresh_permission(peer.ip(), now) {
        return Err(TurnError::NoPermission(peer));
    }

    if !allocation.consume_bandwidth(payload.len(), now) {
        return Err(TurnError::CapacityExceeded("bandwidth"));
    }

    allocation
        .relay()
        .tx
        .try_send(Outbound { peer, payload })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TurnError::RelayUnavailable("relay queue full"),
            mpsc::error::TrySendError::Closed(_) => TurnError::RelayUnavailable("relay closed"),
        })
}

/// Drive one allocation's relay socket until the allocation goes away
pub async fn run(
    key: FiveTuple,
    endpoint: RelayEndpoint,
    table: Arc<AllocationTable>,
    client_socket: Arc<UdpSocket>,
    stats: Arc<ServerStats>,
) {
    let RelayEndpoint { socket, mut rx, cancel } = endpoint;
    let mut buf = BytesMut::with_capacity(MAX_MESSAGE_SIZE);

    debug!("Relay task started for {}", key);

    loop {
        buf.clear();
        buf.reserve(MAX_MESSAGE_SIZE);

        tokio::select! {
            _ = cancel.cancelled() => break,

            outbound = rx.recv() => {
                let Some(Outbound { peer, payload }) = outbound else { break };
                match socket.send_to(&payload, peer).await {
                    Ok(sent) => {
                        stats.packets_to_peer.fetch_add(1, Ordering::Relaxed);
                        stats.bytes_to_peer.fetch_add(sent as u64, Ordering::Relaxed);
                        if let Some(allocation) = table.get(&key) {
                            allocation.stats.packets_to_peer.fetch_add(1, Ordering::Relaxed);
                            allocation.stats.bytes_to_peer.fetch_add(sent as u64, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("Relay send to {} failed for {}: {}", peer, key, e);
                    }
                }
            }

            received = socket.recv_buf_from(&mut buf) => {
                match received {
                    Ok((_, peer)) => {
                        let payload = buf.split().freeze();
                        if !forward_to_client(key, &table, &client_socket, &stats, peer, payload).await {
                            break;
                        }
                    }
                    Err(e) if is_transient(&e) => {
                        trace!("Relay socket for {} reported {}", key, e);
                    }
                    Err(e) => {
                        warn!("Relay socket for {} failed, tearing down allocation: {}", key, e);
                        table.delete(&key);
                        break;
                    }
                }
            }
        }
    }

    debug!("Relay task stopped for {}", key);
}

/// Wrap a peer datagram for the client. Returns false once the allocation
/// is gone or past its expiry.
async fn forward_to_client(
    key: FiveTuple,
    table: &AllocationTable,
    client_socket: &UdpSocket,
    stats: &ServerStats,
    peer: SocketAddr,
    payload: Bytes,
) -> bool {
    let Some(allocation) = table.get(&key) else {
        return false;
    };
    let now = table.now();

    let channel = {
        let mut permissions = allocation.permissions();
        if !permissions.refresh_permission(peer.ip(), now) {
            drop(permissions);
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Dropped datagram from unpermitted peer {} on {}", peer, allocation.relay_addr);
            return true;
        }
        permissions.channel_for_peer(peer, now)
    };

    if !allocation.consume_bandwidth(payload.len(), now) {
        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        return true;
    }

    let wrapped = match channel {
        Some(channel) => ChannelData::new(channel, payload).encode(),
        None => Message::new(DATA_INDICATION, TransactionId::new())
            .with(Attribute::xor_peer_address(peer))
            .with(Attribute::data(payload))
            .encode(None, false),
    };

    let wrapped = match wrapped {
        Ok(bytes) => bytes,
        Err(e) => {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Cannot wrap datagram from {} for {}: {}", peer, key, e);
            return true;
        }
    };

    match client_socket.send_to(&wrapped, key.client).await {
        Ok(sent) => {
            stats.packets_to_client.fetch_add(1, Ordering::Relaxed);
            stats.bytes_to_client.fetch_add(sent as u64, Ordering::Relaxed);
            allocation.stats.packets_to_client.fetch_add(1, Ordering::Relaxed);
            allocation.stats.bytes_to_client.fetch_add(sent as u64, Ordering::Relaxed);
        }
        Err(e) => {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Delivery to client {} failed: {}", key.client, e);
        }
    }

    true
}

/// ICMP errors surfaced on the next receive, not socket failures
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::allocation_manager::TableConfig;
    use crate::turn::clock::{Clock, ManualClock};
    use crate::turn::permission_channel_manager::PermissionPolicy;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::timeout;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    struct Fixture {
        table: Arc<AllocationTable>,
        clock: ManualClock,
        client: UdpSocket,
        server_socket: Arc<UdpSocket>,
        stats: Arc<ServerStats>,
    }

    async fn fixture(min_port: u16, bandwidth_limit: Option<u64>) -> Fixture {
        let clock = ManualClock::new();
        let config = TableConfig {
            relay_ip: LOCALHOST,
            advertised_ip: LOCALHOST,
            min_port,
            max_port: min_port + 49,
            max_allocations: 10,
            max_allocations_per_ip: 10,
            bandwidth_limit,
            permissions: PermissionPolicy::default(),
        };
        Fixture {
            table: Arc::new(AllocationTable::new(config, Arc::new(clock.clone()), CancellationToken::new())),
            clock,
            client: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server_socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            stats: Arc::new(ServerStats::default()),
        }
    }

    impl Fixture {
        fn start(&self) -> (Arc<Allocation>, tokio::task::JoinHandle<()>) {
            let key = FiveTuple::udp(
                self.client.local_addr().unwrap(),
                self.server_socket.local_addr().unwrap(),
            );
            let (allocation, endpoint) = self.table.create(key, "user", Duration::from_secs(600)).unwrap();
            let task = tokio::spawn(run(
                key,
                endpoint,
                self.table.clone(),
                self.server_socket.clone(),
                self.stats.clone(),
            ));
            (allocation, task)
        }

        async fn recv_client(&self) -> Option<Bytes> {
            let mut buf = vec![0u8; 2048];
            let (len, _) = timeout(Duration::from_millis(300), self.client.recv_from(&mut buf))
                .await
                .ok()?
                .ok()?;
            Some(Bytes::copy_from_slice(&buf[..len]))
        }
    }

    #[tokio::test]
    async fn test_send_requires_permission() {
        let fx = fixture(45000, None).await;
        let (allocation, _task) = fx.start();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(matches!(
            send(&allocation, peer, Bytes::from_static(b"x"), fx.clock.now()),
            Err(TurnError::NoPermission(_))
        ));

        allocation.permissions().permit(peer.ip(), fx.clock.now()).unwrap();
        send(&allocation, peer, Bytes::from_static(b"x"), fx.clock.now()).unwrap();
    }

    #[tokio::test]
    async fn test_round_trip_through_relay() {
        let fx = fixture(45100, None).await;
        let (allocation, _task) = fx.start();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        allocation.permissions().permit(peer_addr.ip(), fx.clock.now()).unwrap();

        send(&allocation, peer_addr, Bytes::from_static(b"ping"), fx.clock.now()).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), allocation.relay_addr.port());

        // No channel: Data indication
        peer.send_to(b"pong", from).await.unwrap();
        let raw = fx.recv_client().await.expect("data indication");
        let message = Message::decode(raw).unwrap();
        assert_eq!(message.message_type, DATA_INDICATION);
        assert_eq!(message.peer_addresses(), vec![peer_addr]);
        assert_eq!(message.data().unwrap().as_ref(), b"pong");

        // Bound channel: ChannelData
        allocation.permissions().bind(0x4001, peer_addr, fx.clock.now()).unwrap();
        peer.send_to(b"pong2", from).await.unwrap();
        let raw = fx.recv_client().await.expect("channel data");
        let channel_data = ChannelData::decode(raw).unwrap();
        assert_eq!(channel_data.channel, 0x4001);
        assert_eq!(channel_data.payload.as_ref(), b"pong2");
    }

    #[tokio::test]
    async fn test_unpermitted_peer_dropped() {
        let fx = fixture(45200, None).await;
        let (allocation, _task) = fx.start();

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"hello", allocation.relay_addr).await.unwrap();

        assert!(fx.recv_client().await.is_none());
        assert_eq!(fx.stats.packets_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_task_stops_on_delete() {
        let fx = fixture(45300, None).await;
        let (allocation, task) = fx.start();

        fx.table.delete(&allocation.five_tuple);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        // Socket closed with the task, so the port can be bound again
        std::net::UdpSocket::bind(SocketAddr::new(LOCALHOST, allocation.relay_addr.port())).unwrap();
    }

    #[tokio::test]
    async fn test_bandwidth_limit() {
        let fx = fixture(45400, Some(100)).await;
        let (allocation, _task) = fx.start();
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        allocation.permissions().permit(peer.ip(), fx.clock.now()).unwrap();

        send(&allocation, peer, Bytes::from(vec![0u8; 80]), fx.clock.now()).unwrap();
        assert!(matches!(
            send(&allocation, peer, Bytes::from(vec![0u8; 80]), fx.clock.now()),
            Err(TurnError::CapacityExceeded("bandwidth"))
        ));
    }
}
