//! Relay Manager
//!
//! Owns the allocation table and runs the TCP data plane: accept a
//! connection, authenticate its handshake against an allocation, park it
//! until the counterparty arrives, then hand both to the bridge. A
//! background collector reaps rendezvous whose TTL ran out before they
//! bridged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshrelay_proto::frame::{self, FRAME_TYPE_HANDSHAKE_ACK, FRAME_TYPE_HANDSHAKE_REQUEST};
use meshrelay_proto::messages::{HandshakeAck, HandshakeRequest};
use meshrelay_proto::{PeerId, ProtoError};
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::allocation::{Allocation, AllocationState, AllocationTable, Installed};
use crate::bridge;
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::TOKEN_LEN;

/// Everything a peer needs to reach its rendezvous
#[derive(Debug, Clone)]
pub struct StreamGrant {
    /// Stream id of the allocation
    pub stream_id: u64,
    /// Shared secret; also the HMAC key for the handshake frames
    pub token: [u8; TOKEN_LEN],
    /// Endpoint the peers must dial
    pub endpoint: String,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// TCP relay data plane for one process
pub struct RelayManager {
    config: RelayConfig,
    table: Arc<AllocationTable>,
    running: Mutex<Option<Running>>,
}

impl RelayManager {
    /// Create a stopped manager
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            table: Arc::new(AllocationTable::default()),
            running: Mutex::new(None),
        }
    }

    /// Mint an allocation for the (server, client) pair and return its
    /// handle. Never blocks on network I/O; fails only if the OS randomness
    /// source does.
    pub async fn create_stream(
        &self,
        server_peer: PeerId,
        client_peer: PeerId,
        ttl: Option<Duration>,
    ) -> RelayResult<StreamGrant> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut token = [0u8; TOKEN_LEN];
        OsRng.try_fill_bytes(&mut token)?;

        // Collisions in the 64-bit id space are improbable but not
        // impossible; check-and-retry on insert
        loop {
            let stream_id = OsRng.next_u64();
            let alloc = Arc::new(Allocation::new(
                stream_id,
                token,
                server_peer.clone(),
                client_peer.clone(),
                ttl,
            ));
            if self.table.insert_new(alloc).await {
                debug!(
                    "Allocated stream {} for server={} client={} ttl={:?}",
                    stream_id, server_peer, client_peer, ttl
                );
                return Ok(StreamGrant {
                    stream_id,
                    token,
                    endpoint: self.endpoint().await,
                });
            }
        }
    }

    /// Start the acceptor and the TTL collector.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> RelayResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Relay manager listening on {}", local_addr);

        let tracker = TaskTracker::new();

        let manager = self.clone();
        let accept_cancel = cancel.clone();
        let accept_tracker = tracker.clone();
        tracker.spawn(async move {
            manager.accept_loop(listener, accept_cancel, accept_tracker).await;
        });

        let manager = self.clone();
        let sweep_cancel = cancel.clone();
        tracker.spawn(async move {
            manager.collector_loop(sweep_cancel).await;
        });

        *running = Some(Running {
            cancel,
            tracker,
            local_addr,
        });
        Ok(())
    }

    /// Stop everything: cancel, wait for handlers and bridges, close every
    /// remaining allocation. Idempotent after the first call.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return;
        };

        info!("Stopping relay manager");
        running.cancel.cancel();
        running.tracker.close();
        running.tracker.wait().await;
        self.table.close_all().await;
        info!("Relay manager stopped");
    }

    /// Bound data-plane address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Lifecycle state of one allocation, if it is still live
    pub async fn stream_state(&self, stream_id: u64) -> Option<AllocationState> {
        let alloc = self.table.lookup(stream_id).await?;
        Some(alloc.state().await)
    }

    /// Number of live allocations
    pub async fn allocation_count(&self) -> usize {
        self.table.len().await
    }

    async fn endpoint(&self) -> String {
        if let Some(endpoint) = &self.config.endpoint {
            return endpoint.clone();
        }
        match self.running.lock().await.as_ref() {
            Some(running) => running.local_addr.to_string(),
            None => self.config.listen_addr.to_string(),
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((conn, addr)) => {
                        debug!("Accepted data-plane connection from {}", addr);
                        conn
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            let manager = self.clone();
            let conn_cancel = cancel.clone();
            let conn_tracker = tracker.clone();
            tracker.spawn(async move {
                if let Err(e) = manager.handle_conn(conn, conn_cancel, conn_tracker).await {
                    debug!("Handshake failed: {}", e);
                }
            });
        }
        debug!("Acceptor stopped");
    }

    /// Authenticate one inbound connection and install it into its
    /// allocation. The failure acks are deliberate: the counterparty's
    /// control plane surfaces a meaningful error instead of a bare hangup.
    async fn handle_conn(
        &self,
        mut conn: TcpStream,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> RelayResult<()> {
        let (header, data, tag) =
            frame::read_frame(&mut conn, self.config.handshake_timeout).await?;
        if header.frame_type != FRAME_TYPE_HANDSHAKE_REQUEST {
            return Err(RelayError::UnexpectedFrame(header.frame_type));
        }
        let req = HandshakeRequest::decode(data.as_slice()).map_err(ProtoError::from)?;

        let Some(alloc) = self.table.lookup(req.stream_id).await else {
            debug!("Handshake for unknown stream {}", req.stream_id);
            // No token exists for this ack; sign with zeros so the peer
            // fails verification and treats it as a connection error
            let _ = send_ack(&mut conn, &[0u8; TOKEN_LEN], false, "no such stream").await;
            return Err(RelayError::AllocationNotFound(req.stream_id));
        };

        if let Err(e) = frame::verify_frame(&header, &data, &tag, &alloc.token) {
            let _ = send_ack(&mut conn, &alloc.token, false, "hmac mismatch").await;
            return Err(e.into());
        }

        let sender = PeerId::from_bytes(req.sender_peer_id);
        let Some(side) = alloc.side_of(&sender) else {
            warn!(
                "Stream {}: sender {} matches neither server {} nor client {}",
                req.stream_id, sender, alloc.server_peer, alloc.client_peer
            );
            return Err(RelayError::BadPeer);
        };

        send_ack(&mut conn, &alloc.token, true, "").await?;

        match alloc.install(side, conn).await? {
            Installed::Waiting => {
                debug!(
                    "Stream {}: {} side connected, waiting for counterparty",
                    req.stream_id, side
                );
            }
            Installed::Ready { server, client } => {
                info!("Stream {}: both sides connected, bridging", req.stream_id);
                let table = self.table.clone();
                tracker.spawn(bridge::run(req.stream_id, server, client, table, cancel));
            }
        }
        Ok(())
    }

    async fn collector_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.table.sweep_expired(Instant::now()).await;
                }
            }
        }
        debug!("TTL collector stopped");
    }
}

async fn send_ack(conn: &mut TcpStream, token: &[u8], ok: bool, error: &str) -> RelayResult<()> {
    let ack = HandshakeAck {
        ok,
        error: error.to_string(),
    };
    frame::write_frame(conn, FRAME_TYPE_HANDSHAKE_ACK, token, &ack.encode_to_vec()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{self, StreamInfo};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_manager(sweep_interval: Duration) -> (Arc<RelayManager>, CancellationToken) {
        let config = RelayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            sweep_interval,
            ..Default::default()
        };
        let manager = Arc::new(RelayManager::new(config));
        let cancel = CancellationToken::new();
        manager.start(cancel.clone()).await.unwrap();
        (manager, cancel)
    }

    fn stream_info(grant: &StreamGrant, peer: &str) -> StreamInfo {
        StreamInfo {
            endpoint: grant.endpoint.clone(),
            stream_id: grant.stream_id,
            token: grant.token,
            peer_id: PeerId::from_bytes(peer.as_bytes()),
        }
    }

    async fn grant(manager: &RelayManager, ttl: Duration) -> StreamGrant {
        manager
            .create_stream(
                PeerId::from_bytes(&b"S"[..]),
                PeerId::from_bytes(&b"C"[..]),
                Some(ttl),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bridge_happy_path() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let grant = grant(&manager, Duration::from_secs(60)).await;

        let mut server_side = client::connect(&stream_info(&grant, "S")).await.unwrap();
        let mut client_side = client::connect(&stream_info(&grant, "C")).await.unwrap();

        server_side.write_all(b"HELLO").await.unwrap();
        let mut buf = [0u8; 5];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");

        client_side.write_all(b"WORLD").await.unwrap();
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"WORLD");

        // Closing one side ends the tunnel; the other side sees EOF and the
        // bridge drops the allocation
        drop(server_side);
        let mut rest = Vec::new();
        client_side.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.allocation_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_stream_gets_zero_signed_nack() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let addr = manager.local_addr().await.unwrap();

        let info = StreamInfo {
            endpoint: addr.to_string(),
            stream_id: 999,
            token: [0xAA; TOKEN_LEN],
            peer_id: PeerId::from_bytes(&b"S"[..]),
        };
        let mut conn = TcpStream::connect(addr).await.unwrap();
        client::send_handshake(&mut conn, &info).await.unwrap();

        let (header, data, tag) = frame::read_frame(&mut conn, Duration::from_secs(1))
            .await
            .unwrap();
        // Nack is signed with a zero token, so it verifies against zeros
        // and against nothing else
        frame::verify_frame(&header, &data, &tag, &[0u8; TOKEN_LEN]).unwrap();
        assert!(frame::verify_frame(&header, &data, &tag, &info.token).is_err());

        let ack = HandshakeAck::decode(data.as_slice()).unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.error, "no such stream");

        assert_eq!(manager.allocation_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_hmac_mismatch_gets_real_signed_nack() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let grant = grant(&manager, Duration::from_secs(60)).await;

        let mut forged = stream_info(&grant, "S");
        forged.token = [0x55; TOKEN_LEN];
        let mut conn = TcpStream::connect(grant.endpoint.as_str()).await.unwrap();
        client::send_handshake(&mut conn, &forged).await.unwrap();

        let (header, data, tag) = frame::read_frame(&mut conn, Duration::from_secs(1))
            .await
            .unwrap();
        frame::verify_frame(&header, &data, &tag, &grant.token).unwrap();
        let ack = HandshakeAck::decode(data.as_slice()).unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.error, "hmac mismatch");

        // Side slots stay empty; a correctly signed handshake still works
        assert_eq!(
            manager.stream_state(grant.stream_id).await,
            Some(AllocationState::Allocated)
        );
        let _server_side = client::connect(&stream_info(&grant, "S")).await.unwrap();
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_sender_closed_without_ack() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let grant = grant(&manager, Duration::from_secs(60)).await;

        let err = client::connect(&stream_info(&grant, "Z")).await.unwrap_err();
        // The relay hangs up silently; the client sees EOF, not a nack
        assert!(matches!(err, RelayError::Proto(ProtoError::Io(_))));

        assert_eq!(
            manager.stream_state(grant.stream_id).await,
            Some(AllocationState::Allocated)
        );
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_occupied_side_rejects_second_arrival() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let grant = grant(&manager, Duration::from_secs(60)).await;

        let _first = client::connect(&stream_info(&grant, "S")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The ack precedes side installation, so the duplicate gets an OK
        // ack and is then hung up on without consuming the slot
        let mut second = client::connect(&stream_info(&grant, "S")).await.unwrap();
        let mut buf = Vec::new();
        second.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        assert_eq!(
            manager.stream_state(grant.stream_id).await,
            Some(AllocationState::HalfConnected)
        );
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_ttl_reaps_unclaimed_allocation() {
        let (manager, _cancel) = start_manager(Duration::from_millis(50)).await;
        let grant = grant(&manager, Duration::from_millis(100)).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.allocation_count().await, 0);

        // A late arrival is told the stream no longer exists
        let err = client::connect(&stream_info(&grant, "S")).await.unwrap_err();
        assert!(matches!(err, RelayError::Proto(ProtoError::HmacMismatch)));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_ttl_never_disturbs_a_bridge() {
        let (manager, _cancel) = start_manager(Duration::from_millis(50)).await;
        let grant = grant(&manager, Duration::from_millis(100)).await;

        let mut server_side = client::connect(&stream_info(&grant, "S")).await.unwrap();
        let mut client_side = client::connect(&stream_info(&grant, "C")).await.unwrap();

        // Well past the TTL and several sweeps later the bridge is intact
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            manager.stream_state(grant.stream_id).await,
            Some(AllocationState::Bridged)
        );

        server_side.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");

        // Its own termination removes it
        drop(client_side);
        let mut rest = Vec::new();
        server_side.read_to_end(&mut rest).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.allocation_count().await, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (manager, cancel) = start_manager(Duration::from_secs(5)).await;
        let err = manager.start(cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::AlreadyRunning));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_table_and_is_idempotent() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let grant = grant(&manager, Duration::from_secs(60)).await;
        let _half = client::connect(&stream_info(&grant, "S")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.stop().await;
        assert_eq!(manager.allocation_count().await, 0);
        assert!(manager.local_addr().await.is_none());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_tears_down_running_bridge() {
        let (manager, _cancel) = start_manager(Duration::from_secs(5)).await;
        let grant = grant(&manager, Duration::from_secs(60)).await;

        let mut server_side = client::connect(&stream_info(&grant, "S")).await.unwrap();
        let _client_side = client::connect(&stream_info(&grant, "C")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.stop().await;
        // No bytes flow on previously bridged sides after stop
        let mut rest = Vec::new();
        server_side.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(manager.allocation_count().await, 0);
    }
}
