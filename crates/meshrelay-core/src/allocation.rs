//! Allocation Table
//!
//! Process-local bookkeeping for pending rendezvous. Each allocation pairs a
//! stream id with its token, the two authorized peer ids, and slots for the
//! two TCP connections. The table is owned by the manager; there is no
//! process-global state.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshrelay_proto::PeerId;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::TOKEN_LEN;

/// Allocation lifecycle, derived from side presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// Neither side has arrived
    Allocated,
    /// Exactly one side is connected
    HalfConnected,
    /// Both sides met; the bridge owns the connections
    Bridged,
}

/// Which role a connecting peer matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Server,
    Client,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Server => write!(f, "server"),
            Side::Client => write!(f, "client"),
        }
    }
}

/// Outcome of installing a connection into an allocation
#[derive(Debug)]
pub(crate) enum Installed {
    /// First side stored; waiting for the counterparty
    Waiting,
    /// Both sides present; connections detached for the bridge
    Ready { server: TcpStream, client: TcpStream },
}

#[derive(Default)]
struct Sides {
    server: Option<TcpStream>,
    client: Option<TcpStream>,
    bridged: bool,
}

/// One active rendezvous
pub(crate) struct Allocation {
    pub(crate) stream_id: u64,
    pub(crate) token: [u8; TOKEN_LEN],
    pub(crate) server_peer: PeerId,
    pub(crate) client_peer: PeerId,
    created_at: Instant,
    ttl: Duration,
    // Guards side installation independently of the table lock, so
    // table-wide operations never wait behind connection handling
    sides: Mutex<Sides>,
}

impl Allocation {
    pub(crate) fn new(
        stream_id: u64,
        token: [u8; TOKEN_LEN],
        server_peer: PeerId,
        client_peer: PeerId,
        ttl: Duration,
    ) -> Self {
        Self {
            stream_id,
            token,
            server_peer,
            client_peer,
            created_at: Instant::now(),
            ttl,
            sides: Mutex::new(Sides::default()),
        }
    }

    /// Which side `peer` may claim; the server side wins when the two
    /// configured ids collide.
    pub(crate) fn side_of(&self, peer: &PeerId) -> Option<Side> {
        if *peer == self.server_peer {
            Some(Side::Server)
        } else if *peer == self.client_peer {
            Some(Side::Client)
        } else {
            None
        }
    }

    /// Install a connection into `side`.
    ///
    /// A slot, once filled, is never overwritten; a second handshake for an
    /// occupied side is rejected without touching it. When the second slot
    /// fills, both connections are detached together for the bridge and the
    /// allocation stays behind only as a `Bridged` marker.
    pub(crate) async fn install(&self, side: Side, conn: TcpStream) -> RelayResult<Installed> {
        let mut sides = self.sides.lock().await;

        if sides.bridged {
            return Err(RelayError::SideAlreadyBridged);
        }
        let slot = match side {
            Side::Server => &mut sides.server,
            Side::Client => &mut sides.client,
        };
        if slot.is_some() {
            return Err(RelayError::SideAlreadyBridged);
        }
        *slot = Some(conn);

        if sides.server.is_none() || sides.client.is_none() {
            return Ok(Installed::Waiting);
        }
        sides.bridged = true;
        let server = sides.server.take().expect("both sides present");
        let client = sides.client.take().expect("both sides present");
        Ok(Installed::Ready { server, client })
    }

    /// Derived lifecycle state
    pub(crate) async fn state(&self) -> AllocationState {
        let sides = self.sides.lock().await;
        if sides.bridged {
            AllocationState::Bridged
        } else if sides.server.is_some() || sides.client.is_some() {
            AllocationState::HalfConnected
        } else {
            AllocationState::Allocated
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Concurrency-safe map of live allocations
#[derive(Default)]
pub(crate) struct AllocationTable {
    entries: RwLock<HashMap<u64, Arc<Allocation>>>,
}

impl AllocationTable {
    /// Insert if the stream id is free. Returns false on collision.
    pub(crate) async fn insert_new(&self, alloc: Arc<Allocation>) -> bool {
        let mut entries = self.entries.write().await;
        match entries.entry(alloc.stream_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(alloc);
                true
            }
        }
    }

    pub(crate) async fn lookup(&self, stream_id: u64) -> Option<Arc<Allocation>> {
        self.entries.read().await.get(&stream_id).cloned()
    }

    pub(crate) async fn remove(&self, stream_id: u64) -> Option<Arc<Allocation>> {
        self.entries.write().await.remove(&stream_id)
    }

    pub(crate) async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Reap expired allocations that never bridged, closing any
    /// half-connected side. Bridged allocations are left alone regardless of
    /// age; the bridge controls their lifetime.
    pub(crate) async fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().await;
        let mut reaped = Vec::new();
        for (id, alloc) in entries.iter() {
            if !alloc.expired(now) {
                continue;
            }
            // The bridged check and the slot drain happen under the
            // allocation's own lock; a bridge that wins the race to start
            // can never be reaped here
            let mut sides = alloc.sides.lock().await;
            if sides.bridged {
                continue;
            }
            sides.server = None;
            sides.client = None;
            reaped.push(*id);
        }
        for id in &reaped {
            entries.remove(id);
        }
        if !reaped.is_empty() {
            debug!("Reaped {} expired allocations", reaped.len());
        }
        reaped.len()
    }

    /// Drain every allocation on shutdown; dropping the stored connections
    /// closes them.
    pub(crate) async fn close_all(&self) {
        self.entries.write().await.clear();
    }
}
