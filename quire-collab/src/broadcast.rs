//! Room-scoped fan-out of full-document snapshots.
//!
//! Each room owns one tokio broadcast channel. Dispatch is a single
//! non-blocking `send`; every member holds its own receiver and its own
//! connection task performs the socket write, so a slow peer can only lag
//! its own receiver and never stalls delivery to the others.
//!
//! Ordering: a given peer observes snapshots in dispatch order. A peer that
//! falls more than `capacity` snapshots behind skips to the newest ones,
//! which under snapshot replication means a stale overwrite, not corruption.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock, RwLockWriteGuard};
use uuid::Uuid;

use crate::protocol::{Envelope, PeerInfo, ProtocolError, RoomKey};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters shared by a room and its subscriptions.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The live members of one (project, file) pair.
pub struct Room {
    /// Fan-out channel
    sender: broadcast::Sender<Envelope>,

    /// Connected peers in this room
    peers: RwLock<HashMap<Uuid, PeerInfo>>,

    /// Snapshots buffered per receiver before it starts lagging
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Deliver `content` to every member except `sender`.
    ///
    /// Returns the number of recipients. With no other members this is a
    /// no-op returning 0.
    pub async fn dispatch(&self, content: Arc<str>, sender: Uuid) -> usize {
        let peers = self.peers.read().await;
        let recipients = peers.len() - usize::from(peers.contains_key(&sender));
        if recipients == 0 {
            return 0;
        }

        // Send only fails when no receiver exists at all
        let _ = self.sender.send(Envelope { sender, content });
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        recipients
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A member's view of its room: yields snapshots sent by other members.
pub struct Subscription {
    key: RoomKey,
    peer_id: Uuid,
    rx: broadcast::Receiver<Envelope>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscription {
    /// Wait for the next snapshot from another peer.
    ///
    /// Own snapshots are skipped. Lag is logged and skipped over.
    pub async fn recv(&mut self) -> Result<Arc<str>, ProtocolError> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender == self.peer_id => continue,
                Ok(envelope) => return Ok(envelope.content),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return Err(ProtocolError::RoomClosed),
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.sender == self.peer_id => continue,
                Ok(envelope) => return Some(envelope.content),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
        log::warn!("Peer {} in room {} lagged by {n} snapshots", self.peer_id, self.key);
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }
}

/// Registry of live rooms, keyed by (project, file).
///
/// Owned by a server instance and shared with its connection handlers.
/// Rooms are created on first join and dropped when the last member leaves.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomKey, Arc<Room>>>,
    capacity: usize,
}

impl RoomRegistry {
    /// Create a registry whose rooms buffer `capacity` snapshots per member.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register `info` as a member of `key`, creating the room if needed.
    pub async fn join(&self, key: RoomKey, info: PeerInfo) -> Subscription {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Room::new(self.capacity)))
            .clone();
        self.enter(rooms, room, key, info).await
    }

    /// Like [`join`](Self::join), but refuses once the room holds `max_peers` members.
    pub async fn try_join(
        &self,
        key: RoomKey,
        info: PeerInfo,
        max_peers: usize,
    ) -> Result<Subscription, ProtocolError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Room::new(self.capacity)))
            .clone();
        if room.peer_count().await >= max_peers {
            if room.peer_count().await == 0 {
                rooms.remove(&key);
            }
            return Err(ProtocolError::RoomFull(max_peers));
        }
        Ok(self.enter(rooms, room, key, info).await)
    }

    // Holds the registry lock across insert so a concurrent leave cannot
    // drop the room between lookup and membership.
    async fn enter(
        &self,
        rooms: RwLockWriteGuard<'_, HashMap<RoomKey, Arc<Room>>>,
        room: Arc<Room>,
        key: RoomKey,
        info: PeerInfo,
    ) -> Subscription {
        let peer_id = info.peer_id;
        let rx = room.add_peer(info).await;
        drop(rooms);

        log::debug!("Peer {peer_id} joined room {key}");
        Subscription {
            key,
            peer_id,
            rx,
            stats: room.atomic_stats.clone(),
        }
    }

    /// Remove a member. Idempotent; returns whether the peer was present.
    pub async fn leave(&self, key: &RoomKey, peer_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(key) else {
            return false;
        };

        let removed = room.remove_peer(&peer_id).await.is_some();
        if room.peer_count().await == 0 {
            rooms.remove(key);
            log::debug!("Room {key} removed (empty)");
        }
        if removed {
            log::debug!("Peer {peer_id} left room {key}");
        }
        removed
    }

    /// Deliver `content` to every member of `key` except `sender`.
    ///
    /// Unknown or empty rooms are a no-op.
    pub async fn dispatch(&self, key: &RoomKey, content: Arc<str>, sender: Uuid) -> usize {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(key).cloned()
        };
        match room {
            Some(room) => room.dispatch(content, sender).await,
            None => 0,
        }
    }

    pub async fn room(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.read().await.get(key).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Member count of `key` (0 for unknown rooms).
    pub async fn peer_count(&self, key: &RoomKey) -> usize {
        match self.room(key).await {
            Some(room) => room.peer_count().await,
            None => 0,
        }
    }

    pub async fn active_rooms(&self) -> Vec<RoomKey> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
