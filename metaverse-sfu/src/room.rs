//! SFU Room management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::engine::RtpCapabilities;
use crate::error::{Error, Result};
use crate::peer::{ClosedResources, Peer, PeerStats, Producer};
use crate::signaling::ServerEvent;
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, RouterId, TransportId, WorkerId};
use crate::worker::Worker;

/// Room lifecycle
///
/// `Destroyed` is terminal. A later join with the same id gets a new room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Empty,
    Active,
    Destroyed,
}

/// The room's router and the worker hosting it
#[derive(Debug)]
pub struct RouterBinding {
    pub router_id: RouterId,
    pub worker: Arc<Worker>,
    pub rtp_capabilities: RtpCapabilities,
}

/// Mutable room state, guarded by the room lock
#[derive(Debug)]
pub struct RoomState {
    phase: RoomPhase,
    peers: HashMap<PeerId, Peer>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            phase: RoomPhase::Empty,
            peers: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.phase = RoomPhase::Destroyed;
    }

    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self.phase, RoomPhase::Destroyed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Result<&Peer> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.clone()))
    }

    pub fn peer_mut(&mut self, peer_id: &PeerId) -> Result<&mut Peer> {
        self.peers
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.clone()))
    }

    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<&Producer> {
        self.peers.values().find_map(|peer| peer.producers.get(producer_id))
    }

    /// Send an event to every peer except `except`
    pub fn broadcast(&self, except: Option<&PeerId>, event: &ServerEvent) {
        for peer in self.peers.values() {
            if Some(&peer.id) != except {
                peer.notify(event.clone());
            }
        }
    }

    /// Attach a peer
    ///
    /// Existing peers learn about the newcomer, and the newcomer receives a
    /// `newProducer` for every producer already in the room.
    pub fn add_peer(&mut self, peer: Peer, max_peers: usize, room_id: &RoomId) -> Result<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(Error::PeerAlreadyJoined(peer.id));
        }
        if max_peers > 0 && self.peers.len() >= max_peers {
            return Err(Error::RoomFull(room_id.clone()));
        }

        self.broadcast(None, &ServerEvent::PeerJoined { peer_id: peer.id.clone() });

        for producer in self.peers.values().flat_map(|p| p.producers.values()) {
            peer.notify(ServerEvent::NewProducer {
                producer_id: producer.id.clone(),
                peer_id: producer.peer_id.clone(),
                kind: producer.kind,
            });
        }

        self.peers.insert(peer.id.clone(), peer);
        self.phase = RoomPhase::Active;
        Ok(())
    }

    /// Register a producer and announce it to everyone else
    pub fn add_producer(&mut self, producer: Producer) -> Result<()> {
        let event = ServerEvent::NewProducer {
            producer_id: producer.id.clone(),
            peer_id: producer.peer_id.clone(),
            kind: producer.kind,
        };
        let owner = producer.peer_id.clone();
        self.peer_mut(&owner)?
            .producers
            .insert(producer.id.clone(), producer);
        self.broadcast(Some(&owner), &event);
        Ok(())
    }

    /// Close every consumer of a producer owned by `owner`
    ///
    /// Each other peer gets exactly one `producerClosed`.
    fn cascade_producer(&mut self, owner: &PeerId, producer_id: &ProducerId) -> Vec<ConsumerId> {
        let mut consumers = Vec::new();
        for peer in self.peers.values_mut() {
            if &peer.id == owner {
                continue;
            }
            consumers.extend(peer.remove_consumers_of(producer_id));
            peer.notify(ServerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            });
        }
        consumers
    }

    /// Close a producer owned by `owner` together with its consumers
    pub fn close_producer(&mut self, owner: &PeerId, producer_id: &ProducerId) -> Result<ClosedResources> {
        let peer = self.peer_mut(owner)?;
        if peer.producers.remove(producer_id).is_none() {
            return Err(Error::ProducerNotFound(producer_id.clone()));
        }

        Ok(ClosedResources {
            consumers: self.cascade_producer(owner, producer_id),
            producers: vec![producer_id.clone()],
            transports: Vec::new(),
        })
    }

    /// Close one of a peer's transports and everything riding on it
    pub fn close_transport(&mut self, peer_id: &PeerId, transport_id: &TransportId) -> Result<ClosedResources> {
        let peer = self.peer_mut(peer_id)?;
        let (transport, producers, consumers) = peer
            .take_transport(transport_id)
            .ok_or_else(|| Error::TransportNotFound(transport_id.clone()))?;
        for producer_id in &producers {
            peer.producers.remove(producer_id);
        }

        let mut closed = ClosedResources {
            consumers,
            producers: Vec::new(),
            transports: vec![transport.id],
        };
        for producer_id in producers {
            closed.consumers.extend(self.cascade_producer(peer_id, &producer_id));
            closed.producers.push(producer_id);
        }
        Ok(closed)
    }

    /// Detach a peer, cascading its producers and announcing its departure
    ///
    /// Returns `None` if the peer is not in the room.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<ClosedResources> {
        let mut peer = self.peers.remove(peer_id)?;

        let mut closed = ClosedResources::default();
        let producer_ids: Vec<ProducerId> = peer.producers.drain().map(|(id, _)| id).collect();
        for producer_id in producer_ids {
            closed.consumers.extend(self.cascade_producer(peer_id, &producer_id));
            closed.producers.push(producer_id);
        }
        closed.merge(peer.drain_own());

        self.broadcast(None, &ServerEvent::PeerLeft { peer_id: peer_id.clone() });

        if self.peers.is_empty() {
            self.phase = RoomPhase::Empty;
        }
        Some(closed)
    }

    /// Drop every peer, telling each one the room is gone
    pub fn close_all(&mut self, room_id: &RoomId, reason: &str) -> usize {
        let count = self.peers.len();
        for (_, mut peer) in self.peers.drain() {
            peer.drain_own();
            peer.notify(ServerEvent::RoomClosed {
                room_id: room_id.clone(),
                reason: reason.to_string(),
            });
        }
        count
    }
}

/// A session namespace sharing one router
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    router: OnceLock<RouterBinding>,
    state: Arc<Mutex<RoomState>>,
    created_at: DateTime<Utc>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId) -> Arc<Self> {
        Arc::new(Self {
            id,
            router: OnceLock::new(),
            state: Arc::new(Mutex::new(RoomState::new())),
            created_at: Utc::now(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire the room lock
    pub async fn lock(&self) -> OwnedMutexGuard<RoomState> {
        Arc::clone(&self.state).lock_owned().await
    }

    /// The room's router, bound once for the room's whole lifetime
    #[must_use]
    pub fn router(&self) -> Option<&RouterBinding> {
        self.router.get()
    }

    pub fn binding(&self) -> Result<&RouterBinding> {
        self.router
            .get()
            .ok_or_else(|| Error::RoomNotFound(self.id.clone()))
    }

    pub(crate) fn bind_router(&self, binding: RouterBinding) -> bool {
        self.router.set(binding).is_ok()
    }

    #[must_use]
    pub fn worker_id(&self) -> Option<&WorkerId> {
        self.router().map(|binding| binding.worker.id())
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.lock().await;
        let mut peers: Vec<PeerStats> = state.peers.values().map(Peer::stats).collect();
        peers.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        RoomStats {
            room_id: self.id.clone(),
            worker_id: self.worker_id().cloned(),
            phase: state.phase,
            peer_count: state.peers.len(),
            transport_count: state.peers.values().map(|p| p.transports.len()).sum(),
            producer_count: state.peers.values().map(|p| p.producers.len()).sum(),
            consumer_count: state.peers.values().map(|p| p.consumers.len()).sum(),
            created_at: self.created_at,
            peers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub worker_id: Option<WorkerId>,
    pub phase: RoomPhase,
    pub peer_count: usize,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
    pub created_at: DateTime<Utc>,
    /// Oldest member first
    pub peers: Vec<PeerStats>,
}
