//! SFU Manager - top-level orchestration of the media resource graph
//!
//! This module provides:
//! - Room join/leave on top of the registry
//! - Transport, producer and consumer negotiation against the media engine
//! - Isolation of worker failures to the rooms hosted on that worker
//! - Global statistics collection
//!
//! Every operation follows the same locking discipline: lock the room,
//! validate, release the lock before awaiting the engine, then re-lock and
//! re-validate before committing. Nothing awaits the engine under a room
//! lock except router creation and teardown in the registry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SfuConfig;
use crate::engine::{
    DtlsParameters, EngineEvent, EngineHandle, IceCandidate, IceParameters, MediaEngine,
    RtpCapabilities, RtpParameters, TransportOptions, TransportParameters,
};
use crate::error::{Error, Result};
use crate::peer::{ClosedResources, Consumer, ConsumerInfo, EventSink, Peer, Producer, Transport, TransportState};
use crate::registry::{RoomRegistry, REASON_SHUTDOWN, REASON_WORKER_UNAVAILABLE};
use crate::room::{Room, RoomState, RoomStats};
use crate::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId, WorkerId,
};
use crate::worker::{WorkerPool, WorkerStats};

/// Result of a successful join
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInfo {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub router_capabilities: RtpCapabilities,
}

/// What the client needs to set up its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl TransportInfo {
    fn new(transport_id: TransportId, direction: TransportDirection, parameters: TransportParameters) -> Self {
        Self {
            transport_id,
            direction,
            ice_parameters: parameters.ice_parameters,
            ice_candidates: parameters.ice_candidates,
            dtls_parameters: parameters.dtls_parameters,
        }
    }
}

/// Global SFU manager statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerStats {
    /// Number of active rooms
    pub active_rooms: usize,
    /// Total number of peers across all rooms
    pub total_peers: usize,
    pub total_transports: usize,
    pub total_producers: usize,
    pub total_consumers: usize,
    pub workers: Vec<WorkerStats>,
    pub rooms: Vec<RoomStats>,
}

/// SFU Manager - owns the worker pool and the room registry
pub struct SfuManager {
    config: Arc<SfuConfig>,
    pool: Arc<WorkerPool>,
    registry: RoomRegistry,
    engine: EngineHandle,
    transport_options: TransportOptions,
    shutdown: CancellationToken,
}

impl SfuManager {
    /// Start the worker pool and the worker failure supervisor
    ///
    /// `transport_options` are handed to the engine for every transport.
    pub async fn init(
        config: SfuConfig,
        transport_options: TransportOptions,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<Arc<Self>> {
        let shutdown = CancellationToken::new();
        // Subscribe before any worker exists so no death goes unseen
        let events = engine.subscribe();

        let pool = Arc::new(
            WorkerPool::init(
                engine.as_ref(),
                config.worker_count(),
                config.max_routers_per_worker,
            )
            .await?,
        );
        let engine = EngineHandle::new(engine, config.negotiation_timeout(), shutdown.clone());
        let registry = RoomRegistry::new(
            Arc::clone(&pool),
            engine.clone(),
            config.media_codecs.clone(),
            config.max_rooms,
        );

        let manager = Arc::new(Self {
            config: Arc::new(config),
            pool,
            registry,
            engine,
            transport_options,
            shutdown,
        });

        info!(
            workers = manager.pool.len(),
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            negotiation_timeout_secs = manager.config.negotiation_timeout_secs,
            "SFU Manager initialized"
        );

        Self::spawn_supervisor(&manager, events);
        Ok(manager)
    }

    fn spawn_supervisor(manager: &Arc<Self>, mut events: broadcast::Receiver<EngineEvent>) {
        let weak = Arc::downgrade(manager);
        let shutdown = manager.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(EngineEvent::WorkerDied { worker_id }) => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.handle_worker_died(&worker_id).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Media engine events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Worker supervisor stopped");
        });
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub const fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Lock a live room
    async fn lock_room(&self, room_id: &RoomId) -> Result<(Arc<Room>, OwnedMutexGuard<RoomState>)> {
        let room = self
            .registry
            .get(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))?;
        let state = room.lock().await;
        if state.is_destroyed() {
            return Err(Error::RoomNotFound(room_id.clone()));
        }
        if let Some(binding) = room.router().filter(|b| !b.worker.is_alive()) {
            return Err(Error::WorkerUnavailable(binding.worker.id().clone()));
        }
        Ok((room, state))
    }

    /// Join a room, creating it on first use
    pub async fn join(&self, room_id: &RoomId, peer_id: &PeerId, sink: EventSink) -> Result<JoinInfo> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let (room, mut state) = self.registry.get_or_create_room(room_id).await?;
        let result = state.add_peer(
            Peer::new(peer_id.clone(), sink),
            self.config.max_peers_per_room,
            room_id,
        );
        let peer_count = state.peer_count();
        drop(state);

        if let Err(e) = result {
            warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Join rejected");
            self.registry.remove_room_if_empty(&room).await;
            return Err(e);
        }

        let binding = room.binding()?;
        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count,
            worker_id = %binding.worker.id(),
            "Peer joined room"
        );

        Ok(JoinInfo {
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
            router_capabilities: binding.rtp_capabilities.clone(),
        })
    }

    /// Remove a peer and everything it owns, destroying the room if it empties
    pub async fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<()> {
        let room = self
            .registry
            .get(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))?;

        let closed = {
            let mut state = room.lock().await;
            if state.is_destroyed() {
                return Err(Error::RoomNotFound(room_id.clone()));
            }
            let closed = state
                .remove_peer(peer_id)
                .ok_or_else(|| Error::PeerNotFound(peer_id.clone()))?;
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                remaining = state.peer_count(),
                "Peer left room"
            );
            closed
        };

        self.release(closed).await;
        self.registry.remove_room_if_empty(&room).await;
        Ok(())
    }

    /// Router capabilities of a live room
    pub fn router_rtp_capabilities(&self, room_id: &RoomId) -> Result<RtpCapabilities> {
        let room = self
            .registry
            .get(room_id)
            .ok_or_else(|| Error::RoomNotFound(room_id.clone()))?;
        Ok(room.binding()?.rtp_capabilities.clone())
    }

    /// Whether the peer is currently attached to the room
    pub async fn is_member(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        match self.registry.get(room_id) {
            Some(room) => {
                let state = room.lock().await;
                !state.is_destroyed() && state.contains_peer(peer_id)
            }
            None => false,
        }
    }

    /// Allocate a transport on the room's router
    ///
    /// A peer holds at most one transport per direction. The transport is
    /// closed again if the client does not connect it within the
    /// negotiation timeout.
    pub async fn create_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<TransportInfo> {
        let transport_id = TransportId::generate();

        let (room, router_id) = {
            let (room, mut state) = self.lock_room(room_id).await?;
            let router_id = room.binding()?.router_id.clone();
            let peer = state.peer_mut(peer_id)?;
            if peer.transport_in(direction).is_some() {
                return Err(Error::TransportAlreadyExists(direction));
            }
            peer.transports.insert(
                transport_id.clone(),
                Transport::reserve(transport_id.clone(), direction),
            );
            drop(state);
            (room, router_id)
        };

        let result = self
            .engine
            .negotiate(
                "createTransport",
                self.engine
                    .engine()
                    .create_transport(&router_id, &transport_id, &self.transport_options),
            )
            .await;

        let mut state = room.lock().await;
        let parameters = match result {
            Ok(parameters) => parameters,
            Err(e) => {
                if let Ok(peer) = state.peer_mut(peer_id) {
                    peer.transports.remove(&transport_id);
                }
                drop(state);
                self.close_engine_transport(&transport_id).await;
                warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Transport creation failed");
                return Err(e);
            }
        };

        let slot = if state.is_destroyed() {
            None
        } else {
            state
                .peer_mut(peer_id)
                .ok()
                .and_then(|peer| peer.transports.get_mut(&transport_id))
        };
        let Some(transport) = slot else {
            drop(state);
            self.close_engine_transport(&transport_id).await;
            return Err(Error::TransportNotFound(transport_id));
        };

        transport.mark_created(parameters.clone());
        let watchdog = transport.watchdog.clone();
        drop(state);

        self.spawn_transport_watchdog(room, peer_id.clone(), transport_id.clone(), watchdog);

        debug!(
            room_id = %room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            direction = %direction,
            "Transport created"
        );
        Ok(TransportInfo::new(transport_id, direction, parameters))
    }

    /// Close a transport that is still not connected when the timeout fires
    fn spawn_transport_watchdog(
        &self,
        room: Arc<Room>,
        peer_id: PeerId,
        transport_id: TransportId,
        token: CancellationToken,
    ) {
        let engine = self.engine.clone();
        let timeout = self.config.negotiation_timeout();

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = engine.shutdown_token().cancelled() => return,
                () = tokio::time::sleep(timeout) => {}
            }

            let closed = {
                let mut state = room.lock().await;
                let pending = state
                    .peer(&peer_id)
                    .ok()
                    .and_then(|peer| peer.transports.get(&transport_id))
                    // An in-flight connect is bounded and cleaned up on its own
                    .is_some_and(|transport| !transport.is_connected() && !transport.connect_in_flight);
                if !pending {
                    return;
                }
                state.close_transport(&peer_id, &transport_id)
            };

            if let Ok(closed) = closed {
                warn!(
                    room_id = %room.id(),
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    "Transport not connected in time, closing"
                );
                release_resources(&engine, closed).await;
            }
        });
    }

    /// Complete DTLS negotiation for a transport
    ///
    /// Repeating the call with identical parameters once connected is a
    /// no-op.
    pub async fn connect_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let room = {
            let (room, mut state) = self.lock_room(room_id).await?;
            let transport = state.peer_mut(peer_id)?.transport_mut(transport_id)?;
            match transport.state {
                TransportState::Connected => {
                    return if transport.remote_dtls.as_ref() == Some(&dtls_parameters) {
                        Ok(())
                    } else {
                        Err(Error::DtlsParametersMismatch(transport_id.clone()))
                    };
                }
                TransportState::Closed => return Err(Error::TransportNotFound(transport_id.clone())),
                TransportState::New => return Err(Error::TransportNotReady(transport_id.clone())),
                TransportState::Connecting if transport.connect_in_flight => {
                    return Err(Error::TransportNotReady(transport_id.clone()));
                }
                TransportState::Connecting => transport.connect_in_flight = true,
            }
            drop(state);
            room
        };

        let result = self
            .engine
            .negotiate(
                "connectTransport",
                self.engine.engine().connect_transport(transport_id, &dtls_parameters),
            )
            .await;

        let mut state = room.lock().await;
        let slot = if state.is_destroyed() {
            None
        } else {
            state
                .peer_mut(peer_id)
                .ok()
                .and_then(|peer| peer.transports.get_mut(transport_id))
        };
        let Some(transport) = slot else {
            return Err(Error::TransportNotFound(transport_id.clone()));
        };

        match result {
            Ok(()) => {
                transport.mark_connected(dtls_parameters);
                debug!(
                    room_id = %room_id,
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    "Transport connected"
                );
                Ok(())
            }
            Err(e) => {
                transport.connect_in_flight = false;
                // The watchdog skipped this transport while the call was in flight
                let expired = (Utc::now() - transport.created_at)
                    .to_std()
                    .is_ok_and(|age| age >= self.config.negotiation_timeout());
                if expired || matches!(e, Error::NegotiationTimeout(_)) {
                    let closed = state.close_transport(peer_id, transport_id);
                    drop(state);
                    if let Ok(closed) = closed {
                        self.release(closed).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Close one of the peer's transports with everything riding on it
    pub async fn close_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
    ) -> Result<()> {
        let closed = {
            let (_room, mut state) = self.lock_room(room_id).await?;
            state.close_transport(peer_id, transport_id)?
        };
        debug!(
            room_id = %room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            producers = closed.producers.len(),
            consumers = closed.consumers.len(),
            "Transport closed"
        );
        self.release(closed).await;
        Ok(())
    }

    /// Start receiving a track over the peer's send transport
    ///
    /// Every other peer in the room is told about the new producer.
    pub async fn produce(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let room = {
            let (room, state) = self.lock_room(room_id).await?;
            state
                .peer(peer_id)?
                .transport(transport_id)?
                .ensure_ready(TransportDirection::Send)?;
            if !room.binding()?.rtp_capabilities.supports(kind) {
                return Err(Error::InvalidRequest(format!("room router has no {kind} codec")));
            }
            drop(state);
            room
        };

        let producer_id = ProducerId::generate();
        let result = self
            .engine
            .negotiate(
                "produce",
                self.engine
                    .engine()
                    .produce(transport_id, &producer_id, kind, &rtp_parameters),
            )
            .await;
        if let Err(e) = result {
            // The engine may still have created it after we gave up
            self.close_engine_producer(&producer_id).await;
            warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Produce failed");
            return Err(e);
        }

        let mut state = room.lock().await;
        let ready = !state.is_destroyed()
            && state
                .peer(peer_id)
                .and_then(|peer| peer.transport(transport_id))
                .is_ok_and(Transport::is_connected);
        if !ready {
            drop(state);
            self.close_engine_producer(&producer_id).await;
            return Err(Error::TransportNotFound(transport_id.clone()));
        }

        state.add_producer(Producer {
            id: producer_id.clone(),
            peer_id: peer_id.clone(),
            transport_id: transport_id.clone(),
            kind,
            rtp_parameters,
        })?;

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Subscribe the peer to another peer's producer
    ///
    /// Asking again for the same producer returns the existing consumer.
    pub async fn consume(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
    ) -> Result<ConsumerInfo> {
        let (room, kind) = {
            let (room, state) = self.lock_room(room_id).await?;
            let peer = state.peer(peer_id)?;
            let producer = state
                .producer(producer_id)
                .ok_or_else(|| Error::ProducerNotFound(producer_id.clone()))?;
            if &producer.peer_id == peer_id {
                return Err(Error::SelfConsumptionRejected(producer_id.clone()));
            }
            if let Some(existing) = peer.consumer_of(producer_id) {
                return Ok(ConsumerInfo::from(existing));
            }
            peer.transport(transport_id)?
                .ensure_ready(TransportDirection::Recv)?;
            let kind = producer.kind;
            drop(state);
            (room, kind)
        };

        let consumer_id = ConsumerId::generate();
        let rtp_parameters = match self
            .engine
            .negotiate(
                "consume",
                self.engine.engine().consume(transport_id, &consumer_id, producer_id),
            )
            .await
        {
            Ok(rtp_parameters) => rtp_parameters,
            Err(e) => {
                self.close_engine_consumer(&consumer_id).await;
                warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Consume failed");
                return Err(e);
            }
        };

        let mut state = room.lock().await;
        let producer_alive = !state.is_destroyed() && state.producer(producer_id).is_some();
        let transport_ready = state
            .peer(peer_id)
            .and_then(|peer| peer.transport(transport_id))
            .is_ok_and(Transport::is_connected);
        if !producer_alive || !transport_ready {
            drop(state);
            self.close_engine_consumer(&consumer_id).await;
            return Err(if producer_alive {
                Error::TransportNotFound(transport_id.clone())
            } else {
                Error::ProducerNotFound(producer_id.clone())
            });
        }

        let peer = state.peer_mut(peer_id)?;
        if let Some(existing) = peer.consumer_of(producer_id) {
            let info = ConsumerInfo::from(existing);
            drop(state);
            self.close_engine_consumer(&consumer_id).await;
            return Ok(info);
        }

        let consumer = Consumer {
            id: consumer_id.clone(),
            peer_id: peer_id.clone(),
            producer_id: producer_id.clone(),
            transport_id: transport_id.clone(),
            kind,
            rtp_parameters,
        };
        let info = ConsumerInfo::from(&consumer);
        peer.consumers.insert(consumer_id.clone(), consumer);

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer created"
        );
        Ok(info)
    }

    /// Close a producer owned by the peer, cascading to its consumers
    pub async fn close_producer(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        producer_id: &ProducerId,
    ) -> Result<()> {
        let closed = {
            let (_room, mut state) = self.lock_room(room_id).await?;
            state.close_producer(peer_id, producer_id)?
        };
        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            consumers = closed.consumers.len(),
            "Producer closed"
        );
        self.release(closed).await;
        Ok(())
    }

    /// Tear down every room hosted on a dead worker
    ///
    /// Rooms on other workers are untouched. Returns how many rooms were
    /// torn down.
    pub async fn handle_worker_died(&self, worker_id: &WorkerId) -> usize {
        if self.pool.mark_dead(worker_id) {
            error!(
                worker_id = %worker_id,
                alive_workers = self.pool.alive_count(),
                "Media worker died, tearing down its rooms"
            );
        }

        let mut torn_down = 0;
        for room in self.registry.rooms_on_worker(worker_id) {
            if self.registry.teardown_room(&room, REASON_WORKER_UNAVAILABLE).await {
                torn_down += 1;
            }
        }
        torn_down
    }

    async fn release(&self, closed: ClosedResources) {
        release_resources(&self.engine, closed).await;
    }

    async fn close_engine_transport(&self, transport_id: &TransportId) {
        self.engine
            .release("closeTransport", transport_id, self.engine.engine().close_transport(transport_id))
            .await;
    }

    async fn close_engine_producer(&self, producer_id: &ProducerId) {
        self.engine
            .release("closeProducer", producer_id, self.engine.engine().close_producer(producer_id))
            .await;
    }

    async fn close_engine_consumer(&self, consumer_id: &ConsumerId) {
        self.engine
            .release("closeConsumer", consumer_id, self.engine.engine().close_consumer(consumer_id))
            .await;
    }

    pub async fn room_stats(&self, room_id: &RoomId) -> Option<RoomStats> {
        let room = self.registry.get(room_id)?;
        Some(room.stats().await)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.registry.len()
    }

    /// Get global statistics
    pub async fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            workers: self.pool.stats(),
            ..Default::default()
        };

        for room in self.registry.rooms() {
            let room_stats = room.stats().await;
            stats.active_rooms += 1;
            stats.total_peers += room_stats.peer_count;
            stats.total_transports += room_stats.transport_count;
            stats.total_producers += room_stats.producer_count;
            stats.total_consumers += room_stats.consumer_count;
            stats.rooms.push(room_stats);
        }

        stats
    }

    /// Tear down every room; further joins are refused
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let rooms = self.registry.rooms();
        info!(rooms = rooms.len(), "Shutting down SFU manager");
        for room in rooms {
            self.registry.teardown_room(&room, REASON_SHUTDOWN).await;
        }
    }
}

async fn release_resources(engine: &EngineHandle, closed: ClosedResources) {
    if closed.is_empty() {
        return;
    }
    debug!(
        consumers = closed.consumers.len(),
        producers = closed.producers.len(),
        transports = closed.transports.len(),
        "Releasing engine resources"
    );
    for consumer_id in &closed.consumers {
        engine
            .release("closeConsumer", consumer_id, engine.engine().close_consumer(consumer_id))
            .await;
    }
    for producer_id in &closed.producers {
        engine
            .release("closeProducer", producer_id, engine.engine().close_producer(producer_id))
            .await;
    }
    for transport_id in &closed.transports {
        engine
            .release("closeTransport", transport_id, engine.engine().close_transport(transport_id))
            .await;
    }
}
