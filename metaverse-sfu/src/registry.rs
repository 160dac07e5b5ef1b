//! Room registry
//!
//! The single source of truth for which rooms exist. Creation and teardown
//! both happen under the room's own lock, and an entry is only removed by
//! whoever moved the room to `Destroyed`, so at most one live room exists
//! per id even under concurrent joins and departures.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::engine::{EngineHandle, RtpCodecCapability};
use crate::error::{Error, Result};
use crate::room::{Room, RoomState, RouterBinding};
use crate::types::{RoomId, RouterId, WorkerId};
use crate::worker::WorkerPool;

/// `roomClosed` reason when the hosting worker died
pub const REASON_WORKER_UNAVAILABLE: &str = "workerUnavailable";
/// `roomClosed` reason when the SFU shuts down
pub const REASON_SHUTDOWN: &str = "shutdown";
const REASON_EMPTY: &str = "empty";

pub struct RoomRegistry {
    rooms: DashMap<RoomId, Arc<Room>>,
    pool: Arc<WorkerPool>,
    engine: EngineHandle,
    media_codecs: Vec<RtpCodecCapability>,
    max_rooms: usize,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        engine: EngineHandle,
        media_codecs: Vec<RtpCodecCapability>,
        max_rooms: usize,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            pool,
            engine,
            media_codecs,
            max_rooms,
        }
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    /// Look up a room, creating it together with its router if needed
    ///
    /// The room comes back locked and not `Destroyed`, so the caller can
    /// attach a peer before any departure can tear it down.
    pub async fn get_or_create_room(
        &self,
        room_id: &RoomId,
    ) -> Result<(Arc<Room>, OwnedMutexGuard<RoomState>)> {
        loop {
            // Checked before taking the entry: len() would deadlock under it
            if self.max_rooms > 0
                && !self.rooms.contains_key(room_id)
                && self.rooms.len() >= self.max_rooms
            {
                warn!(room_id = %room_id, max_rooms = self.max_rooms, "Room limit reached");
                return Err(Error::RoomLimitReached);
            }

            let room = Arc::clone(
                self.rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| Room::new(room_id.clone()))
                    .value(),
            );

            let mut state = room.lock().await;
            if state.is_destroyed() {
                // Lost a race with teardown; the next pass sees a fresh room
                drop(state);
                self.unregister(&room);
                continue;
            }

            if room.router().is_some_and(|binding| !binding.worker.is_alive()) {
                // Worker died before the supervisor reached this room
                self.destroy(&room, state, REASON_WORKER_UNAVAILABLE).await;
                continue;
            }

            if room.router().is_none() {
                if let Err(e) = self.create_router(&room).await {
                    state.mark_destroyed();
                    drop(state);
                    self.unregister(&room);
                    return Err(e);
                }
            }

            return Ok((room, state));
        }
    }

    /// Pick a worker and create the room's router on it
    ///
    /// Runs under the room lock so load accounting follows room lifecycle.
    async fn create_router(&self, room: &Room) -> Result<()> {
        let worker = self.pool.select_worker()?;
        let router_id = RouterId::generate();

        let result = self
            .engine
            .negotiate(
                "createRouter",
                self.engine
                    .engine()
                    .create_router(worker.id(), &router_id, &self.media_codecs),
            )
            .await;

        match result {
            Ok(rtp_capabilities) => {
                info!(
                    room_id = %room.id(),
                    router_id = %router_id,
                    worker_id = %worker.id(),
                    "Room created"
                );
                room.bind_router(RouterBinding {
                    router_id,
                    worker,
                    rtp_capabilities,
                });
                Ok(())
            }
            Err(e) => {
                warn!(room_id = %room.id(), worker_id = %worker.id(), error = %e, "Router creation failed");
                self.engine
                    .release("closeRouter", &router_id, self.engine.engine().close_router(&router_id))
                    .await;
                worker.release_router();
                Err(e)
            }
        }
    }

    /// Close the room's router and give its slot back to the worker
    async fn release_router(&self, room: &Room) {
        if let Some(binding) = room.router() {
            self.engine
                .release(
                    "closeRouter",
                    &binding.router_id,
                    self.engine.engine().close_router(&binding.router_id),
                )
                .await;
            binding.worker.release_router();
        }
    }

    fn unregister(&self, room: &Arc<Room>) {
        self.rooms
            .remove_if(room.id(), |_, current| Arc::ptr_eq(current, room));
    }

    /// Destroy the room if nobody is left in it
    ///
    /// Emptiness is checked and the room marked `Destroyed` under its lock,
    /// so a racing join either gets in first or retries on a fresh room.
    pub async fn remove_room_if_empty(&self, room: &Arc<Room>) -> bool {
        let state = room.lock().await;
        if state.is_destroyed() || !state.is_empty() {
            return false;
        }
        self.destroy(room, state, REASON_EMPTY).await;
        true
    }

    /// Destroy a room regardless of who is still in it
    ///
    /// Remaining peers get `roomClosed` with `reason`.
    pub async fn teardown_room(&self, room: &Arc<Room>, reason: &str) -> bool {
        let state = room.lock().await;
        if state.is_destroyed() {
            return false;
        }
        self.destroy(room, state, reason).await;
        true
    }

    /// Release the router before the entry leaves the registry
    async fn destroy(&self, room: &Arc<Room>, mut state: OwnedMutexGuard<RoomState>, reason: &str) {
        let peers = state.close_all(room.id(), reason);
        state.mark_destroyed();
        self.release_router(room).await;
        drop(state);
        self.unregister(room);

        if peers == 0 {
            info!(room_id = %room.id(), "Room destroyed");
        } else {
            warn!(room_id = %room.id(), peers, reason, "Room torn down with peers inside");
        }
    }

    /// Rooms whose router lives on `worker_id`
    #[must_use]
    pub fn rooms_on_worker(&self, worker_id: &WorkerId) -> Vec<Arc<Room>> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().worker_id() == Some(worker_id))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of every registered room
    #[must_use]
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    #[must_use]
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
