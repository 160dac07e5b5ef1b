//! Media worker pool
//!
//! A fixed set of workers is started once. Rooms are spread over them in
//! round-robin order; existing routers are never rebalanced. A dead worker is
//! skipped forever after.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::types::WorkerId;

/// One isolated media-processing unit
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    index: usize,
    router_count: AtomicUsize,
    alive: AtomicBool,
}

impl Worker {
    fn new(id: WorkerId, index: usize) -> Self {
        Self {
            id,
            index,
            router_count: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Position in the pool's rotation
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.router_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Claim a router slot, respecting the per-worker cap (0 = unlimited)
    fn try_reserve(&self, max_routers: usize) -> bool {
        self.router_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (max_routers == 0 || count < max_routers).then_some(count + 1)
            })
            .is_ok()
    }

    /// Give back a router slot claimed by [`WorkerPool::select_worker`]
    pub fn release_router(&self) {
        let _ = self
            .router_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });
    }

    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            router_count: self.router_count(),
            alive: self.is_alive(),
        }
    }
}

/// Worker load snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    pub router_count: usize,
    pub alive: bool,
}

/// Fixed-size pool of media workers
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    next_index: AtomicUsize,
    max_routers_per_worker: usize,
}

impl WorkerPool {
    /// Start `size` workers on the engine
    pub async fn init(
        engine: &dyn MediaEngine,
        size: usize,
        max_routers_per_worker: usize,
    ) -> Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let worker_id = WorkerId::new(format!("worker-{index}"));
            engine.create_worker(&worker_id).await?;
            workers.push(Arc::new(Worker::new(worker_id, index)));
        }

        info!(
            workers = size,
            max_routers_per_worker,
            "Media worker pool initialized"
        );

        Ok(Self {
            workers,
            next_index: AtomicUsize::new(0),
            max_routers_per_worker,
        })
    }

    /// Pick the next live worker in rotation and reserve a router slot on it
    ///
    /// The caller owns the reservation and must call
    /// [`Worker::release_router`] when the router goes away or its creation
    /// fails.
    pub fn select_worker(&self) -> Result<Arc<Worker>> {
        let len = self.workers.len();

        for _ in 0..len {
            let index = self.next_index.fetch_add(1, Ordering::AcqRel) % len;
            let worker = &self.workers[index];

            if !worker.is_alive() {
                continue;
            }
            if worker.try_reserve(self.max_routers_per_worker) {
                return Ok(Arc::clone(worker));
            }
        }

        warn!(workers = len, "No media worker can accept another router");
        Err(Error::WorkerPoolExhausted)
    }

    #[must_use]
    pub fn get(&self, worker_id: &WorkerId) -> Option<Arc<Worker>> {
        self.workers.iter().find(|w| w.id() == worker_id).cloned()
    }

    /// Take a worker out of rotation for good
    ///
    /// Returns false if the worker is unknown or was already dead.
    pub fn mark_dead(&self, worker_id: &WorkerId) -> bool {
        self.get(worker_id)
            .is_some_and(|worker| worker.alive.swap(false, Ordering::AcqRel))
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_alive()).count()
    }

    #[must_use]
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.stats()).collect()
    }
}
