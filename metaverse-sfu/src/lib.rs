//! Metaverse SFU (Selective Forwarding Unit) control plane
//!
//! Accepts signaling sessions, spreads rooms over a pool of media workers and
//! negotiates per-peer transports, producers and consumers so everyone in a
//! room can send and receive each other's audio and video. Media itself is
//! handled by a [`MediaEngine`]; this crate only orchestrates it.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed set of media workers, round-robin router placement
//! - **`RoomRegistry`**: at most one live `Room` per id, each bound to one router
//! - **`Room`** / **`Peer`**: the resource graph, mutated under a per-room lock
//! - **`SfuManager`**: join/leave and negotiation, worker failure isolation
//! - **`SignalingSession`**: per-connection request handling over JSON frames
//! - **`RelayHub`**: router-less two-party call relay
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metaverse_sfu::{EventSink, LocalMediaEngine, MediaConfig, SfuConfig, SfuManager};
//!
//! let media = MediaConfig::default();
//! let options = media.transport_options();
//! let engine = Arc::new(LocalMediaEngine::new(media));
//! let manager = SfuManager::init(SfuConfig::default(), options, engine).await?;
//!
//! let (sink, events) = EventSink::channel();
//! let joined = manager.join(&"r1".into(), &"alice".into(), sink).await?;
//! ```

mod config;
pub mod engine;
mod error;
mod manager;
mod peer;
mod registry;
pub mod relay;
mod room;
pub mod signaling;
mod types;
mod worker;

pub use config::{default_media_codecs, MediaConfig, SfuConfig};
pub use engine::{EngineHandle, LocalMediaEngine, MediaEngine, TransportOptions};
pub use error::{Error, Result};
pub use manager::{JoinInfo, ManagerStats, SfuManager, TransportInfo};
pub use peer::{ConsumerInfo, EventSink, PeerStats, TransportState};
pub use registry::{RoomRegistry, REASON_SHUTDOWN, REASON_WORKER_UNAVAILABLE};
pub use relay::{RelayConnection, RelayEvent, RelayHub, RelayRequest};
pub use room::{Room, RoomPhase, RoomState, RoomStats};
pub use signaling::{ServerEvent, ServerMessage, SignalingSession};
pub use types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RouterId, TransportDirection, TransportId,
    WorkerId,
};
pub use worker::{Worker, WorkerPool, WorkerStats};
