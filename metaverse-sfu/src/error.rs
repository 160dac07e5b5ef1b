//! Error types for the SFU control plane

use thiserror::Error;

use crate::engine::EngineError;
use crate::types::{PeerId, ProducerId, RoomId, TransportDirection, TransportId, WorkerId};

/// SFU error types
///
/// Validation errors are returned to the requesting client as a negative
/// acknowledgment and never affect other peers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Transport {0} is not connected")]
    TransportNotReady(TransportId),

    #[error("Transport {transport_id} is a {actual} transport")]
    TransportDirectionMismatch {
        transport_id: TransportId,
        actual: TransportDirection,
    },

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Peer may not consume its own producer {0}")]
    SelfConsumptionRejected(ProducerId),

    #[error("No media worker available")]
    WorkerPoolExhausted,

    #[error("Negotiation timed out: {0}")]
    NegotiationTimeout(String),

    #[error("Media worker {0} is unavailable")]
    WorkerUnavailable(WorkerId),

    #[error("Maximum number of rooms reached")]
    RoomLimitReached,

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Peer {0} already joined this room")]
    PeerAlreadyJoined(PeerId),

    #[error("Connection already joined room {0}")]
    AlreadyInRoom(RoomId),

    #[error("Connection has not joined a room")]
    NotInRoom,

    #[error("Peer already has a {0} transport")]
    TransportAlreadyExists(TransportDirection),

    #[error("Transport {0} is already connected with different DTLS parameters")]
    DtlsParametersMismatch(TransportId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("SFU is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Stable error code sent to clients in negative acknowledgments
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "RoomNotFound",
            Self::PeerNotFound(_) => "PeerNotFound",
            Self::TransportNotFound(_) => "TransportNotFound",
            Self::TransportNotReady(_) => "TransportNotReady",
            Self::TransportDirectionMismatch { .. } => "TransportDirectionMismatch",
            Self::ProducerNotFound(_) => "ProducerNotFound",
            Self::SelfConsumptionRejected(_) => "SelfConsumptionRejected",
            Self::WorkerPoolExhausted => "WorkerPoolExhausted",
            Self::NegotiationTimeout(_) => "NegotiationTimeout",
            Self::WorkerUnavailable(_) => "WorkerUnavailable",
            Self::RoomLimitReached => "RoomLimitReached",
            Self::RoomFull(_) => "RoomFull",
            Self::PeerAlreadyJoined(_) => "PeerAlreadyJoined",
            Self::AlreadyInRoom(_) => "AlreadyInRoom",
            Self::NotInRoom => "NotInRoom",
            Self::TransportAlreadyExists(_) => "TransportAlreadyExists",
            Self::DtlsParametersMismatch(_) => "DtlsParametersMismatch",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Engine(_) => "EngineError",
            Self::ShuttingDown => "ShuttingDown",
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerDead(worker_id) => Self::WorkerUnavailable(worker_id),
            other => Self::Engine(other.to_string()),
        }
    }
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, Error>;
