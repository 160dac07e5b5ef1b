//! Media engine seam
//!
//! The control plane never touches RTP. Everything below the router
//! (ICE, DTLS, packet forwarding) belongs to a media engine reached through
//! [`MediaEngine`]. Every call may cross a process boundary, so callers must
//! not hold room locks while awaiting one.
//!
//! Resource identifiers are allocated by the caller. An abandoned call can
//! therefore always be cleaned up by id, and close operations are idempotent.

mod handle;
mod local;

pub use handle::EngineHandle;
pub use local::LocalMediaEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};

/// RTP parameters are relayed verbatim between client and engine
pub type RtpParameters = serde_json::Value;

/// Codec supported by a router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

/// Router codec capability set handed to clients on join
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<serde_json::Value>,
}

impl RtpCapabilities {
    #[must_use]
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|codec| codec.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceCandidateType {
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub protocol: Protocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: IceCandidateType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Server side negotiation parameters of a freshly created transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Per-transport settings handed to the engine on creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub listen_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
    /// Bits per second
    pub max_incoming_bitrate: u32,
    /// Bits per second
    pub initial_available_outgoing_bitrate: u32,
}

impl TransportOptions {
    /// Address placed in ICE candidates
    #[must_use]
    pub fn candidate_address(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }
}

/// Asynchronous notifications from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The worker process terminated; its routers are gone
    WorkerDied { worker_id: WorkerId },
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("worker {0} died")]
    WorkerDead(WorkerId),

    #[error("router {0} not found")]
    RouterNotFound(RouterId),

    #[error("transport {0} not found")]
    TransportNotFound(TransportId),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Operations the control plane needs from a media engine
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Start a worker (one isolated media process)
    async fn create_worker(&self, worker_id: &WorkerId) -> EngineResult<()>;

    /// Create a router on a worker, returning its negotiated capabilities
    async fn create_router(
        &self,
        worker_id: &WorkerId,
        router_id: &RouterId,
        codecs: &[RtpCodecCapability],
    ) -> EngineResult<RtpCapabilities>;

    /// Close a router together with everything created on it
    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()>;

    async fn create_transport(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
        options: &TransportOptions,
    ) -> EngineResult<TransportParameters>;

    /// Complete DTLS negotiation with the client's parameters
    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> EngineResult<()>;

    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> EngineResult<()>;

    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()>;

    /// Start forwarding a producer over a receive transport
    async fn consume(
        &self,
        transport_id: &TransportId,
        consumer_id: &ConsumerId,
        producer_id: &ProducerId,
    ) -> EngineResult<RtpParameters>;

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()>;

    /// Subscribe to engine notifications such as worker deaths
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
