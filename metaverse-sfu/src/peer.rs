//! Peer and the resources it owns
//!
//! This module handles:
//! - Transport negotiation state per direction
//! - Producers pushed over the send transport
//! - Consumers pulled over the receive transport
//! - Delivery of room events to the peer's signaling connection
//!
//! Everything here is plain data mutated under the owning room's lock.
//! Media engine calls happen outside that lock, in the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{DtlsParameters, RtpParameters, TransportParameters};
use crate::error::{Error, Result};
use crate::signaling::{ServerEvent, ServerMessage};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportDirection, TransportId};

/// Outbound half of a peer's signaling connection
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl EventSink {
    #[must_use]
    pub const fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { tx }
    }

    /// Sink paired with a receiver, for callers without a socket
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queue an event; returns false once the connection is gone
    pub fn emit(&self, event: ServerEvent) -> bool {
        self.tx.send(ServerMessage::Event(event)).is_ok()
    }
}

/// Transport negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Slot reserved, engine creation in flight
    New,
    /// Created and handed to the client, waiting for its DTLS parameters
    Connecting,
    /// DTLS parameters accepted by the engine
    Connected,
    Closed,
}

/// Direction-scoped secure channel between a peer and the room router
#[derive(Debug)]
pub struct Transport {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub state: TransportState,
    pub parameters: Option<TransportParameters>,
    pub remote_dtls: Option<DtlsParameters>,
    /// A connect call is awaiting the engine
    pub connect_in_flight: bool,
    /// Cancelled once the transport connects or closes
    pub watchdog: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl Transport {
    #[must_use]
    pub fn reserve(id: TransportId, direction: TransportDirection) -> Self {
        Self {
            id,
            direction,
            state: TransportState::New,
            parameters: None,
            remote_dtls: None,
            connect_in_flight: false,
            watchdog: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    pub fn mark_created(&mut self, parameters: TransportParameters) {
        self.parameters = Some(parameters);
        self.state = TransportState::Connecting;
    }

    pub fn mark_connected(&mut self, dtls_parameters: DtlsParameters) {
        self.remote_dtls = Some(dtls_parameters);
        self.state = TransportState::Connected;
        self.connect_in_flight = false;
        self.watchdog.cancel();
    }

    fn close(&mut self) {
        self.state = TransportState::Closed;
        self.watchdog.cancel();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    /// Check that this transport can carry media in `direction`
    pub fn ensure_ready(&self, direction: TransportDirection) -> Result<()> {
        if self.direction != direction {
            return Err(Error::TransportDirectionMismatch {
                transport_id: self.id.clone(),
                actual: self.direction,
            });
        }
        if !self.is_connected() {
            return Err(Error::TransportNotReady(self.id.clone()));
        }
        Ok(())
    }
}

/// Inbound track
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: ProducerId,
    pub peer_id: PeerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Outbound track subscribed to a remote producer
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: ConsumerId,
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// What a consumer looks like to the client that asked for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

impl From<&Consumer> for ConsumerInfo {
    fn from(consumer: &Consumer) -> Self {
        Self {
            consumer_id: consumer.id.clone(),
            producer_id: consumer.producer_id.clone(),
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters.clone(),
        }
    }
}

/// Engine-side resources detached from the graph, to be closed after the
/// room lock is released
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClosedResources {
    pub consumers: Vec<ConsumerId>,
    pub producers: Vec<ProducerId>,
    pub transports: Vec<TransportId>,
}

impl ClosedResources {
    pub fn merge(&mut self, other: Self) {
        self.consumers.extend(other.consumers);
        self.producers.extend(other.producers);
        self.transports.extend(other.transports);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty() && self.producers.is_empty() && self.transports.is_empty()
    }
}

/// Per-peer resource counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStats {
    pub peer_id: PeerId,
    pub joined_at: DateTime<Utc>,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
}

/// A connected participant
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    sink: EventSink,
    pub transports: HashMap<TransportId, Transport>,
    pub producers: HashMap<ProducerId, Producer>,
    pub consumers: HashMap<ConsumerId, Consumer>,
    pub joined_at: DateTime<Utc>,
}

impl Peer {
    #[must_use]
    pub fn new(id: PeerId, sink: EventSink) -> Self {
        Self {
            id,
            sink,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            joined_at: Utc::now(),
        }
    }

    pub fn notify(&self, event: ServerEvent) {
        let name = event.name();
        if !self.sink.emit(event) {
            debug!(peer_id = %self.id, event = name, "Peer connection gone, event dropped");
        }
    }

    /// The peer's transport for a direction (one of each at most)
    #[must_use]
    pub fn transport_in(&self, direction: TransportDirection) -> Option<&Transport> {
        self.transports.values().find(|t| t.direction == direction)
    }

    pub fn transport(&self, transport_id: &TransportId) -> Result<&Transport> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| Error::TransportNotFound(transport_id.clone()))
    }

    pub fn transport_mut(&mut self, transport_id: &TransportId) -> Result<&mut Transport> {
        self.transports
            .get_mut(transport_id)
            .ok_or_else(|| Error::TransportNotFound(transport_id.clone()))
    }

    #[must_use]
    pub fn consumer_of(&self, producer_id: &ProducerId) -> Option<&Consumer> {
        self.consumers.values().find(|c| &c.producer_id == producer_id)
    }

    /// Drop every consumer fed by `producer_id`
    pub fn remove_consumers_of(&mut self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.producer_id == producer_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            self.consumers.remove(id);
        }
        ids
    }

    /// Remove a transport and whatever rides on it
    ///
    /// Producers on a send transport are returned for the caller to cascade;
    /// consumers on a receive transport are dropped here.
    pub fn take_transport(&mut self, transport_id: &TransportId) -> Option<(Transport, Vec<ProducerId>, Vec<ConsumerId>)> {
        let mut transport = self.transports.remove(transport_id)?;
        transport.close();

        let producers: Vec<ProducerId> = self
            .producers
            .values()
            .filter(|p| &p.transport_id == transport_id)
            .map(|p| p.id.clone())
            .collect();

        let consumers: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| &c.transport_id == transport_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &consumers {
            self.consumers.remove(id);
        }

        Some((transport, producers, consumers))
    }

    /// Empty the peer's own consumer and transport tables
    ///
    /// Producers are left to the room, which has to cascade them first.
    pub fn drain_own(&mut self) -> ClosedResources {
        for transport in self.transports.values_mut() {
            transport.close();
        }
        ClosedResources {
            consumers: self.consumers.drain().map(|(id, _)| id).collect(),
            producers: Vec::new(),
            transports: self.transports.drain().map(|(id, _)| id).collect(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            peer_id: self.id.clone(),
            joined_at: self.joined_at,
            transport_count: self.transports.len(),
            producer_count: self.producers.len(),
            consumer_count: self.consumers.len(),
        }
    }

    #[must_use]
    pub fn owns_nothing(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}
