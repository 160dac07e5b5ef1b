//! Signaling wire format
//!
//! Clients send `{"id", "method", "data"}` requests and receive either an
//! acknowledgment carrying the same id or a server-pushed event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{DtlsParameters, RtpParameters};
use crate::error::Error;
use crate::types::{MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Raw request frame, before the method payload is interpreted
#[derive(Debug, Clone, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl RequestFrame {
    /// Interpret the method and its payload
    pub fn into_request(self) -> Result<ClientRequest, Error> {
        let data = if self.data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            self.data
        };
        serde_json::from_value(serde_json::json!({ "method": self.method, "data": data }))
            .map_err(|e| Error::InvalidRequest(e.to_string()))
    }
}

/// Client -> server requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        peer_id: Option<PeerId>,
    },
    GetRouterRtpCapabilities {},
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        room_id: RoomId,
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        room_id: RoomId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        recv_transport_id: TransportId,
        producer_id: ProducerId,
    },
    CloseProducer {
        #[serde(alias = "producerId")]
        id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    CloseTransport { transport_id: TransportId },
    LeaveRoom {
        #[serde(default)]
        id: Option<RoomId>,
    },
}

impl ClientRequest {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::GetRouterRtpCapabilities {} => "getRouterRtpCapabilities",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::CloseProducer { .. } => "closeProducer",
            Self::CloseTransport { .. } => "closeTransport",
            Self::LeaveRoom { .. } => "leaveRoom",
        }
    }
}

/// Server -> client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },
    /// The room was torn down underneath the peer; rejoin to continue
    #[serde(rename_all = "camelCase")]
    RoomClosed { room_id: RoomId, reason: String },
}

impl ServerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NewProducer { .. } => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::PeerJoined { .. } => "peerJoined",
            Self::PeerLeft { .. } => "peerLeft",
            Self::RoomClosed { .. } => "roomClosed",
        }
    }
}

/// Negative acknowledgment body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Acknowledgment of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub response: bool,
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    #[must_use]
    pub const fn success(id: u64, data: Value) -> Self {
        Self {
            response: true,
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, err: &Error) -> Self {
        Self {
            response: true,
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }
}

/// Anything the server writes to a signaling connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(ResponseFrame),
    Event(ServerEvent),
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
