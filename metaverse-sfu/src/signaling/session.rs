//! Per-connection signaling state
//!
//! One session per client connection. Requests are handled one at a time in
//! arrival order; acknowledgments are returned to the caller, which writes
//! them to the same outbound queue that carries room events.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::protocol::{ClientRequest, RequestFrame, ResponseFrame, ServerMessage};
use crate::error::{Error, Result};
use crate::manager::SfuManager;
use crate::peer::EventSink;
use crate::types::{PeerId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Membership {
    room_id: RoomId,
    peer_id: PeerId,
}

pub struct SignalingSession {
    connection_id: PeerId,
    /// Authenticated user; pins the peer id used to join
    identity: Option<PeerId>,
    manager: Arc<SfuManager>,
    sink: EventSink,
    membership: Option<Membership>,
}

impl SignalingSession {
    #[must_use]
    pub fn new(manager: Arc<SfuManager>, sink: EventSink) -> Self {
        Self::with_connection_id(PeerId::generate(), manager, sink)
    }

    /// Session whose default peer id is `connection_id`
    #[must_use]
    pub const fn with_connection_id(connection_id: PeerId, manager: Arc<SfuManager>, sink: EventSink) -> Self {
        Self {
            connection_id,
            identity: None,
            manager,
            sink,
            membership: None,
        }
    }

    /// Bind the session to an authenticated user
    ///
    /// `joinRoom` then defaults its peer id to the user id and rejects any
    /// other.
    #[must_use]
    pub fn with_identity(mut self, user_id: PeerId) -> Self {
        self.identity = Some(user_id);
        self
    }

    #[must_use]
    pub const fn connection_id(&self) -> &PeerId {
        &self.connection_id
    }

    /// Room and peer id this connection is joined as
    #[must_use]
    pub fn membership(&self) -> Option<(&RoomId, &PeerId)> {
        self.membership.as_ref().map(|m| (&m.room_id, &m.peer_id))
    }

    /// Handle one inbound text frame
    ///
    /// Returns the acknowledgment to send back, or `None` when the frame is
    /// too broken to carry a request id.
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<RequestFrame>(text) {
            Ok(frame) => {
                let id = frame.id;
                let response = match frame.into_request() {
                    Ok(request) => self.handle_request(id, request).await,
                    Err(e) => ResponseFrame::failure(id, &e),
                };
                Some(ServerMessage::Response(response))
            }
            Err(e) => {
                let id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|value| value.get("id").and_then(Value::as_u64));
                match id {
                    Some(id) => Some(ServerMessage::Response(ResponseFrame::failure(
                        id,
                        &Error::InvalidRequest(e.to_string()),
                    ))),
                    None => {
                        warn!(connection_id = %self.connection_id, error = %e, "Dropping malformed signaling frame");
                        None
                    }
                }
            }
        }
    }

    /// Handle a parsed request and build its acknowledgment
    pub async fn handle_request(&mut self, id: u64, request: ClientRequest) -> ResponseFrame {
        let method = request.method();
        match self.dispatch(request).await {
            Ok(data) => ResponseFrame::success(id, data),
            Err(e) => {
                debug!(
                    connection_id = %self.connection_id,
                    method,
                    code = e.code(),
                    error = %e,
                    "Request rejected"
                );
                ResponseFrame::failure(id, &e)
            }
        }
    }

    fn joined(&self) -> Result<&Membership> {
        self.membership.as_ref().ok_or(Error::NotInRoom)
    }

    /// Peer id to act as in `room_id`
    fn peer_in(&self, room_id: &RoomId) -> PeerId {
        match &self.membership {
            Some(m) if &m.room_id == room_id => m.peer_id.clone(),
            _ => self.connection_id.clone(),
        }
    }

    async fn dispatch(&mut self, request: ClientRequest) -> Result<Value> {
        match request {
            ClientRequest::JoinRoom { room_id, peer_id } => {
                if let Some(current) = &self.membership {
                    if self.manager.is_member(&current.room_id, &current.peer_id).await {
                        return Err(Error::AlreadyInRoom(current.room_id.clone()));
                    }
                    // The room went away underneath us
                    self.membership = None;
                }

                let peer_id = match (&self.identity, peer_id) {
                    (Some(user), Some(requested)) if &requested != user => {
                        return Err(Error::InvalidRequest(format!(
                            "peerId {requested} does not match the authenticated user"
                        )));
                    }
                    (Some(user), _) => user.clone(),
                    (None, requested) => requested.unwrap_or_else(|| self.connection_id.clone()),
                };
                let info = self.manager.join(&room_id, &peer_id, self.sink.clone()).await?;
                self.membership = Some(Membership { room_id, peer_id });
                Ok(json!(info))
            }
            ClientRequest::GetRouterRtpCapabilities {} => {
                let m = self.joined()?;
                let caps = self.manager.router_rtp_capabilities(&m.room_id)?;
                Ok(json!({ "routerCapabilities": caps }))
            }
            ClientRequest::CreateTransport { room_id, direction } => {
                let peer_id = self.peer_in(&room_id);
                let info = self.manager.create_transport(&room_id, &peer_id, direction).await?;
                Ok(json!(info))
            }
            ClientRequest::ConnectTransport {
                room_id,
                transport_id,
                dtls_parameters,
            } => {
                let peer_id = self.peer_in(&room_id);
                self.manager
                    .connect_transport(&room_id, &peer_id, &transport_id, dtls_parameters)
                    .await?;
                Ok(json!({}))
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let m = self.joined()?;
                let producer_id = self
                    .manager
                    .produce(&m.room_id, &m.peer_id, &transport_id, kind, rtp_parameters)
                    .await?;
                Ok(json!({ "producerId": producer_id }))
            }
            ClientRequest::Consume {
                recv_transport_id,
                producer_id,
            } => {
                let m = self.joined()?;
                let info = self
                    .manager
                    .consume(&m.room_id, &m.peer_id, &recv_transport_id, &producer_id)
                    .await?;
                Ok(json!(info))
            }
            ClientRequest::CloseProducer { id } => {
                let m = self.joined()?;
                self.manager.close_producer(&m.room_id, &m.peer_id, &id).await?;
                Ok(json!({}))
            }
            ClientRequest::CloseTransport { transport_id } => {
                let m = self.joined()?;
                self.manager
                    .close_transport(&m.room_id, &m.peer_id, &transport_id)
                    .await?;
                Ok(json!({}))
            }
            ClientRequest::LeaveRoom { id } => {
                let m = self.joined()?;
                if id.as_ref().is_some_and(|room_id| room_id != &m.room_id) {
                    return Err(Error::NotInRoom);
                }
                let Some(m) = self.membership.take() else {
                    return Err(Error::NotInRoom);
                };
                match self.manager.leave(&m.room_id, &m.peer_id).await {
                    // Already gone with its room
                    Ok(()) | Err(Error::RoomNotFound(_) | Error::PeerNotFound(_)) => Ok(json!({})),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Leave the current room, if any; called when the connection ends
    pub async fn close(&mut self) {
        if let Some(m) = self.membership.take() {
            match self.manager.leave(&m.room_id, &m.peer_id).await {
                Ok(()) => debug!(
                    connection_id = %self.connection_id,
                    room_id = %m.room_id,
                    peer_id = %m.peer_id,
                    "Session closed, peer removed"
                ),
                Err(e) => debug!(
                    connection_id = %self.connection_id,
                    room_id = %m.room_id,
                    error = %e,
                    "Session closed after room was gone"
                ),
            }
        }
    }
}
