//! Two-party call relay
//!
//! A reduced signaling mode with no router: offers, answers and ICE
//! candidates are forwarded verbatim between clients, addressed by an
//! identifier (usually an email) each client registers when joining.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client -> server relay messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayRequest {
    JoinRoom { roomid: String, email: String },
    CallUser { email: String, offer: Value },
    CallAccepted { to: String, answer: Value },
    IceCandidate { to: String, candidate: Value },
}

/// Server -> client relay messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    JoinedRoom {
        roomid: String,
    },
    UserJoined {
        email: String,
    },
    IncomingCall {
        #[serde(rename = "fromEmail")]
        from_email: String,
        offer: Value,
    },
    IncomingCallAccepted {
        from: String,
        answer: Value,
    },
    IncomingIceCandidate {
        from: String,
        candidate: Value,
    },
}

struct RelayClient {
    connection_id: String,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

/// Identifier -> connection map shared by all relay connections
#[derive(Default)]
pub struct RelayHub {
    clients: DashMap<String, RelayClient>,
    /// Room id -> member email -> owning connection id
    rooms: DashMap<String, HashMap<String, String>>,
}

impl RelayHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection
    #[must_use]
    pub fn connect(self: &Arc<Self>, tx: mpsc::UnboundedSender<RelayEvent>) -> RelayConnection {
        RelayConnection {
            id: nanoid::nanoid!(),
            identity: None,
            tx,
            hub: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_online(&self, email: &str) -> bool {
        self.clients.contains_key(email)
    }

    /// Deliver to the connection registered as `email`
    fn send_to(&self, email: &str, event: RelayEvent) -> bool {
        let Some(client) = self.clients.get(email) else {
            debug!(to = email, "Relay target not connected");
            return false;
        };
        if client.tx.send(event).is_err() {
            let connection_id = client.connection_id.clone();
            drop(client);
            self.clients
                .remove_if(email, |_, c| c.connection_id == connection_id);
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
struct Identity {
    email: String,
    roomid: String,
}

/// One relay client connection
pub struct RelayConnection {
    id: String,
    identity: Option<Identity>,
    tx: mpsc::UnboundedSender<RelayEvent>,
    hub: Arc<RelayHub>,
}

impl RelayConnection {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.email.as_str())
    }

    /// Parse and handle one text frame; malformed frames are logged and dropped
    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<RelayRequest>(text) {
            Ok(request) => self.handle(request),
            Err(e) => warn!(connection_id = %self.id, error = %e, "Dropping malformed relay frame"),
        }
    }

    pub fn handle(&mut self, request: RelayRequest) {
        match request {
            RelayRequest::JoinRoom { roomid, email } => self.join(roomid, email),
            RelayRequest::CallUser { email, offer } => {
                if let Some(from) = self.sender("call-user") {
                    self.hub.send_to(&email, RelayEvent::IncomingCall { from_email: from, offer });
                }
            }
            RelayRequest::CallAccepted { to, answer } => {
                if let Some(from) = self.sender("call-accepted") {
                    self.hub.send_to(&to, RelayEvent::IncomingCallAccepted { from, answer });
                }
            }
            RelayRequest::IceCandidate { to, candidate } => {
                if let Some(from) = self.sender("ice-candidate") {
                    self.hub.send_to(&to, RelayEvent::IncomingIceCandidate { from, candidate });
                }
            }
        }
    }

    fn sender(&self, event: &'static str) -> Option<String> {
        let email = self.email().map(str::to_string);
        if email.is_none() {
            warn!(connection_id = %self.id, event, "Relay message before join-room, dropped");
        }
        email
    }

    fn join(&mut self, roomid: String, email: String) {
        self.leave();

        self.hub.clients.insert(
            email.clone(),
            RelayClient {
                connection_id: self.id.clone(),
                tx: self.tx.clone(),
            },
        );

        let others: Vec<String> = {
            let mut members = self.hub.rooms.entry(roomid.clone()).or_default();
            let others = members.keys().filter(|m| **m != email).cloned().collect();
            members.insert(email.clone(), self.id.clone());
            others
        };

        let _ = self.tx.send(RelayEvent::JoinedRoom {
            roomid: roomid.clone(),
        });
        for other in others {
            self.hub.send_to(&other, RelayEvent::UserJoined { email: email.clone() });
        }

        info!(connection_id = %self.id, roomid = %roomid, email = %email, "Relay client joined");
        self.identity = Some(Identity { email, roomid });
    }

    /// Drop this connection's registration
    pub fn leave(&mut self) {
        let Some(identity) = self.identity.take() else {
            return;
        };

        let id = self.id.clone();
        self.hub
            .clients
            .remove_if(&identity.email, |_, client| client.connection_id == id);

        if let Some(mut members) = self.hub.rooms.get_mut(&identity.roomid) {
            if members.get(&identity.email) == Some(&id) {
                members.remove(&identity.email);
            }
        }
        self.hub
            .rooms
            .remove_if(&identity.roomid, |_, members| members.is_empty());

        debug!(connection_id = %self.id, email = %identity.email, "Relay client left");
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.leave();
    }
}
