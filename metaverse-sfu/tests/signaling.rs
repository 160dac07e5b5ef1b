//! Signaling sessions over the JSON wire format
//!
//! Run with: cargo test --test signaling

mod common;

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use common::setup;
use metaverse_sfu::{EventSink, PeerId, ServerMessage, SfuManager, SignalingSession};

struct Client {
    session: SignalingSession,
    events: UnboundedReceiver<ServerMessage>,
    next_id: u64,
}

impl Client {
    fn new(manager: &Arc<SfuManager>, connection_id: &str) -> Self {
        let (sink, events) = EventSink::channel();
        Self {
            session: SignalingSession::with_connection_id(PeerId::from(connection_id), manager.clone(), sink),
            events,
            next_id: 1,
        }
    }

    /// Send a request and return the acknowledgment as JSON
    async fn request(&mut self, method: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let text = json!({"id": id, "method": method, "data": data}).to_string();
        let reply = self.session.handle_text(&text).await.unwrap();
        let reply: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(reply["response"], true);
        assert_eq!(reply["id"], id);
        reply
    }

    async fn ok(&mut self, method: &str, data: Value) -> Value {
        let reply = self.request(method, data).await;
        assert_eq!(reply["ok"], true, "{method} failed: {reply}");
        reply["data"].clone()
    }

    async fn error_code(&mut self, method: &str, data: Value) -> String {
        let reply = self.request(method, data).await;
        assert_eq!(reply["ok"], false, "{method} unexpectedly succeeded");
        reply["error"]["code"].as_str().unwrap().to_string()
    }

    fn events(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(message) = self.events.try_recv() {
            out.push(serde_json::from_str(&message.to_json().unwrap()).unwrap());
        }
        out
    }

    async fn connected_transport(&mut self, direction: &str) -> String {
        let data = self.ok("createTransport", json!({"roomId": "r1", "direction": direction})).await;
        let transport_id = data["transportId"].as_str().unwrap().to_string();
        self.ok(
            "connectTransport",
            json!({
                "roomId": "r1",
                "transportId": transport_id,
                "dtlsParameters": {"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AA"}]}
            }),
        )
        .await;
        transport_id
    }
}

#[tokio::test]
async fn test_full_exchange_over_json() {
    let (_engine, manager) = setup(1).await;
    let mut alice = Client::new(&manager, "conn-a");
    let mut bob = Client::new(&manager, "conn-b");

    let joined = alice.ok("joinRoom", json!({"roomId": "r1", "peerId": "alice"})).await;
    assert_eq!(joined["peerId"], "alice");
    assert_eq!(joined["routerCapabilities"]["codecs"][0]["mimeType"], "audio/opus");

    let transport = alice.ok("createTransport", json!({"roomId": "r1", "direction": "send"})).await;
    for key in ["transportId", "iceParameters", "iceCandidates", "dtlsParameters"] {
        assert!(!transport[key].is_null(), "missing {key}");
    }
    let send_id = transport["transportId"].as_str().unwrap().to_string();
    let dtls = json!({"role": "client", "fingerprints": [{"algorithm": "sha-256", "value": "AA"}]});
    alice
        .ok("connectTransport", json!({"roomId": "r1", "transportId": send_id, "dtlsParameters": dtls}))
        .await;
    // Same parameters again is a plain ack
    alice
        .ok("connectTransport", json!({"roomId": "r1", "transportId": send_id, "dtlsParameters": dtls}))
        .await;

    let produced = alice
        .ok("produce", json!({"transportId": send_id, "kind": "video", "rtpParameters": {"mid": "0"}}))
        .await;
    let producer_id = produced["producerId"].as_str().unwrap().to_string();

    // Bob joins without a peer id and becomes his connection id
    let joined = bob.ok("joinRoom", json!({"roomId": "r1"})).await;
    assert_eq!(joined["peerId"], "conn-b");
    let events = bob.events();
    assert_eq!(
        events,
        vec![json!({"event": "newProducer", "data": {"producerId": producer_id, "peerId": "alice", "kind": "video"}})]
    );
    assert_eq!(
        alice.events(),
        vec![json!({"event": "peerJoined", "data": {"peerId": "conn-b"}})]
    );

    let recv_id = bob.connected_transport("recv").await;
    let consumed = bob
        .ok("consume", json!({"recvTransportId": recv_id, "producerId": producer_id}))
        .await;
    assert_eq!(consumed["producerId"], producer_id.as_str());
    assert_eq!(consumed["kind"], "video");
    assert!(consumed["consumerId"].is_string());

    alice.ok("closeProducer", json!({"id": producer_id})).await;
    assert_eq!(
        bob.events(),
        vec![json!({"event": "producerClosed", "data": {"producerId": producer_id}})]
    );

    alice.ok("leaveRoom", json!({"id": "r1"})).await;
    assert_eq!(
        bob.events(),
        vec![json!({"event": "peerLeft", "data": {"peerId": "alice"}})]
    );

    bob.session.close().await;
    assert_eq!(manager.room_count(), 0);
}

#[tokio::test]
async fn test_session_error_codes() {
    let (_engine, manager) = setup(1).await;
    let mut alice = Client::new(&manager, "conn-a");

    assert_eq!(alice.error_code("produce", json!({"transportId": "t", "kind": "audio", "rtpParameters": {}})).await, "NotInRoom");
    assert_eq!(alice.error_code("getRouterRtpCapabilities", json!({})).await, "NotInRoom");
    assert_eq!(alice.error_code("createTransport", json!({"roomId": "r1", "direction": "send"})).await, "RoomNotFound");
    assert_eq!(alice.error_code("fly", json!({})).await, "InvalidRequest");
    assert_eq!(alice.error_code("createTransport", json!({"roomId": "r1"})).await, "InvalidRequest");

    alice.ok("joinRoom", json!({"roomId": "r1"})).await;
    assert_eq!(alice.error_code("joinRoom", json!({"roomId": "r2"})).await, "AlreadyInRoom");

    let caps = alice.ok("getRouterRtpCapabilities", json!({})).await;
    assert!(caps["routerCapabilities"]["codecs"].is_array());

    let send = alice.ok("createTransport", json!({"roomId": "r1", "direction": "send"})).await;
    assert_eq!(
        alice.error_code("createTransport", json!({"roomId": "r1", "direction": "send"})).await,
        "TransportAlreadyExists"
    );
    assert_eq!(
        alice
            .error_code("produce", json!({"transportId": send["transportId"], "kind": "video", "rtpParameters": {}}))
            .await,
        "TransportNotReady"
    );
    assert_eq!(
        alice.error_code("consume", json!({"recvTransportId": "x", "producerId": "nope"})).await,
        "ProducerNotFound"
    );
    assert_eq!(alice.error_code("closeTransport", json!({"transportId": "x"})).await, "TransportNotFound");
}

#[tokio::test]
async fn test_malformed_frames() {
    let (_engine, manager) = setup(1).await;
    let mut alice = Client::new(&manager, "conn-a");

    assert!(alice.session.handle_text("not json").await.is_none());
    assert!(alice.session.handle_text(r#"{"method": "joinRoom"}"#).await.is_none());

    let reply = alice.session.handle_text(r#"{"id": 42, "method": 7}"#).await.unwrap();
    let reply: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
    assert_eq!(reply["id"], 42);
    assert_eq!(reply["error"]["code"], "InvalidRequest");
}

#[tokio::test]
async fn test_session_recovers_after_room_closed() {
    let (engine, manager) = setup(2).await;
    let mut alice = Client::new(&manager, "conn-a");
    alice.ok("joinRoom", json!({"roomId": "r1"})).await;

    engine.kill_worker(&"worker-0".into());
    common::wait_until(|| manager.room_count() == 0).await;
    let events = alice.events();
    assert_eq!(events[0]["event"], "roomClosed");
    assert_eq!(events[0]["data"]["reason"], "workerUnavailable");

    // Stale membership does not block a rejoin
    alice.ok("joinRoom", json!({"roomId": "r1"})).await;
    alice.ok("leaveRoom", json!({})).await;
    assert_eq!(alice.error_code("leaveRoom", json!({})).await, "NotInRoom");
}

#[tokio::test]
async fn test_authenticated_session_joins_as_its_user() {
    let (_engine, manager) = setup(1).await;
    let (sink, events) = EventSink::channel();
    let mut alice = Client {
        session: SignalingSession::new(manager.clone(), sink).with_identity(PeerId::from("user-42")),
        events,
        next_id: 1,
    };

    let code = alice
        .error_code("joinRoom", json!({"roomId": "r1", "peerId": "someone-else"}))
        .await;
    assert_eq!(code, "InvalidRequest");
    assert_eq!(manager.room_count(), 0);

    let joined = alice.ok("joinRoom", json!({"roomId": "r1"})).await;
    assert_eq!(joined["peerId"], "user-42");
    assert!(manager.is_member(&"r1".into(), &PeerId::from("user-42")).await);

    // Naming itself explicitly is fine too
    alice.ok("leaveRoom", json!({})).await;
    let joined = alice
        .ok("joinRoom", json!({"roomId": "r1", "peerId": "user-42"}))
        .await;
    assert_eq!(joined["peerId"], "user-42");
}
