//! Shared helpers for the SFU integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use metaverse_sfu::engine::{DtlsFingerprint, DtlsParameters, DtlsRole, MediaEngine};
use metaverse_sfu::{
    EventSink, LocalMediaEngine, MediaConfig, MediaKind, PeerId, ProducerId, RoomId,
    ServerEvent, ServerMessage, SfuConfig, SfuManager, TransportDirection, TransportId,
    TransportOptions,
};

pub fn sfu_config(workers: usize) -> SfuConfig {
    SfuConfig {
        num_workers: workers,
        ..Default::default()
    }
}

pub async fn setup(workers: usize) -> (Arc<LocalMediaEngine>, Arc<SfuManager>) {
    setup_with(sfu_config(workers)).await
}

pub async fn setup_with(config: SfuConfig) -> (Arc<LocalMediaEngine>, Arc<SfuManager>) {
    setup_with_media(config, MediaConfig::default()).await
}

pub async fn setup_with_media(
    config: SfuConfig,
    media: MediaConfig,
) -> (Arc<LocalMediaEngine>, Arc<SfuManager>) {
    let options: TransportOptions = media.transport_options();
    let engine = Arc::new(LocalMediaEngine::new(media));
    let manager = SfuManager::init(config, options, engine.clone() as Arc<dyn MediaEngine>)
        .await
        .unwrap();
    (engine, manager)
}

pub struct TestPeer {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub rx: UnboundedReceiver<ServerMessage>,
}

impl TestPeer {
    /// Events received so far, without waiting
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            if let ServerMessage::Event(event) = message {
                events.push(event);
            }
        }
        events
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> ServerEvent {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("no event within 5s")
                .expect("event channel closed");
            if let ServerMessage::Event(event) = message {
                return event;
            }
        }
    }
}

pub async fn join(manager: &SfuManager, room: &str, peer: &str) -> TestPeer {
    let (sink, rx) = EventSink::channel();
    let room_id = RoomId::from(room);
    let peer_id = PeerId::from(peer);
    manager.join(&room_id, &peer_id, sink).await.unwrap();
    TestPeer { room_id, peer_id, rx }
}

pub fn client_dtls(tag: &str) -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: format!("AA:BB:{tag}"),
        }],
    }
}

/// Create and connect a transport for the peer
pub async fn connected_transport(
    manager: &SfuManager,
    peer: &TestPeer,
    direction: TransportDirection,
) -> TransportId {
    let info = manager
        .create_transport(&peer.room_id, &peer.peer_id, direction)
        .await
        .unwrap();
    manager
        .connect_transport(&peer.room_id, &peer.peer_id, &info.transport_id, client_dtls("c"))
        .await
        .unwrap();
    info.transport_id
}

pub fn video_rtp() -> serde_json::Value {
    serde_json::json!({
        "mid": "0",
        "codecs": [{"mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000}],
        "encodings": [{"ssrc": 1111}]
    })
}

/// Produce a video track on a fresh send transport
pub async fn produce_video(manager: &SfuManager, peer: &TestPeer) -> (TransportId, ProducerId) {
    let transport_id = connected_transport(manager, peer, TransportDirection::Send).await;
    let producer_id = manager
        .produce(&peer.room_id, &peer.peer_id, &transport_id, MediaKind::Video, video_rtp())
        .await
        .unwrap();
    (transport_id, producer_id)
}

/// Poll until `check` holds, failing after a few seconds
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
