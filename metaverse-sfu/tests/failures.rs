//! Worker failure isolation and negotiation timeouts
//!
//! Run with: cargo test --test failures

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use common::{
    client_dtls, connected_transport, join, produce_video, setup, setup_with, sfu_config, video_rtp,
    wait_until,
};
use metaverse_sfu::engine::{
    DtlsParameters, EngineEvent, EngineResult, MediaEngine, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportOptions, TransportParameters,
};
use metaverse_sfu::{
    ConsumerId, Error, EventSink, LocalMediaEngine, MediaConfig, MediaKind, PeerId, ProducerId,
    RoomId, RouterId, ServerEvent, SfuConfig, SfuManager, TransportDirection, TransportId,
    WorkerId, REASON_WORKER_UNAVAILABLE,
};

#[tokio::test]
async fn test_worker_death_only_affects_its_rooms() {
    let (engine, manager) = setup(2).await;
    let mut alice = join(&manager, "on-worker-0", "alice").await;
    let mut bob = join(&manager, "on-worker-1", "bob").await;
    let (_, bob_producer) = produce_video(&manager, &bob).await;

    let dead = WorkerId::from("worker-0");
    assert_eq!(
        manager.room_stats(&alice.room_id).await.unwrap().worker_id,
        Some(dead.clone())
    );

    assert!(engine.kill_worker(&dead));

    assert_eq!(
        alice.next_event().await,
        ServerEvent::RoomClosed {
            room_id: alice.room_id.clone(),
            reason: REASON_WORKER_UNAVAILABLE.to_string(),
        }
    );
    wait_until(|| !manager.registry().contains(&alice.room_id)).await;
    assert!(!manager.pool().workers()[0].is_alive());

    // The other room carries on
    assert!(bob.drain().is_empty());
    assert!(manager.is_member(&bob.room_id, &bob.peer_id).await);
    let carol = join(&manager, "on-worker-1", "carol").await;
    let recv = connected_transport(&manager, &carol, TransportDirection::Recv).await;
    manager
        .consume(&carol.room_id, &carol.peer_id, &recv, &bob_producer)
        .await
        .unwrap();

    // Rejoining lands on the surviving worker
    let alice_again = join(&manager, "on-worker-0", "alice").await;
    assert_eq!(
        manager.room_stats(&alice_again.room_id).await.unwrap().worker_id,
        Some(WorkerId::from("worker-1"))
    );
}

#[tokio::test]
async fn test_requests_against_dead_worker_fail_fast() {
    let (engine, manager) = setup(1).await;
    let alice = join(&manager, "r1", "alice").await;

    // Marked dead in the pool before the supervisor tears the room down
    manager.pool().mark_dead(&WorkerId::from("worker-0"));
    let err = manager
        .create_transport(&alice.room_id, &alice.peer_id, TransportDirection::Send)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable(_)));

    engine.kill_worker(&WorkerId::from("worker-0"));
    wait_until(|| manager.room_count() == 0).await;

    let (sink, _rx) = EventSink::channel();
    let err = manager
        .join(&RoomId::from("r2"), &PeerId::from("bob"), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkerPoolExhausted));
}

/// Local engine whose connect, produce and consume calls can be made to hang
///
/// A stalled produce or consume still creates the resource in the engine
/// and then never answers.
struct StallingEngine {
    inner: LocalMediaEngine,
    stall_connect: AtomicBool,
    stall_produce: AtomicBool,
    stall_consume: AtomicBool,
}

impl StallingEngine {
    fn new() -> Self {
        Self {
            inner: LocalMediaEngine::new(MediaConfig::default()),
            stall_connect: AtomicBool::new(false),
            stall_produce: AtomicBool::new(false),
            stall_consume: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaEngine for StallingEngine {
    async fn create_worker(&self, worker_id: &WorkerId) -> EngineResult<()> {
        self.inner.create_worker(worker_id).await
    }

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        router_id: &RouterId,
        codecs: &[RtpCodecCapability],
    ) -> EngineResult<RtpCapabilities> {
        self.inner.create_router(worker_id, router_id, codecs).await
    }

    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()> {
        self.inner.close_router(router_id).await
    }

    async fn create_transport(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
        options: &TransportOptions,
    ) -> EngineResult<TransportParameters> {
        self.inner.create_transport(router_id, transport_id, options).await
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> EngineResult<()> {
        if self.stall_connect.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        self.inner.connect_transport(transport_id, dtls_parameters).await
    }

    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()> {
        self.inner.close_transport(transport_id).await
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> EngineResult<()> {
        self.inner.produce(transport_id, producer_id, kind, rtp_parameters).await?;
        if self.stall_produce.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()> {
        self.inner.close_producer(producer_id).await
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        consumer_id: &ConsumerId,
        producer_id: &ProducerId,
    ) -> EngineResult<RtpParameters> {
        let rtp_parameters = self.inner.consume(transport_id, consumer_id, producer_id).await?;
        if self.stall_consume.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }
        Ok(rtp_parameters)
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()> {
        self.inner.close_consumer(consumer_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.subscribe()
    }
}

async fn stalling_setup() -> (Arc<StallingEngine>, Arc<SfuManager>) {
    let engine = Arc::new(StallingEngine::new());
    let config = SfuConfig {
        negotiation_timeout_secs: 1,
        ..sfu_config(1)
    };
    let manager = SfuManager::init(
        config,
        TransportOptions::default(),
        engine.clone() as Arc<dyn MediaEngine>,
    )
        .await
        .unwrap();
    (engine, manager)
}

#[tokio::test]
async fn test_stalled_connect_times_out_and_closes_transport() {
    let (engine, manager) = stalling_setup().await;
    let alice = join(&manager, "r1", "alice").await;
    let info = manager
        .create_transport(&alice.room_id, &alice.peer_id, TransportDirection::Send)
        .await
        .unwrap();

    engine.stall_connect.store(true, Ordering::Release);
    let err = manager
        .connect_transport(&alice.room_id, &alice.peer_id, &info.transport_id, client_dtls("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NegotiationTimeout(_)));

    let stats = manager.room_stats(&alice.room_id).await.unwrap();
    assert_eq!(stats.transport_count, 0);
    wait_until(|| engine.inner.live_transports() == 0).await;

    // The direction can be negotiated again
    engine.stall_connect.store(false, Ordering::Release);
    connected_transport(&manager, &alice, TransportDirection::Send).await;
}

#[tokio::test]
async fn test_stalled_produce_times_out_without_leaking() {
    let (engine, manager) = stalling_setup().await;
    let mut alice = join(&manager, "r1", "alice").await;
    let mut bob = join(&manager, "r1", "bob").await;
    alice.drain();
    let send = connected_transport(&manager, &bob, TransportDirection::Send).await;

    engine.stall_produce.store(true, Ordering::Release);
    let err = manager
        .produce(&bob.room_id, &bob.peer_id, &send, MediaKind::Video, video_rtp())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NegotiationTimeout(_)));

    let stats = manager.room_stats(&bob.room_id).await.unwrap();
    assert_eq!(stats.producer_count, 0);
    assert_eq!(engine.inner.live_producers(), 0);
    assert!(alice.drain().is_empty());

    // The transport is still usable
    engine.stall_produce.store(false, Ordering::Release);
    manager
        .produce(&bob.room_id, &bob.peer_id, &send, MediaKind::Video, video_rtp())
        .await
        .unwrap();
    assert_eq!(engine.inner.live_producers(), 1);
    assert!(bob.drain().is_empty());
}

#[tokio::test]
async fn test_stalled_consume_times_out_without_leaking() {
    let (engine, manager) = stalling_setup().await;
    let alice = join(&manager, "r1", "alice").await;
    let bob = join(&manager, "r1", "bob").await;
    let (_, producer_id) = produce_video(&manager, &alice).await;
    let recv = connected_transport(&manager, &bob, TransportDirection::Recv).await;

    engine.stall_consume.store(true, Ordering::Release);
    let err = manager
        .consume(&bob.room_id, &bob.peer_id, &recv, &producer_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NegotiationTimeout(_)));

    let stats = manager.room_stats(&bob.room_id).await.unwrap();
    assert_eq!(stats.consumer_count, 0);
    assert_eq!(engine.inner.live_consumers(), 0);

    // A retry gets a fresh consumer
    engine.stall_consume.store(false, Ordering::Release);
    manager
        .consume(&bob.room_id, &bob.peer_id, &recv, &producer_id)
        .await
        .unwrap();
    assert_eq!(engine.inner.live_consumers(), 1);
}

#[tokio::test]
async fn test_unconnected_transport_is_reaped() {
    let (engine, manager) = setup_with(SfuConfig {
        negotiation_timeout_secs: 1,
        ..sfu_config(1)
    })
    .await;
    let alice = join(&manager, "r1", "alice").await;

    let abandoned = manager
        .create_transport(&alice.room_id, &alice.peer_id, TransportDirection::Recv)
        .await
        .unwrap();
    let kept = connected_transport(&manager, &alice, TransportDirection::Send).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let err = manager
        .connect_transport(&alice.room_id, &alice.peer_id, &abandoned.transport_id, client_dtls("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TransportNotFound(_)));
    assert!(engine.is_transport_connected(&kept));
    assert_eq!(engine.live_transports(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_every_room() {
    let (engine, manager) = setup(2).await;
    let mut alice = join(&manager, "r1", "alice").await;
    let mut bob = join(&manager, "r2", "bob").await;

    manager.shutdown().await;

    for peer in [&mut alice, &mut bob] {
        assert!(matches!(
            peer.next_event().await,
            ServerEvent::RoomClosed { reason, .. } if reason == "shutdown"
        ));
    }
    assert_eq!(manager.room_count(), 0);
    assert_eq!(engine.live_routers(), 0);

    let (sink, _rx) = EventSink::channel();
    let err = manager
        .join(&RoomId::from("r3"), &PeerId::from("carol"), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}
