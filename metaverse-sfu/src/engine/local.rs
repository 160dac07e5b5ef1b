//! In-process media engine
//!
//! Keeps the engine-side resource tables in memory and produces the
//! negotiation parameters a real engine would hand out. It forwards no
//! media. Used by the server binary and as the test double for the
//! orchestration core; `kill_worker` injects worker failures.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

use super::{
    DtlsFingerprint, DtlsParameters, DtlsRole, EngineError, EngineEvent, EngineResult,
    IceCandidate, IceCandidateType, IceParameters, MediaEngine, Protocol, RtpCapabilities,
    RtpCodecCapability, RtpParameters, TransportOptions, TransportParameters,
};
use crate::config::MediaConfig;
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};

const ICE_ALPHABET: [char; 62] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L',
    'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

/// Host candidate priority for RTP component 1 (RFC 8445 §5.1.2.1)
const HOST_CANDIDATE_PRIORITY: u32 = (126 << 24) | (65535 << 8) | 255;

/// First dynamic RTP payload type handed out to codecs without a preference
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

struct LocalRouter {
    worker_id: WorkerId,
}

struct LocalTransport {
    router_id: RouterId,
    options: TransportOptions,
    remote_dtls: Option<DtlsParameters>,
}

struct LocalProducer {
    transport_id: TransportId,
    rtp_parameters: RtpParameters,
}

struct LocalConsumer {
    transport_id: TransportId,
}

#[derive(Default)]
struct EngineState {
    workers: HashMap<WorkerId, bool>,
    routers: HashMap<RouterId, LocalRouter>,
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
    next_port_offset: u32,
}

impl EngineState {
    fn live_worker_of_router(&self, router_id: &RouterId) -> EngineResult<&WorkerId> {
        let router = self
            .routers
            .get(router_id)
            .ok_or_else(|| EngineError::RouterNotFound(router_id.clone()))?;
        match self.workers.get(&router.worker_id) {
            Some(true) => Ok(&router.worker_id),
            _ => Err(EngineError::WorkerDead(router.worker_id.clone())),
        }
    }

    fn transport(&self, transport_id: &TransportId) -> EngineResult<&LocalTransport> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        self.live_worker_of_router(&transport.router_id)?;
        Ok(transport)
    }

    /// Drop everything that hangs off the given transports
    fn drop_transport_children(&mut self, transport_ids: &[TransportId]) {
        let producers: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| transport_ids.contains(&p.transport_id))
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &producers {
            self.producers.remove(producer_id);
        }
        self.consumers
            .retain(|_, c| !transport_ids.contains(&c.transport_id));
    }
}

/// In-memory [`MediaEngine`] implementation
pub struct LocalMediaEngine {
    config: MediaConfig,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    routers_created: AtomicUsize,
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new(config: MediaConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            state: Mutex::new(EngineState::default()),
            events,
            routers_created: AtomicUsize::new(0),
        }
    }

    /// Simulate an unexpected worker exit
    ///
    /// Returns false if the worker is unknown or already dead.
    pub fn kill_worker(&self, worker_id: &WorkerId) -> bool {
        {
            let mut state = self.state.lock();
            match state.workers.get_mut(worker_id) {
                Some(alive) if *alive => *alive = false,
                _ => return false,
            }
        }

        error!(worker_id = %worker_id, "Media worker died");
        let _ = self.events.send(EngineEvent::WorkerDied {
            worker_id: worker_id.clone(),
        });
        true
    }

    /// Total routers ever created
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Acquire)
    }

    pub fn live_routers(&self) -> usize {
        self.state.lock().routers.len()
    }

    pub fn live_transports(&self) -> usize {
        self.state.lock().transports.len()
    }

    pub fn live_producers(&self) -> usize {
        self.state.lock().producers.len()
    }

    pub fn live_consumers(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Whether the engine has accepted DTLS parameters for the transport
    pub fn is_transport_connected(&self, transport_id: &TransportId) -> bool {
        self.state
            .lock()
            .transports
            .get(transport_id)
            .is_some_and(|t| t.remote_dtls.is_some())
    }

    /// Options the transport was created with
    pub fn transport_options(&self, transport_id: &TransportId) -> Option<TransportOptions> {
        self.state
            .lock()
            .transports
            .get(transport_id)
            .map(|t| t.options.clone())
    }

    fn next_port(&self, state: &mut EngineState) -> u16 {
        let span = u32::from(self.config.rtc_max_port.saturating_sub(self.config.rtc_min_port)) + 1;
        let offset = state.next_port_offset % span;
        state.next_port_offset = state.next_port_offset.wrapping_add(1);
        // offset < span <= u16::MAX + 1, and min + offset <= max
        self.config.rtc_min_port + offset as u16
    }

    fn local_fingerprint() -> DtlsFingerprint {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        let digest = hasher.finalize();
        let value = digest
            .iter()
            .map(|byte| hex::encode_upper([*byte]))
            .collect::<Vec<_>>()
            .join(":");

        DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value,
        }
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_worker(&self, worker_id: &WorkerId) -> EngineResult<()> {
        self.state.lock().workers.insert(worker_id.clone(), true);
        debug!(worker_id = %worker_id, "Local worker started");
        Ok(())
    }

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        router_id: &RouterId,
        codecs: &[RtpCodecCapability],
    ) -> EngineResult<RtpCapabilities> {
        let mut state = self.state.lock();
        match state.workers.get(worker_id) {
            Some(true) => {}
            Some(false) => return Err(EngineError::WorkerDead(worker_id.clone())),
            None => return Err(EngineError::WorkerNotFound(worker_id.clone())),
        }

        let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs = codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        state.routers.insert(
            router_id.clone(),
            LocalRouter {
                worker_id: worker_id.clone(),
            },
        );
        self.routers_created.fetch_add(1, Ordering::AcqRel);

        Ok(RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        })
    }

    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.routers.remove(router_id).is_none() {
            return Ok(());
        }

        let transports: Vec<TransportId> = state
            .transports
            .iter()
            .filter(|(_, t)| &t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in &transports {
            state.transports.remove(transport_id);
        }
        state.drop_transport_children(&transports);
        Ok(())
    }

    async fn create_transport(
        &self,
        router_id: &RouterId,
        transport_id: &TransportId,
        options: &TransportOptions,
    ) -> EngineResult<TransportParameters> {
        let mut state = self.state.lock();
        state.live_worker_of_router(router_id)?;

        let port = self.next_port(&mut state);
        state.transports.insert(
            transport_id.clone(),
            LocalTransport {
                router_id: router_id.clone(),
                options: options.clone(),
                remote_dtls: None,
            },
        );
        debug!(
            transport_id = %transport_id,
            max_incoming_bitrate = options.max_incoming_bitrate,
            initial_available_outgoing_bitrate = options.initial_available_outgoing_bitrate,
            "Local transport created"
        );

        Ok(TransportParameters {
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16, &ICE_ALPHABET),
                password: nanoid::nanoid!(32, &ICE_ALPHABET),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                address: options.candidate_address().to_string(),
                protocol: Protocol::Udp,
                port,
                candidate_type: IceCandidateType::Host,
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![Self::local_fingerprint()],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> EngineResult<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Other(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        let mut state = self.state.lock();
        state.transport(transport_id)?;
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.remote_dtls = Some(dtls_parameters.clone());
        }
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.transports.remove(transport_id).is_some() {
            state.drop_transport_children(std::slice::from_ref(transport_id));
        }
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        let transport = state.transport(transport_id)?;
        if transport.remote_dtls.is_none() {
            return Err(EngineError::Other(format!(
                "transport {transport_id} is not connected"
            )));
        }

        state.producers.insert(
            producer_id.clone(),
            LocalProducer {
                transport_id: transport_id.clone(),
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        debug!(producer_id = %producer_id, kind = %kind, "Local producer created");
        Ok(())
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()> {
        self.state.lock().producers.remove(producer_id);
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        consumer_id: &ConsumerId,
        producer_id: &ProducerId,
    ) -> EngineResult<RtpParameters> {
        let mut state = self.state.lock();
        let router_id = state.transport(transport_id)?.router_id.clone();

        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        let producer_router = state
            .transports
            .get(&producer.transport_id)
            .map(|t| t.router_id.clone());
        if producer_router.as_ref() != Some(&router_id) {
            return Err(EngineError::Other(format!(
                "producer {producer_id} is not on router {router_id}"
            )));
        }

        let mut rtp_parameters = producer.rtp_parameters.clone();
        if let Some(object) = rtp_parameters.as_object_mut() {
            let bytes = Uuid::new_v4();
            let b = bytes.as_bytes();
            let ssrc = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
            object.insert(
                "encodings".to_string(),
                serde_json::json!([{ "ssrc": ssrc }]),
            );
        }

        state.consumers.insert(
            consumer_id.clone(),
            LocalConsumer {
                transport_id: transport_id.clone(),
            },
        );
        Ok(rtp_parameters)
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()> {
        self.state.lock().consumers.remove(consumer_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
