//! In-process media engine
//!
//! A loopback implementation of the engine facade. It performs the full
//! router / transport / producer / consumer bookkeeping (capability
//! matching, pause state, keyframe requests, piping) without moving any
//! media bytes, which is exactly what the signaling and recording paths
//! need in tests and single-node development. A production deployment
//! binds the facade to a real SFU engine instead.

use crate::engine::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaConsumer,
    MediaEngine, MediaProducer, MediaRouter, MediaTransport, PlainConnectOptions, PlainTransport,
    PlainTransportOptions, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    TransportConnectInfo, WebRtcTransport, WebRtcTransportOptions,
};
use crate::error::{MediaError, Result};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::Mutex;
use rand::RngExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Loopback media engine.
pub struct LoopbackEngine;

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn MediaRouter>> {
        let router = LoopbackRouter::new(media_codecs);
        debug!(router_id = %router.id, "loopback router created");
        Ok(router)
    }
}

struct LoopbackRouter {
    id: RouterId,
    capabilities: RtpCapabilities,
    producers: DashMap<ProducerId, Arc<LoopbackProducer>>,
    closed: AtomicBool,
    // Handed to transports so they can resolve producers at consume time.
    me: Weak<Self>,
}

impl LoopbackRouter {
    fn new(media_codecs: Vec<RtpCodecCapability>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: RouterId::new(nanoid!()),
            capabilities: RtpCapabilities {
                codecs: media_codecs,
            },
            producers: DashMap::new(),
            closed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed("router"));
        }
        Ok(())
    }

    fn strong(&self) -> Result<Arc<Self>> {
        self.me
            .upgrade()
            .ok_or(MediaError::Closed("router"))
    }

    fn register_producer(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<LoopbackProducer>> {
        self.ensure_open()?;
        if rtp_parameters.codecs.is_empty() {
            return Err(MediaError::Engine(
                "rtp parameters carry no codec".to_string(),
            ));
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(nanoid!()),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
        });
        self.producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        Ok(producer)
    }

    /// Codec the offered capabilities would negotiate for this producer.
    fn matching_codec(
        &self,
        producer: &LoopbackProducer,
        offered: &RtpCapabilities,
    ) -> Option<RtpCodecCapability> {
        let produced_mime = &producer.rtp_parameters.codecs.first()?.mime_type;
        offered
            .codecs
            .iter()
            .find(|c| c.kind == producer.kind && c.mime_type.eq_ignore_ascii_case(produced_mime))
            .cloned()
    }

    fn consume_from(
        &self,
        producer_id: &ProducerId,
        offered: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<LoopbackConsumer>> {
        self.ensure_open()?;
        let producer = self
            .producers
            .get(producer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediaError::NotFound(format!("producer {producer_id}")))?;
        if producer.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed("producer"));
        }

        let codec = self.matching_codec(&producer, &offered).ok_or_else(|| {
            MediaError::Incompatible(format!(
                "offered capabilities cannot receive {} producer {producer_id}",
                producer.kind
            ))
        })?;

        let produced = &producer.rtp_parameters.codecs[0];
        let rtp_parameters = RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type,
                payload_type: codec.preferred_payload_type.unwrap_or(produced.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels.or(produced.channels),
            }],
        };

        Ok(Arc::new(LoopbackConsumer {
            id: ConsumerId::new(nanoid!()),
            kind: producer.kind,
            producer_id: producer.id.clone(),
            rtp_parameters,
            paused: AtomicBool::new(paused),
            keyframe_requests: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>> {
        self.ensure_open()?;
        Ok(Arc::new(LoopbackWebRtcTransport::new(
            self.strong()?,
            options,
        )))
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>> {
        self.ensure_open()?;
        Ok(Arc::new(LoopbackPlainTransport {
            id: TransportId::new(nanoid!()),
            router: self.strong()?,
            options,
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(producer) = self.producers.get(producer_id) else {
            return false;
        };
        if producer.closed.load(Ordering::Acquire) {
            return false;
        }
        self.matching_codec(&producer, rtp_capabilities).is_some()
    }

    async fn pipe_producer(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>> {
        let producer = self.register_producer(kind, rtp_parameters)?;
        debug!(router_id = %self.id, producer_id = %producer.id, "producer piped into router");
        Ok(producer)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for entry in &self.producers {
            entry.value().closed.store(true, Ordering::Release);
        }
        self.producers.clear();
        debug!(router_id = %self.id, "loopback router closed");
        Ok(())
    }
}

struct LoopbackWebRtcTransport {
    id: TransportId,
    router: Arc<LoopbackRouter>,
    connect_info: TransportConnectInfo,
    remote_dtls: Mutex<Option<DtlsParameters>>,
    closed: AtomicBool,
}

impl LoopbackWebRtcTransport {
    fn new(router: Arc<LoopbackRouter>, options: WebRtcTransportOptions) -> Self {
        let id = TransportId::new(nanoid!());
        let address = options
            .announced_ip
            .unwrap_or_else(|| options.listen_ip.clone());
        let mut rng = rand::rng();

        let connect_info = TransportConnectInfo {
            transport_id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: nanoid!(16),
                password: nanoid!(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: rng.random_range(1..=u32::from(u16::MAX)),
                address,
                port: rng.random_range(40000..=49999),
                protocol: "udp".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: nanoid!(64),
                }],
            },
        };

        Self {
            id,
            router,
            connect_info,
            remote_dtls: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed("transport"));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for LoopbackWebRtcTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        let consumer = self
            .router
            .consume_from(producer_id, rtp_capabilities, paused)?;
        Ok(consumer)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl WebRtcTransport for LoopbackWebRtcTransport {
    fn connect_info(&self) -> TransportConnectInfo {
        self.connect_info.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.ensure_open()?;
        *self.remote_dtls.lock() = Some(dtls_parameters);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>> {
        self.ensure_open()?;
        let producer = self.router.register_producer(kind, rtp_parameters)?;
        debug!(
            transport_id = %self.id,
            producer_id = %producer.id,
            kind = %kind,
            "producer attached"
        );
        Ok(producer)
    }
}

struct LoopbackPlainTransport {
    id: TransportId,
    router: Arc<LoopbackRouter>,
    options: PlainTransportOptions,
    remote: Mutex<Option<PlainConnectOptions>>,
    closed: AtomicBool,
}

impl LoopbackPlainTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed("transport"));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for LoopbackPlainTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        let consumer = self
            .router
            .consume_from(producer_id, rtp_capabilities, paused)?;
        Ok(consumer)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl PlainTransport for LoopbackPlainTransport {
    async fn connect(&self, remote: PlainConnectOptions) -> Result<()> {
        self.ensure_open()?;
        if !self.options.rtcp_mux && remote.rtcp_port.is_none() {
            return Err(MediaError::Engine(
                "rtcp port required when rtcp-mux is off".to_string(),
            ));
        }
        *self.remote.lock() = Some(remote);
        Ok(())
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    kind: MediaKind,
    producer_id: ProducerId,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    keyframe_requests: AtomicU32,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed("consumer"));
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }

    async fn request_keyframe(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MediaError::Closed("consumer"));
        }
        let requests = self.keyframe_requests.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(consumer_id = %self.id, requests, "keyframe requested");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
