//! Live class sessions and their registry
//!
//! A [`LiveClassSession`] is the in-memory state for one active class. It
//! exclusively owns everything created against the media engine on the
//! class's behalf: two routers, the transports attached to them, the
//! producers and consumers bound to those transports, the UDP ports leased
//! for recording taps, and the active recording handle.
//!
//! Each session carries a **producer router** and a **consumer router**.
//! The lecturer's client negotiates only against the producer router;
//! viewers negotiate only against the consumer router. Produced streams are
//! piped from the former into the latter once, so a slow or misbehaving
//! viewer transport can never perturb the producer's transport state, and
//! viewer capability sets may differ from the producer's. The pipe is a
//! first-class relation kept in the session's `piped` map.
//!
//! Teardown is explicit ownership walking, not event cascades: `close()`
//! drains the owned maps and closes transports, producers and consumers in
//! a fixed order, releasing leased ports and finally the routers. Every
//! close call is independently best-effort.

use crate::error::{Error, Result};
use crate::recording::RecordingHandle;
use classcast_media::{
    default_media_codecs, ClassId, ConsumerId, MediaConfig, MediaConsumer, MediaEngine, MediaKind,
    MediaProducer, MediaRouter, MediaTransport, PlainTransport, PortAllocator, ProducerId,
    TransportId, WebRtcTransport,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A transport owned by a session, in either family.
#[derive(Clone)]
pub enum TransportSlot {
    WebRtc(Arc<dyn WebRtcTransport>),
    Plain(Arc<dyn PlainTransport>),
}

impl TransportSlot {
    #[must_use]
    pub fn id(&self) -> &TransportId {
        match self {
            Self::WebRtc(t) => t.id(),
            Self::Plain(t) => t.id(),
        }
    }

    pub async fn close(&self) -> std::result::Result<(), classcast_media::MediaError> {
        match self {
            Self::WebRtc(t) => t.close().await,
            Self::Plain(t) => t.close().await,
        }
    }
}

struct SessionState {
    transports: HashMap<TransportId, TransportSlot>,
    producers: Vec<Arc<dyn MediaProducer>>,
    /// Origin producer id → its piped counterpart on the consumer router.
    piped: HashMap<ProducerId, Arc<dyn MediaProducer>>,
    consumers: HashMap<ConsumerId, Arc<dyn MediaConsumer>>,
    leased_ports: Vec<u16>,
    recording: Option<RecordingHandle>,
}

/// In-memory state for one live class.
pub struct LiveClassSession {
    class_id: ClassId,
    producer_router: Arc<dyn MediaRouter>,
    consumer_router: Arc<dyn MediaRouter>,
    state: RwLock<SessionState>,
    finished: AtomicBool,
}

impl LiveClassSession {
    fn new(
        class_id: ClassId,
        producer_router: Arc<dyn MediaRouter>,
        consumer_router: Arc<dyn MediaRouter>,
    ) -> Self {
        Self {
            class_id,
            producer_router,
            consumer_router,
            state: RwLock::new(SessionState {
                transports: HashMap::new(),
                producers: Vec::new(),
                piped: HashMap::new(),
                consumers: HashMap::new(),
                leased_ports: Vec::new(),
                recording: None,
            }),
            finished: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn class_id(&self) -> &ClassId {
        &self.class_id
    }

    #[must_use]
    pub fn producer_router(&self) -> &Arc<dyn MediaRouter> {
        &self.producer_router
    }

    #[must_use]
    pub fn consumer_router(&self) -> &Arc<dyn MediaRouter> {
        &self.consumer_router
    }

    fn ensure_live(&self) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(Error::Conflict("class has already ended".to_string()));
        }
        Ok(())
    }

    /// Register a transport with the session. The caller must close the
    /// transport itself if registration fails, so nothing leaks.
    pub async fn register_transport(&self, slot: TransportSlot) -> Result<()> {
        self.ensure_live()?;
        let mut state = self.state.write().await;
        state.transports.insert(slot.id().clone(), slot);
        Ok(())
    }

    pub async fn transport(&self, id: &TransportId) -> Result<TransportSlot> {
        let state = self.state.read().await;
        state
            .transports
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transport {id}")))
    }

    pub async fn webrtc_transport(&self, id: &TransportId) -> Result<Arc<dyn WebRtcTransport>> {
        match self.transport(id).await? {
            TransportSlot::WebRtc(t) => Ok(t),
            TransportSlot::Plain(_) => Err(Error::Validation(format!(
                "transport {id} is not an interactive transport"
            ))),
        }
    }

    /// Register a producer together with its piped counterpart on the
    /// consumer router. Returns true when this was the class's first
    /// producer (the moment the class goes live).
    pub async fn add_producer(
        &self,
        producer: Arc<dyn MediaProducer>,
        piped: Arc<dyn MediaProducer>,
    ) -> Result<bool> {
        self.ensure_live()?;
        let mut state = self.state.write().await;
        if state.producers.iter().any(|p| p.kind() == producer.kind()) {
            return Err(Error::Conflict(format!(
                "a {} producer already exists for this class",
                producer.kind()
            )));
        }
        let first = state.producers.is_empty();
        state.piped.insert(producer.id().clone(), piped);
        state.producers.push(producer);
        Ok(first)
    }

    pub async fn producer_of_kind(&self, kind: MediaKind) -> Option<Arc<dyn MediaProducer>> {
        let state = self.state.read().await;
        state
            .producers
            .iter()
            .find(|p| p.kind() == kind)
            .cloned()
    }

    /// The consumer-router producer viewers actually attach to.
    pub async fn piped_for(&self, origin: &ProducerId) -> Option<Arc<dyn MediaProducer>> {
        let state = self.state.read().await;
        state.piped.get(origin).cloned()
    }

    /// Whether a live record (at least one registered producer) exists.
    pub async fn has_live_producers(&self) -> bool {
        !self.state.read().await.producers.is_empty()
    }

    pub async fn add_consumer(&self, consumer: Arc<dyn MediaConsumer>) -> Result<()> {
        self.ensure_live()?;
        let mut state = self.state.write().await;
        state.consumers.insert(consumer.id().clone(), consumer);
        Ok(())
    }

    pub async fn consumer(&self, id: &ConsumerId) -> Result<Arc<dyn MediaConsumer>> {
        let state = self.state.read().await;
        state
            .consumers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("consumer {id}")))
    }

    pub async fn add_leased_ports(&self, ports: &[u16]) {
        let mut state = self.state.write().await;
        state.leased_ports.extend_from_slice(ports);
    }

    pub async fn release_ports(&self, ports: &[u16], allocator: &PortAllocator) {
        let mut state = self.state.write().await;
        state.leased_ports.retain(|p| !ports.contains(p));
        drop(state);
        for port in ports {
            allocator.release(*port);
        }
    }

    pub async fn set_recording(&self, handle: RecordingHandle) -> Result<()> {
        self.ensure_live()?;
        let mut state = self.state.write().await;
        if state.recording.is_some() {
            return Err(Error::Conflict(
                "recording is already active for this class".to_string(),
            ));
        }
        state.recording = Some(handle);
        Ok(())
    }

    pub async fn take_recording(&self) -> Option<RecordingHandle> {
        self.state.write().await.recording.take()
    }

    pub async fn recording_active(&self) -> bool {
        self.state.read().await.recording.is_some()
    }

    /// Close one connection's transports and consumers (viewer disconnect).
    /// The rest of the session is untouched.
    pub async fn close_connection_resources(
        &self,
        transport_ids: &[TransportId],
        consumer_ids: &[ConsumerId],
    ) {
        let (consumers, transports) = {
            let mut state = self.state.write().await;
            let consumers: Vec<_> = consumer_ids
                .iter()
                .filter_map(|id| state.consumers.remove(id))
                .collect();
            let transports: Vec<_> = transport_ids
                .iter()
                .filter_map(|id| state.transports.remove(id))
                .collect();
            (consumers, transports)
        };

        for consumer in consumers {
            if let Err(e) = consumer.close().await {
                warn!(class_id = %self.class_id, error = %e, "failed to close consumer");
            }
        }
        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!(class_id = %self.class_id, error = %e, "failed to close transport");
            }
        }
    }

    /// Flip the session into the finished state. Returns true for the one
    /// caller that wins, so end-of-class effects run exactly once.
    pub fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Tear down everything the session owns, in a fixed order. Any active
    /// recording must have been stopped through the recording bridge first;
    /// a handle still present here is only signalled, not flushed.
    pub async fn close(&self, allocator: &PortAllocator) {
        self.finished.store(true, Ordering::Release);

        let (transports, producers, consumers, ports, recording) = {
            let mut state = self.state.write().await;
            (
                std::mem::take(&mut state.transports),
                std::mem::take(&mut state.producers),
                {
                    state.piped.clear();
                    std::mem::take(&mut state.consumers)
                },
                std::mem::take(&mut state.leased_ports),
                state.recording.take(),
            )
        };

        if let Some(handle) = recording {
            warn!(class_id = %self.class_id, "recording still active at session close");
            handle.signal_stop().await;
        }

        for (id, transport) in transports {
            if let Err(e) = transport.close().await {
                warn!(class_id = %self.class_id, transport_id = %id, error = %e, "failed to close transport");
            }
        }
        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!(class_id = %self.class_id, error = %e, "failed to close producer");
            }
        }
        for (id, consumer) in consumers {
            if let Err(e) = consumer.close().await {
                warn!(class_id = %self.class_id, consumer_id = %id, error = %e, "failed to close consumer");
            }
        }
        for port in ports {
            allocator.release(port);
        }
        if let Err(e) = self.producer_router.close().await {
            warn!(class_id = %self.class_id, error = %e, "failed to close producer router");
        }
        if let Err(e) = self.consumer_router.close().await {
            warn!(class_id = %self.class_id, error = %e, "failed to close consumer router");
        }

        info!(class_id = %self.class_id, "session closed");
    }
}

/// Registry of active class sessions, keyed by class id. At most one
/// session exists per class while it is live.
pub struct SessionRegistry {
    engine: Arc<dyn MediaEngine>,
    media: MediaConfig,
    sessions: DashMap<ClassId, Arc<LiveClassSession>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, media: MediaConfig) -> Self {
        Self {
            engine,
            media,
            sessions: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn media_config(&self) -> &MediaConfig {
        &self.media
    }

    /// Fetch the class's session, creating it (with its two routers and
    /// the producer→consumer pipe relation) on first use.
    pub async fn get_or_create(&self, class_id: &ClassId) -> Result<Arc<LiveClassSession>> {
        if let Some(session) = self.sessions.get(class_id) {
            return Ok(Arc::clone(session.value()));
        }

        // Router creation is a suspension point, so a concurrent caller may
        // win the insert below. The loser's routers are closed, not leaked.
        let producer_router = self.engine.create_router(default_media_codecs()).await?;
        let consumer_router = self.engine.create_router(default_media_codecs()).await?;
        let session = Arc::new(LiveClassSession::new(
            class_id.clone(),
            producer_router,
            consumer_router,
        ));

        match self.sessions.entry(class_id.clone()) {
            Entry::Occupied(existing) => {
                let winner = Arc::clone(existing.get());
                drop(existing);
                debug!(class_id = %class_id, "lost session creation race, discarding routers");
                if let Err(e) = session.producer_router.close().await {
                    warn!(class_id = %class_id, error = %e, "failed to close raced producer router");
                }
                if let Err(e) = session.consumer_router.close().await {
                    warn!(class_id = %class_id, error = %e, "failed to close raced consumer router");
                }
                Ok(winner)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                info!(
                    class_id = %class_id,
                    active_sessions = self.sessions.len(),
                    "session created"
                );
                Ok(session)
            }
        }
    }

    #[must_use]
    pub fn get(&self, class_id: &ClassId) -> Option<Arc<LiveClassSession>> {
        self.sessions
            .get(class_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, class_id: &ClassId) -> Option<Arc<LiveClassSession>> {
        self.sessions.remove(class_id).map(|(_, session)| session)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classcast_media::{LoopbackEngine, RtpCodecParameters, RtpParameters, WebRtcTransportOptions};

    fn webrtc_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            max_incoming_bitrate: None,
        }
    }

    fn video_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
            }],
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(LoopbackEngine::new(), MediaConfig::default())
    }

    #[tokio::test]
    async fn one_session_per_class() {
        let registry = registry();
        let class = ClassId::new("class-a");

        let first = registry.get_or_create(&class).await.unwrap();
        let second = registry.get_or_create(&class).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated_between_classes() {
        let registry = registry();
        let session_a = registry.get_or_create(&ClassId::new("class-a")).await.unwrap();
        let session_b = registry.get_or_create(&ClassId::new("class-b")).await.unwrap();

        let transport = session_a
            .producer_router()
            .create_webrtc_transport(webrtc_options())
            .await
            .unwrap();
        let transport_id = transport.id().clone();
        session_a
            .register_transport(TransportSlot::WebRtc(transport))
            .await
            .unwrap();

        assert!(session_a.transport(&transport_id).await.is_ok());
        assert!(matches!(
            session_b.transport(&transport_id).await,
            Err(Error::NotFound(_))
        ));

        // Destroying class A leaves class B untouched.
        let allocator = PortAllocator::new(20000, 20100);
        session_a.close(&allocator).await;
        registry.remove(session_a.class_id());
        assert_eq!(registry.session_count(), 1);
        assert!(registry.get(session_b.class_id()).is_some());
    }

    #[tokio::test]
    async fn duplicate_producer_kind_is_refused() {
        let registry = registry();
        let session = registry.get_or_create(&ClassId::new("class-a")).await.unwrap();

        let transport = session
            .producer_router()
            .create_webrtc_transport(webrtc_options())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, video_parameters())
            .await
            .unwrap();
        let piped = session
            .consumer_router()
            .pipe_producer(producer.kind(), producer.rtp_parameters())
            .await
            .unwrap();

        let first = session
            .add_producer(Arc::clone(&producer), Arc::clone(&piped))
            .await
            .unwrap();
        assert!(first);

        let second = transport
            .produce(MediaKind::Video, video_parameters())
            .await
            .unwrap();
        let result = session.add_producer(second, piped).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn close_releases_leased_ports() {
        let registry = registry();
        let session = registry.get_or_create(&ClassId::new("class-a")).await.unwrap();
        let allocator = PortAllocator::new(20000, 20001);

        let a = allocator.lease().unwrap();
        let b = allocator.lease().unwrap();
        session.add_leased_ports(&[a, b]).await;
        assert_eq!(allocator.leased_count(), 2);

        session.close(&allocator).await;
        assert_eq!(allocator.leased_count(), 0);
        assert!(session.is_finished());
    }

    #[tokio::test]
    async fn finished_session_refuses_new_transports() {
        let registry = registry();
        let session = registry.get_or_create(&ClassId::new("class-a")).await.unwrap();
        let other = registry.get_or_create(&ClassId::new("class-b")).await.unwrap();
        let allocator = PortAllocator::new(20000, 20001);

        session.close(&allocator).await;

        let transport = other
            .producer_router()
            .create_webrtc_transport(webrtc_options())
            .await
            .unwrap();
        let result = session
            .register_transport(TransportSlot::WebRtc(transport))
            .await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn mark_finished_wins_once() {
        let registry = registry();
        let session = registry.get_or_create(&ClassId::new("class-a")).await.unwrap();
        assert!(session.mark_finished());
        assert!(!session.mark_finished());
    }
}
