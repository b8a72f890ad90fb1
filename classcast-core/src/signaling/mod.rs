//! Signaling protocol handler
//!
//! One [`Connection`] exists per signaling socket; its requests are
//! handled sequentially by [`SignalingService::handle`], which walks the
//! negotiation sequence (capabilities → transport → connect →
//! produce/consume → resume) against the class's session and converts
//! every failure into a structured error response — a failed request
//! never tears the connection down, and a resource created but not yet
//! registered with the session is closed rather than leaked.
//!
//! End-of-class is funneled through one path regardless of trigger
//! (explicit `endLiveClass` or the producer's socket dropping): the
//! session's finished flag is flipped exactly once, the recording is
//! stopped, owned media resources are torn down in a fixed order, the
//! roster is cleared, the directory is updated and `classEnded` is
//! broadcast a single time.

pub mod hub;
pub mod messages;

pub use hub::{ClassHub, ConnectionId, EventEnvelope};
pub use messages::{
    ClientRequest, ErrorBody, RequestEnvelope, ResponseEnvelope, ResponsePayload, Role,
    ServerEvent,
};

use crate::error::{Error, Result};
use crate::external::directory::{ClassDirectory, ClassPatch, ClassStatus};
use crate::external::messages::{MessageStore, NewMessage};
use crate::external::presence::PresenceStore;
use crate::recording::RecordingBridge;
use crate::session::{LiveClassSession, SessionRegistry, TransportSlot};
use chrono::Utc;
use classcast_media::{
    ClassId, ConsumerId, DtlsParameters, MediaConsumer, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, PortAllocator, RtpCapabilities, RtpParameters, TransportId, WebRtcTransport,
    WebRtcTransportOptions,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Per-connection protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Connected,
    CapabilitiesExchanged,
    TransportsReady,
    Streaming,
    Ended,
}

/// State for one signaling connection.
pub struct Connection {
    id: ConnectionId,
    class_id: ClassId,
    role: Role,
    student: Option<String>,
    state: ConnState,
    transports: Vec<TransportId>,
    consumers: Vec<ConsumerId>,
    participant_id: Option<String>,
}

impl Connection {
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub const fn class_id(&self) -> &ClassId {
        &self.class_id
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state
    }
}

/// The signaling protocol service shared by all connections.
pub struct SignalingService {
    registry: Arc<SessionRegistry>,
    ports: Arc<PortAllocator>,
    bridge: Arc<RecordingBridge>,
    presence: Arc<dyn PresenceStore>,
    directory: Arc<dyn ClassDirectory>,
    messages: Arc<dyn MessageStore>,
    hub: ClassHub,
    next_connection_id: AtomicU64,
}

impl SignalingService {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        ports: Arc<PortAllocator>,
        bridge: Arc<RecordingBridge>,
        presence: Arc<dyn PresenceStore>,
        directory: Arc<dyn ClassDirectory>,
        messages: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            registry,
            ports,
            bridge,
            presence,
            directory,
            messages,
            hub: ClassHub::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Open a logical connection for one signaling socket and join the
    /// class's event stream.
    pub fn connect(
        &self,
        class_id: ClassId,
        role: Role,
        student: Option<String>,
    ) -> (Connection, broadcast::Receiver<EventEnvelope>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let events = self.hub.subscribe(&class_id);

        debug!(class_id = %class_id, connection_id = id, ?role, "signaling connection opened");

        (
            Connection {
                id,
                class_id,
                role,
                student,
                state: ConnState::Connected,
                transports: Vec::new(),
                consumers: Vec::new(),
                participant_id: None,
            },
            events,
        )
    }

    /// Handle one request. Always resolves to a payload or a structured
    /// error; never panics the connection.
    pub async fn handle(
        &self,
        conn: &mut Connection,
        request: ClientRequest,
    ) -> Result<ResponsePayload> {
        if conn.state == ConnState::Ended {
            return Err(Error::Conflict("connection has ended".to_string()));
        }

        match request {
            ClientRequest::GetRtpCapabilities => self.get_rtp_capabilities(conn).await,
            ClientRequest::CreateTransport => self.create_transport(conn).await,
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(conn, &transport_id, dtls_parameters).await,
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(conn, &transport_id, kind, rtp_parameters).await,
            ClientRequest::ConsumeMedia {
                transport_id,
                kind,
                rtp_capabilities,
            } => {
                self.consume_media(conn, &transport_id, kind, rtp_capabilities)
                    .await
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                self.resume_consumer(conn, &consumer_id).await
            }
            ClientRequest::NewParticipant { student } => self.new_participant(conn, student).await,
            ClientRequest::Message { content } => self.message(conn, content).await,
            ClientRequest::GetParticipants => self.get_participants(conn).await,
            ClientRequest::StartLiveRecord => self.start_live_record(conn).await,
            ClientRequest::StopLiveRecord => self.stop_live_record(conn).await,
            ClientRequest::EndLiveClass => self.end_live_class(conn).await,
            ClientRequest::LeaveClass => self.leave_class(conn).await,
        }
    }

    /// The socket dropped. Producers take the whole class down with them;
    /// a viewer only releases its own transports, consumers and roster
    /// entry.
    pub async fn disconnect(&self, conn: &mut Connection) {
        if conn.state == ConnState::Ended {
            return;
        }
        conn.state = ConnState::Ended;

        match conn.role {
            Role::Producer => {
                info!(class_id = %conn.class_id, "producer disconnected, ending class");
                self.finish_class(&conn.class_id, Some(conn.id)).await;
            }
            Role::Viewer => {
                debug!(class_id = %conn.class_id, connection_id = conn.id, "viewer disconnected");
                self.viewer_cleanup(conn).await;
            }
        }
    }

    fn session(&self, class_id: &ClassId) -> Result<Arc<LiveClassSession>> {
        self.registry
            .get(class_id)
            .ok_or_else(|| Error::NotFound("class has not started yet".to_string()))
    }

    async fn get_rtp_capabilities(&self, conn: &mut Connection) -> Result<ResponsePayload> {
        let class = self.directory.get_class(&conn.class_id).await?;
        if class.status == ClassStatus::Finished {
            return Err(Error::Conflict(
                "this class has already been completed".to_string(),
            ));
        }

        // The producing client's first capability request brings the
        // session (and its two routers) into existence.
        let session = match conn.role {
            Role::Producer => self.registry.get_or_create(&conn.class_id).await?,
            Role::Viewer => self.session(&conn.class_id)?,
        };

        let capabilities = match conn.role {
            Role::Producer => session.producer_router().rtp_capabilities(),
            Role::Viewer => session.consumer_router().rtp_capabilities(),
        };

        if conn.state == ConnState::Connected {
            conn.state = ConnState::CapabilitiesExchanged;
        }

        Ok(ResponsePayload::RtpCapabilities {
            rtp_capabilities: capabilities,
        })
    }

    async fn create_transport(&self, conn: &mut Connection) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        let media = self.registry.media_config();

        let router = match conn.role {
            Role::Producer => session.producer_router(),
            Role::Viewer => session.consumer_router(),
        };

        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions {
                listen_ip: media.listen_ip.clone(),
                announced_ip: Some(media.announced_ip.clone()),
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
                max_incoming_bitrate: (media.max_incoming_bitrate > 0)
                    .then_some(media.max_incoming_bitrate),
            })
            .await?;
        let info = transport.connect_info();

        if let Err(e) = session
            .register_transport(TransportSlot::WebRtc(Arc::clone(&transport)))
            .await
        {
            // Not registered anywhere; close instead of leaking it.
            let _ = transport.close().await;
            return Err(e);
        }

        conn.transports.push(info.transport_id.clone());
        if conn.state < ConnState::TransportsReady {
            conn.state = ConnState::TransportsReady;
        }

        Ok(ResponsePayload::TransportCreated(info))
    }

    async fn connect_transport(
        &self,
        conn: &Connection,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        let transport = session.webrtc_transport(transport_id).await?;
        transport.connect(dtls_parameters).await?;
        Ok(ResponsePayload::ack())
    }

    async fn produce(
        &self,
        conn: &mut Connection,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        let transport = session.webrtc_transport(transport_id).await?;

        let producer = transport.produce(kind, rtp_parameters).await?;

        // Feed the stream across the router pipe so viewers negotiate only
        // against the consumer router.
        let piped = match session
            .consumer_router()
            .pipe_producer(producer.kind(), producer.rtp_parameters())
            .await
        {
            Ok(piped) => piped,
            Err(e) => {
                let _ = producer.close().await;
                return Err(e.into());
            }
        };

        let producer_id = producer.id().clone();
        let first = match session.add_producer(producer, Arc::clone(&piped)).await {
            Ok(first) => first,
            Err(e) => {
                let _ = piped.close().await;
                return Err(e);
            }
        };

        if first {
            // The class is live from the first producer onward.
            if let Err(e) = self
                .directory
                .update_class(
                    &conn.class_id,
                    ClassPatch::default().with_status(ClassStatus::Live),
                )
                .await
            {
                warn!(class_id = %conn.class_id, error = %e, "failed to mark class live");
            }
        }

        conn.state = ConnState::Streaming;
        info!(class_id = %conn.class_id, producer_id = %producer_id, %kind, "producer registered");

        Ok(ResponsePayload::Produced { producer_id })
    }

    async fn consume_media(
        &self,
        conn: &mut Connection,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        if !session.has_live_producers().await {
            return Err(Error::NotFound("class has not started yet".to_string()));
        }

        let producer = session
            .producer_of_kind(kind)
            .await
            .ok_or_else(|| Error::NotFound(format!("class has no live {kind} stream")))?;
        let piped = session
            .piped_for(producer.id())
            .await
            .ok_or_else(|| Error::Engine(format!("{kind} stream is not piped for viewers")))?;

        if !session
            .consumer_router()
            .can_consume(piped.id(), &rtp_capabilities)
        {
            return Err(Error::Conflict(
                "cannot consume this stream with the offered capabilities".to_string(),
            ));
        }

        let transport = session.webrtc_transport(transport_id).await?;
        // Two-phase activation: created paused, resumed once the viewer
        // has signaled readiness.
        let consumer = transport.consume(piped.id(), rtp_capabilities, true).await?;

        if let Err(e) = session.add_consumer(Arc::clone(&consumer)).await {
            let _ = consumer.close().await;
            return Err(e);
        }

        conn.consumers.push(consumer.id().clone());
        conn.state = ConnState::Streaming;

        Ok(ResponsePayload::Consumed {
            id: consumer.id().clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            producer_id: consumer.producer_id().clone(),
        })
    }

    async fn resume_consumer(
        &self,
        conn: &Connection,
        consumer_id: &ConsumerId,
    ) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        let consumer = session.consumer(consumer_id).await?;
        consumer.resume().await?;
        Ok(ResponsePayload::ack())
    }

    async fn new_participant(
        &self,
        conn: &mut Connection,
        student: String,
    ) -> Result<ResponsePayload> {
        let participant = self.presence.join(&conn.class_id, &student).await?;
        conn.participant_id = Some(participant.id.clone());

        self.hub.publish(
            &conn.class_id,
            Some(conn.id),
            ServerEvent::NewParticipant(participant),
        );
        Ok(ResponsePayload::ack())
    }

    async fn message(&self, conn: &Connection, content: String) -> Result<ResponsePayload> {
        let sender = conn.student.clone().unwrap_or_else(|| {
            match conn.role {
                Role::Producer => "lecturer",
                Role::Viewer => "viewer",
            }
            .to_string()
        });

        let message = self
            .messages
            .create_message(NewMessage {
                class_id: conn.class_id.clone(),
                sender,
                content,
            })
            .await?;

        self.hub.publish(
            &conn.class_id,
            Some(conn.id),
            ServerEvent::MessageReceived(message.clone()),
        );
        Ok(ResponsePayload::Message { message })
    }

    async fn get_participants(&self, conn: &Connection) -> Result<ResponsePayload> {
        let participants = self.presence.roster(&conn.class_id).await?;
        Ok(ResponsePayload::Participants { participants })
    }

    async fn start_live_record(&self, conn: &Connection) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        self.bridge.start(&session).await?;
        Ok(ResponsePayload::ack())
    }

    async fn stop_live_record(&self, conn: &Connection) -> Result<ResponsePayload> {
        let session = self.session(&conn.class_id)?;
        self.bridge.stop(&session).await?;
        Ok(ResponsePayload::ack())
    }

    async fn end_live_class(&self, conn: &mut Connection) -> Result<ResponsePayload> {
        if conn.role != Role::Producer {
            return Err(Error::Conflict(
                "only the producing client can end the class".to_string(),
            ));
        }
        conn.state = ConnState::Ended;
        self.finish_class(&conn.class_id, Some(conn.id)).await;
        Ok(ResponsePayload::ack())
    }

    async fn leave_class(&self, conn: &mut Connection) -> Result<ResponsePayload> {
        conn.state = ConnState::Ended;
        match conn.role {
            Role::Producer => self.finish_class(&conn.class_id, Some(conn.id)).await,
            Role::Viewer => self.viewer_cleanup(conn).await,
        }
        Ok(ResponsePayload::ack())
    }

    /// Release one viewer's session resources and roster entry.
    async fn viewer_cleanup(&self, conn: &mut Connection) {
        if let Some(session) = self.registry.get(&conn.class_id) {
            session
                .close_connection_resources(&conn.transports, &conn.consumers)
                .await;
        }

        if let Some(participant_id) = conn.participant_id.take() {
            match self.presence.leave(&participant_id).await {
                Ok(Some(participant)) => {
                    self.hub.publish(
                        &conn.class_id,
                        Some(conn.id),
                        ServerEvent::LeftClass(participant),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(class_id = %conn.class_id, error = %e, "failed to remove roster entry");
                }
            }
        }
    }

    /// End-of-class path, shared by `endLiveClass` and producer
    /// disconnect. Runs its effects exactly once per class.
    async fn finish_class(&self, class_id: &ClassId, origin: Option<ConnectionId>) {
        let Some(session) = self.registry.get(class_id) else {
            return;
        };
        if !session.mark_finished() {
            return;
        }

        if session.recording_active().await {
            if let Err(e) = self.bridge.stop(&session).await {
                warn!(class_id = %class_id, error = %e, "failed to stop recording at class end");
            }
        }

        session.close(&self.ports).await;

        if let Err(e) = self.presence.clear(class_id).await {
            warn!(class_id = %class_id, error = %e, "failed to clear roster");
        }

        if let Err(e) = self
            .directory
            .update_class(
                class_id,
                ClassPatch::default()
                    .with_status(ClassStatus::Finished)
                    .with_ended_at(Utc::now()),
            )
            .await
        {
            warn!(class_id = %class_id, error = %e, "failed to mark class finished");
        }

        self.hub.publish(class_id, origin, ServerEvent::ClassEnded);
        self.registry.remove(class_id);
        self.hub.remove(class_id);

        info!(class_id = %class_id, "class ended");
    }
}
