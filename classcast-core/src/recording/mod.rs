//! Recording bridge
//!
//! Re-publishes a class's live producers into the external recorder and
//! wires the recorder's output into the upload pipeline.
//!
//! On start, each live producer (video first, then audio) gets an RTP tap:
//! a leased UDP port (plus an RTCP port when muxing is off), a plain
//! transport on the producer router connected to that port, and a paused
//! consumer whose capability set is the router's matching codec for the
//! producer's kind. The taps are described to the recorder as one SDP
//! block. Because recording starts mid-stream, each tap consumer gets a
//! forced keyframe request immediately before it is resumed; the resume is
//! delayed briefly so the recorder has attached to the ports by the time
//! media flows.

pub mod recorder;

pub use recorder::{FfmpegRecorder, Recorder, RecorderSession};

use crate::config::RecordingConfig;
use crate::error::{Error, Result};
use crate::external::directory::{ClassDirectory, ClassPatch};
use crate::session::{LiveClassSession, TransportSlot};
use crate::upload::{ObjectStore, RecordingUploader, UploadQueue};
use bytes::Bytes;
use chrono::Utc;
use classcast_media::{
    build_session_description, codec_info_from_rtp_parameters, ConsumerId, MediaConfig,
    MediaConsumer, MediaKind, MediaProducer, MediaRouter, MediaTransport, PlainConnectOptions,
    PlainTransport, PlainTransportOptions, PortAllocator, RtpCapabilities, SdpTrack, TransportId,
};
use nanoid::nanoid;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for the recorder's tail to flush downstream.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// State of one active recording, owned by its session.
pub struct RecordingHandle {
    recorder: Arc<dyn RecorderSession>,
    pump: JoinHandle<()>,
    ports: Vec<u16>,
    tap_transports: Vec<TransportId>,
    tap_consumers: Vec<ConsumerId>,
    file_key: String,
}

impl RecordingHandle {
    #[must_use]
    pub fn file_key(&self) -> &str {
        &self.file_key
    }

    /// Last-resort stop used by session teardown when the bridge did not
    /// get to run its orderly stop path.
    pub(crate) async fn signal_stop(&self) {
        self.recorder.stop().await;
    }
}

/// One producer's tap into the recorder.
struct RtpTap {
    leased_ports: Vec<u16>,
    transport_id: TransportId,
    consumer: Arc<dyn MediaConsumer>,
    track: SdpTrack,
}

/// Orchestrates record-start and record-stop for live classes.
pub struct RecordingBridge {
    ports: Arc<PortAllocator>,
    recorder: Arc<dyn Recorder>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<UploadQueue>,
    directory: Arc<dyn ClassDirectory>,
    media: MediaConfig,
    recording: RecordingConfig,
}

impl RecordingBridge {
    #[must_use]
    pub fn new(
        ports: Arc<PortAllocator>,
        recorder: Arc<dyn Recorder>,
        store: Arc<dyn ObjectStore>,
        queue: Arc<UploadQueue>,
        directory: Arc<dyn ClassDirectory>,
        media: MediaConfig,
        recording: RecordingConfig,
    ) -> Self {
        Self {
            ports,
            recorder,
            store,
            queue,
            directory,
            media,
            recording,
        }
    }

    /// Start recording the class's live producers.
    pub async fn start(&self, session: &Arc<LiveClassSession>) -> Result<()> {
        if session.recording_active().await {
            return Err(Error::Conflict(
                "recording is already active for this class".to_string(),
            ));
        }

        let video = session.producer_of_kind(MediaKind::Video).await;
        let audio = session.producer_of_kind(MediaKind::Audio).await;
        if video.is_none() && audio.is_none() {
            // Checked before anything is leased, so a class that never went
            // live fails cleanly with zero ports taken.
            return Err(Error::NotFound(
                "class has no live stream to record".to_string(),
            ));
        }

        let mut taps: Vec<RtpTap> = Vec::new();
        for producer in [video, audio].into_iter().flatten() {
            match self.publish_producer_tap(session, &producer).await {
                Ok(tap) => taps.push(tap),
                Err(e) => {
                    self.teardown_taps(session, &taps).await;
                    return Err(e);
                }
            }
        }

        let video_track = taps
            .iter()
            .find(|t| t.consumer.kind() == MediaKind::Video)
            .map(|t| t.track.clone());
        let audio_track = taps
            .iter()
            .find(|t| t.consumer.kind() == MediaKind::Audio)
            .map(|t| t.track.clone());
        let sdp = build_session_description(
            &self.media.announced_ip,
            video_track.as_ref(),
            audio_track.as_ref(),
        );

        let class_id = session.class_id().clone();
        let file_key = format!("{class_id}-{}.webm", nanoid!(10));

        let uploader = match RecordingUploader::begin(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.directory),
            class_id.clone(),
            file_key.clone(),
            self.recording.part_size_bytes,
            self.recording.completion_timeout(),
        )
        .await
        {
            Ok(uploader) => uploader,
            Err(e) => {
                self.teardown_taps(session, &taps).await;
                return Err(e);
            }
        };

        let recorder_session = match self.recorder.start(sdp).await {
            Ok(recorder_session) => recorder_session,
            Err(e) => {
                // finish() on an untouched uploader aborts the empty upload.
                if let Ok(finished) = uploader.finish().await {
                    drop(finished.watcher);
                }
                self.teardown_taps(session, &taps).await;
                return Err(e);
            }
        };

        let Some(output) = recorder_session.take_output() else {
            self.teardown_taps(session, &taps).await;
            return Err(Error::Internal(
                "recorder session yielded no output stream".to_string(),
            ));
        };
        let pump = tokio::spawn(pump_recorder_output(output, uploader));

        // The recorder needs a moment to attach to the RTP ports; only then
        // are the tap consumers resumed, each preceded by a forced keyframe
        // so the recording decodes from its very first frames.
        let tap_consumers: Vec<Arc<dyn MediaConsumer>> =
            taps.iter().map(|t| Arc::clone(&t.consumer)).collect();
        let resume_delay = self.recording.resume_delay();
        let resume_class = class_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(resume_delay).await;
            for consumer in tap_consumers {
                if let Err(e) = consumer.request_keyframe().await {
                    warn!(class_id = %resume_class, error = %e, "keyframe request failed");
                }
                if let Err(e) = consumer.resume().await {
                    warn!(class_id = %resume_class, error = %e, "failed to resume recording consumer");
                }
            }
        });

        let handle = RecordingHandle {
            recorder: recorder_session,
            pump,
            ports: taps.iter().flat_map(|t| t.leased_ports.clone()).collect(),
            tap_transports: taps.iter().map(|t| t.transport_id.clone()).collect(),
            tap_consumers: taps.iter().map(|t| t.consumer.id().clone()).collect(),
            file_key: file_key.clone(),
        };

        if let Err(e) = session.set_recording(handle).await {
            // Lost a start/start or start/end race; undo everything.
            self.teardown_taps(session, &taps).await;
            return Err(e);
        }

        if let Err(e) = self
            .directory
            .update_class(&class_id, ClassPatch::default().with_started_at(Utc::now()))
            .await
        {
            warn!(class_id = %class_id, error = %e, "failed to record class start time");
        }

        info!(
            class_id = %class_id,
            key = %file_key,
            taps = taps.len(),
            "recording started"
        );
        Ok(())
    }

    /// Stop an active recording: the recorder is signalled, its remaining
    /// output flushes through the upload pipeline as the final part, the
    /// taps are closed and every leased port is returned.
    pub async fn stop(&self, session: &Arc<LiveClassSession>) -> Result<()> {
        let handle = session
            .take_recording()
            .await
            .ok_or_else(|| Error::Conflict("recording is not active for this class".to_string()))?;

        handle.recorder.stop().await;

        match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, handle.pump).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(class_id = %session.class_id(), error = %e, "recording pump panicked"),
            Err(_) => warn!(class_id = %session.class_id(), "recording pump did not drain in time"),
        }

        session.release_ports(&handle.ports, &self.ports).await;
        session
            .close_connection_resources(&handle.tap_transports, &handle.tap_consumers)
            .await;

        if let Err(e) = self
            .directory
            .update_class(
                session.class_id(),
                ClassPatch::default().with_ended_at(Utc::now()),
            )
            .await
        {
            warn!(class_id = %session.class_id(), error = %e, "failed to record class end time");
        }

        info!(
            class_id = %session.class_id(),
            key = %handle.file_key,
            "recording stopped"
        );
        Ok(())
    }

    /// Lease ports for one producer, create its plain transport and paused
    /// tap consumer, and capture the codec for the session description.
    async fn publish_producer_tap(
        &self,
        session: &Arc<LiveClassSession>,
        producer: &Arc<dyn MediaProducer>,
    ) -> Result<RtpTap> {
        let rtp_port = self.ports.lease()?;
        let mut leased = vec![rtp_port];

        // Without RTP/RTCP muxing the recorder listens on a second port.
        let rtcp_port = if self.media.rtcp_mux {
            None
        } else {
            match self.ports.lease() {
                Ok(port) => {
                    leased.push(port);
                    Some(port)
                }
                Err(e) => {
                    self.release_leased(&leased);
                    return Err(e.into());
                }
            }
        };

        match self
            .build_tap(session, producer, rtp_port, rtcp_port, &leased)
            .await
        {
            Ok(tap) => {
                session.add_leased_ports(&leased).await;
                Ok(tap)
            }
            Err(e) => {
                self.release_leased(&leased);
                Err(e)
            }
        }
    }

    async fn build_tap(
        &self,
        session: &Arc<LiveClassSession>,
        producer: &Arc<dyn MediaProducer>,
        rtp_port: u16,
        rtcp_port: Option<u16>,
        leased: &[u16],
    ) -> Result<RtpTap> {
        let router = session.producer_router();

        let transport = router
            .create_plain_transport(PlainTransportOptions {
                listen_ip: self.media.listen_ip.clone(),
                announced_ip: Some(self.media.announced_ip.clone()),
                rtcp_mux: self.media.rtcp_mux,
                comedia: self.media.comedia,
            })
            .await?;
        let transport_id = transport.id().clone();

        if let Err(e) = session
            .register_transport(TransportSlot::Plain(Arc::clone(&transport)))
            .await
        {
            let _ = transport.close().await;
            return Err(e);
        }

        if let Err(e) = transport
            .connect(PlainConnectOptions {
                ip: self.media.announced_ip.clone(),
                port: rtp_port,
                rtcp_port,
            })
            .await
        {
            session
                .close_connection_resources(&[transport_id], &[])
                .await;
            return Err(e.into());
        }

        // The tap consumer must negotiate exactly the router's codec for
        // this kind, which is what the recorder is told to expect.
        let codec = router
            .rtp_capabilities()
            .codec_for(producer.kind())
            .cloned()
            .ok_or_else(|| {
                Error::Engine(format!(
                    "producer router has no {} codec capability",
                    producer.kind()
                ))
            })?;
        let capabilities = RtpCapabilities {
            codecs: vec![codec],
        };

        let consumer = match transport.consume(producer.id(), capabilities, true).await {
            Ok(consumer) => consumer,
            Err(e) => {
                session
                    .close_connection_resources(&[transport_id], &[])
                    .await;
                return Err(e.into());
            }
        };

        if let Err(e) = session.add_consumer(Arc::clone(&consumer)).await {
            let _ = consumer.close().await;
            session
                .close_connection_resources(&[transport_id], &[])
                .await;
            return Err(e);
        }

        let codec_info =
            codec_info_from_rtp_parameters(producer.kind(), &consumer.rtp_parameters())?;

        debug!(
            class_id = %session.class_id(),
            kind = %producer.kind(),
            rtp_port,
            ?rtcp_port,
            codec = %codec_info.codec_name,
            "recording tap ready"
        );

        Ok(RtpTap {
            leased_ports: leased.to_vec(),
            transport_id,
            consumer,
            track: SdpTrack {
                rtp_port,
                codec: codec_info,
            },
        })
    }

    fn release_leased(&self, leased: &[u16]) {
        for port in leased {
            self.ports.release(*port);
        }
    }

    async fn teardown_taps(&self, session: &Arc<LiveClassSession>, taps: &[RtpTap]) {
        let transport_ids: Vec<TransportId> =
            taps.iter().map(|t| t.transport_id.clone()).collect();
        let consumer_ids: Vec<ConsumerId> =
            taps.iter().map(|t| t.consumer.id().clone()).collect();
        session
            .close_connection_resources(&transport_ids, &consumer_ids)
            .await;

        let ports: Vec<u16> = taps.iter().flat_map(|t| t.leased_ports.clone()).collect();
        session.release_ports(&ports, &self.ports).await;
    }
}

/// Moves recorder output into the uploader, then flushes the remainder and
/// arms the completion watcher once the stream ends.
async fn pump_recorder_output(mut output: mpsc::Receiver<Bytes>, mut uploader: RecordingUploader) {
    while let Some(chunk) = output.recv().await {
        if let Err(e) = uploader.push(&chunk).await {
            error!(key = %uploader.key(), error = %e, "failed to dispatch recording bytes");
            break;
        }
    }

    match uploader.finish().await {
        Ok(finished) => {
            debug!(key = %finished.key, parts = finished.parts, "recording bytes flushed");
            // The watcher finalizes (or aborts) on its own from here.
            drop(finished.watcher);
        }
        Err(e) => error!(error = %e, "failed to finish recording upload"),
    }
}
