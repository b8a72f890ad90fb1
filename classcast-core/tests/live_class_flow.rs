//! End-to-end tests for the live class signaling, recording and upload
//! flow, running against the in-process engine and stores.
//!
//! Run with: cargo test --test live_class_flow

use bytes::Bytes;
use classcast_core::error::Error;
use classcast_core::external::directory::ClassStatus;
use classcast_core::external::presence::PresenceStore;
use classcast_core::signaling::{
    ClientRequest, Connection, EventEnvelope, ResponsePayload, Role, ServerEvent,
};
use classcast_core::test_support::{test_stack, ScriptedRecorder, TestStack};
use classcast_media::{
    default_media_codecs, ClassId, ConsumerId, MediaConsumer, MediaKind, RtpCapabilities,
    RtpCodecParameters, RtpParameters, TransportId,
};
use std::time::Duration;
use tokio::sync::broadcast;

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

fn audio_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
        }],
    }
}

fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs(),
    }
}

fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs()
            .into_iter()
            .filter(|c| c.kind == MediaKind::Audio)
            .collect(),
    }
}

/// Walk a connection through capabilities → transport → connect.
async fn negotiate_transport(stack: &TestStack, conn: &mut Connection) -> TransportId {
    stack
        .service
        .handle(conn, ClientRequest::GetRtpCapabilities)
        .await
        .expect("capabilities");

    let created = stack
        .service
        .handle(conn, ClientRequest::CreateTransport)
        .await
        .expect("transport");
    let ResponsePayload::TransportCreated(info) = created else {
        panic!("unexpected payload for createTransport");
    };

    stack
        .service
        .handle(
            conn,
            ClientRequest::ConnectTransport {
                transport_id: info.transport_id.clone(),
                dtls_parameters: info.dtls_parameters.clone(),
            },
        )
        .await
        .expect("connect");

    info.transport_id
}

/// Producer handshake plus audio+video produce.
async fn start_class(stack: &TestStack, class: &ClassId) -> (Connection, TransportId) {
    stack.directory.register(class.clone()).await;
    let (mut producer, _events) =
        stack
            .service
            .connect(class.clone(), Role::Producer, Some("lecturer".to_string()));
    let transport_id = negotiate_transport(stack, &mut producer).await;

    for (kind, rtp_parameters) in [
        (MediaKind::Video, video_parameters()),
        (MediaKind::Audio, audio_parameters()),
    ] {
        stack
            .service
            .handle(
                &mut producer,
                ClientRequest::Produce {
                    transport_id: transport_id.clone(),
                    kind,
                    rtp_parameters,
                },
            )
            .await
            .expect("produce");
    }

    (producer, transport_id)
}

async fn consume(
    stack: &TestStack,
    conn: &mut Connection,
    transport_id: &TransportId,
    kind: MediaKind,
) -> ConsumerId {
    let payload = stack
        .service
        .handle(
            conn,
            ClientRequest::ConsumeMedia {
                transport_id: transport_id.clone(),
                kind,
                rtp_capabilities: full_capabilities(),
            },
        )
        .await
        .expect("consume");
    match payload {
        ResponsePayload::Consumed { id, kind: got, .. } => {
            assert_eq!(got, kind);
            id
        }
        other => panic!("unexpected consume payload: {other:?}"),
    }
}

fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope.event);
    }
    events
}


#[tokio::test]
async fn full_live_class_with_recording() {
    let stack = test_stack(ScriptedRecorder::new(vec![
        Bytes::from_static(&[1u8; 10]),
        Bytes::from_static(&[2u8; 10]),
        Bytes::from_static(&[3u8; 10]),
    ]));
    let class = ClassId::new("algebra-101");

    let (mut producer, _transport) = start_class(&stack, &class).await;

    // The first produce marked the class live.
    let info = stack.directory.class(&class).await.unwrap();
    assert_eq!(info.status, ClassStatus::Live);

    // Viewer joins, consumes video and resumes in two phases.
    let (mut viewer, _viewer_events) =
        stack
            .service
            .connect(class.clone(), Role::Viewer, Some("alice".to_string()));
    let viewer_transport = negotiate_transport(&stack, &mut viewer).await;
    let consumer_id = consume(&stack, &mut viewer, &viewer_transport, MediaKind::Video).await;

    let session = stack.registry.get(&class).unwrap();
    let consumer = session.consumer(&consumer_id).await.unwrap();
    assert!(consumer.paused(), "consumer must start paused");

    stack
        .service
        .handle(
            &mut viewer,
            ClientRequest::ResumeConsumer {
                consumer_id: consumer_id.clone(),
            },
        )
        .await
        .expect("resume");
    assert!(!consumer.paused());

    // Resuming again is safe.
    stack
        .service
        .handle(&mut viewer, ClientRequest::ResumeConsumer { consumer_id })
        .await
        .expect("second resume");

    // Roster and chat flow through the collaborators and the event hub.
    let (mut other_viewer, mut other_events) =
        stack
            .service
            .connect(class.clone(), Role::Viewer, Some("bob".to_string()));
    stack
        .service
        .handle(
            &mut viewer,
            ClientRequest::NewParticipant {
                student: "alice".to_string(),
            },
        )
        .await
        .expect("newParticipant");

    let payload = stack
        .service
        .handle(
            &mut viewer,
            ClientRequest::Message {
                content: "hello class".to_string(),
            },
        )
        .await
        .expect("message");
    assert!(matches!(payload, ResponsePayload::Message { .. }));
    assert_eq!(stack.messages.messages_for(&class).await.len(), 1);

    let payload = stack
        .service
        .handle(&mut other_viewer, ClientRequest::GetParticipants)
        .await
        .expect("roster");
    match payload {
        ResponsePayload::Participants { participants } => {
            assert_eq!(participants.len(), 1);
            assert_eq!(participants[0].student, "alice");
        }
        other => panic!("unexpected roster payload: {other:?}"),
    }

    let seen = drain_events(&mut other_events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ServerEvent::NewParticipant(p) if p.student == "alice")));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ServerEvent::MessageReceived(m) if m.content == "hello class")));

    // Record the class: three 10-byte chunks against a 16-byte part
    // threshold become part 1 (20 bytes) plus a final flushed part 2.
    stack
        .service
        .handle(&mut producer, ClientRequest::StartLiveRecord)
        .await
        .expect("startLiveRecord");
    assert!(stack.ports.leased_count() > 0);

    // Give the bridge time to resume the recording taps.
    tokio::time::sleep(Duration::from_millis(50)).await;

    stack
        .service
        .handle(&mut producer, ClientRequest::StopLiveRecord)
        .await
        .expect("stopLiveRecord");
    assert_eq!(stack.ports.leased_count(), 0);

    // The completion watcher finalizes shortly after the final flush.
    let mut record_url = None;
    for _ in 0..200 {
        record_url = stack
            .directory
            .class(&class)
            .await
            .and_then(|c| c.record_url);
        if record_url.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record_url = record_url.expect("record url never published");
    let object = stack.store.object(&record_url).expect("recorded object");
    assert_eq!(object.len(), 30);

    let upload_id = stack.store.upload_ids().remove(0);
    assert_eq!(stack.store.completed_parts(&upload_id).unwrap(), vec![1, 2]);
    assert_eq!(stack.store.finalize_count(&upload_id), 1);

    // The lecturer ends the class: viewers hear it exactly once and the
    // session is gone.
    stack
        .service
        .handle(&mut producer, ClientRequest::EndLiveClass)
        .await
        .expect("endLiveClass");

    tokio::time::sleep(Duration::from_millis(20)).await;
    let ended = drain_events(&mut other_events)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::ClassEnded))
        .count();
    assert_eq!(ended, 1);

    assert_eq!(stack.registry.session_count(), 0);
    let info = stack.directory.class(&class).await.unwrap();
    assert_eq!(info.status, ClassStatus::Finished);
    assert!(stack.presence.roster(&class).await.unwrap().is_empty());
}

#[tokio::test]
async fn record_start_needs_a_live_stream() {
    let stack = test_stack(ScriptedRecorder::new(Vec::new()));
    let class = ClassId::new("empty-class");
    stack.directory.register(class.clone()).await;

    // No session at all.
    let (mut producer, _events) = stack.service.connect(class.clone(), Role::Producer, None);
    let result = stack
        .service
        .handle(&mut producer, ClientRequest::StartLiveRecord)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    // Session exists but nothing was produced yet.
    stack
        .service
        .handle(&mut producer, ClientRequest::GetRtpCapabilities)
        .await
        .expect("capabilities");
    let result = stack
        .service
        .handle(&mut producer, ClientRequest::StartLiveRecord)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));

    // Either way, nothing was leased.
    assert_eq!(stack.ports.leased_count(), 0);
}

#[tokio::test]
async fn viewer_before_producer_is_told_class_not_started() {
    let stack = test_stack(ScriptedRecorder::new(Vec::new()));
    let class = ClassId::new("early-bird");
    stack.directory.register(class.clone()).await;

    let (mut viewer, _events) = stack.service.connect(class, Role::Viewer, None);
    let result = stack
        .service
        .handle(&mut viewer, ClientRequest::GetRtpCapabilities)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn incompatible_capabilities_are_a_conflict_not_silence() {
    let stack = test_stack(ScriptedRecorder::new(Vec::new()));
    let class = ClassId::new("codec-mismatch");

    let (_producer, _transport) = start_class(&stack, &class).await;

    let (mut viewer, _events) = stack.service.connect(class, Role::Viewer, None);
    let viewer_transport = negotiate_transport(&stack, &mut viewer).await;

    let result = stack
        .service
        .handle(
            &mut viewer,
            ClientRequest::ConsumeMedia {
                transport_id: viewer_transport,
                kind: MediaKind::Video,
                rtp_capabilities: audio_only_capabilities(),
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn producer_disconnect_ends_the_class_for_viewers() {
    let stack = test_stack(ScriptedRecorder::new(Vec::new()));
    let class = ClassId::new("dropped-lecturer");

    let (mut producer, _transport) = start_class(&stack, &class).await;

    let mut viewers = Vec::new();
    for name in ["alice", "bob"] {
        let (mut viewer, events) =
            stack
                .service
                .connect(class.clone(), Role::Viewer, Some(name.to_string()));
        let transport = negotiate_transport(&stack, &mut viewer).await;
        let consumer_id = consume(&stack, &mut viewer, &transport, MediaKind::Video).await;
        let consumer = stack
            .registry
            .get(&class)
            .unwrap()
            .consumer(&consumer_id)
            .await
            .unwrap();
        viewers.push((viewer, events, consumer));
    }

    // The lecturer's socket drops without an explicit endLiveClass.
    stack.service.disconnect(&mut producer).await;

    for (_, events, consumer) in &mut viewers {
        let ended = drain_events(events)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ClassEnded))
            .count();
        assert_eq!(ended, 1, "classEnded must be broadcast exactly once");

        // The viewer's consumer was closed by the session teardown.
        assert!(consumer.resume().await.is_err());
    }

    assert_eq!(stack.registry.session_count(), 0);
    let info = stack.directory.class(&class).await.unwrap();
    assert_eq!(info.status, ClassStatus::Finished);
}

#[tokio::test]
async fn viewer_leave_only_releases_that_viewer() {
    let stack = test_stack(ScriptedRecorder::new(Vec::new()));
    let class = ClassId::new("partial-leave");

    let (_producer, _transport) = start_class(&stack, &class).await;

    let (mut leaving, _leaving_events) =
        stack
            .service
            .connect(class.clone(), Role::Viewer, Some("alice".to_string()));
    let leaving_transport = negotiate_transport(&stack, &mut leaving).await;
    let leaving_consumer_id =
        consume(&stack, &mut leaving, &leaving_transport, MediaKind::Video).await;
    stack
        .service
        .handle(
            &mut leaving,
            ClientRequest::NewParticipant {
                student: "alice".to_string(),
            },
        )
        .await
        .expect("newParticipant");

    let (mut staying, mut staying_events) =
        stack
            .service
            .connect(class.clone(), Role::Viewer, Some("bob".to_string()));
    let staying_transport = negotiate_transport(&stack, &mut staying).await;
    let staying_consumer_id =
        consume(&stack, &mut staying, &staying_transport, MediaKind::Audio).await;

    let session = stack.registry.get(&class).unwrap();
    let leaving_consumer = session.consumer(&leaving_consumer_id).await.unwrap();

    stack
        .service
        .handle(&mut leaving, ClientRequest::LeaveClass)
        .await
        .expect("leaveClass");

    // The leaver's consumer is closed and its roster entry removed…
    assert!(leaving_consumer.resume().await.is_err());
    assert!(stack.presence.roster(&class).await.unwrap().is_empty());
    let left = drain_events(&mut staying_events)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::LeftClass(p) if p.student == "alice"))
        .count();
    assert_eq!(left, 1);

    // …while the class and the other viewer keep running.
    assert_eq!(stack.registry.session_count(), 1);
    assert!(session.consumer(&staying_consumer_id).await.is_ok());
}
