//! Signaling wire types
//!
//! Requests arrive as JSON envelopes carrying a correlation id; every
//! request is answered with exactly one response envelope echoing that id
//! and holding either a typed payload or a structured error. Server-pushed
//! events use a separate envelope and never carry a correlation id.

use crate::error::Error;
use crate::external::messages::ChatMessage;
use crate::external::presence::Participant;
use classcast_media::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportConnectInfo, TransportId,
};
use serde::{Deserialize, Serialize};

/// Role a connection declared at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The lecturer's client: negotiates against the producer router.
    Producer,
    /// A viewer: negotiates against the consumer router.
    Viewer,
}

/// A client request with its correlation id.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// Requests understood by the signaling handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    GetRtpCapabilities,
    CreateTransport,
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    ConsumeMedia {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    NewParticipant {
        student: String,
    },
    Message {
        content: String,
    },
    GetParticipants,
    StartLiveRecord,
    StopLiveRecord,
    EndLiveClass,
    LeaveClass,
}

/// Success payloads, one shape per request.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    #[serde(rename_all = "camelCase")]
    RtpCapabilities { rtp_capabilities: RtpCapabilities },
    TransportCreated(TransportConnectInfo),
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    Consumed {
        id: ConsumerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_id: ProducerId,
    },
    Participants { participants: Vec<Participant> },
    Message { message: ChatMessage },
    // Must stay last: untagged deserialization would otherwise swallow
    // richer payloads (serialization is unaffected).
    Ack {},
}

impl ResponsePayload {
    #[must_use]
    pub const fn ack() -> Self {
        Self::Ack {}
    }
}

/// Structured error body, `{"error":{"message":"..."}}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

/// Response to one request, correlated by id.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponsePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn from_result(id: u64, result: crate::error::Result<ResponsePayload>) -> Self {
        match result {
            Ok(payload) => Self {
                id,
                data: Some(payload),
                error: None,
            },
            Err(err) => Self {
                id,
                data: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }
}

/// Server-pushed events broadcast to a class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewParticipant(Participant),
    LeftClass(Participant),
    ClassEnded,
    MessageReceived(ChatMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use classcast_media::ClassId;

    #[test]
    fn requests_parse_from_tagged_json() {
        let raw = r#"{"id":3,"type":"consumeMedia","data":{"transportId":"t1","kind":"video","rtpCapabilities":{"codecs":[]}}}"#;
        let envelope: RequestEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, 3);
        assert!(matches!(
            envelope.request,
            ClientRequest::ConsumeMedia { ref transport_id, kind: MediaKind::Video, .. }
                if transport_id.as_str() == "t1"
        ));

        let raw = r#"{"id":1,"type":"getRtpCapabilities"}"#;
        let envelope: RequestEnvelope = serde_json::from_str(raw).unwrap();
        assert!(matches!(envelope.request, ClientRequest::GetRtpCapabilities));
    }

    #[test]
    fn error_responses_nest_the_message() {
        let envelope = ResponseEnvelope::from_result(
            9,
            Err(Error::NotFound("class class-a".to_string())),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["id"], 9);
        assert!(json.get("data").is_none());
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("class-a"));
    }

    #[test]
    fn ack_serializes_as_empty_object() {
        let envelope = ResponseEnvelope::from_result(1, Ok(ResponsePayload::ack()));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["data"], serde_json::json!({}));
    }

    #[test]
    fn events_carry_their_tag() {
        let event = ServerEvent::NewParticipant(Participant {
            id: "p1".to_string(),
            class_id: ClassId::new("class-a"),
            student: "alice".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "newParticipant");
        assert_eq!(json["data"]["student"], "alice");

        let json = serde_json::to_value(&ServerEvent::ClassEnded).unwrap();
        assert_eq!(json["event"], "classEnded");
    }
}
