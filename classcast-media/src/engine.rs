//! Media engine facade
//!
//! Object-safe contracts over the external SFU engine. classcast never
//! touches media bytes itself; it drives the engine's router / transport /
//! producer / consumer lifecycle through these traits and leaves codec
//! negotiation and packet relay to the implementation behind them.
//!
//! Two transport families exist:
//!
//! - **WebRTC transports** carry ICE/DTLS negotiation state and are handed
//!   to signaling clients (the lecturer and each viewer).
//! - **Plain transports** skip interactive negotiation entirely and only
//!   forward a producer's RTP to a fixed UDP port, which is how the
//!   recording process taps a live stream.

use crate::error::Result;
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One codec entry of a router's capability set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    /// MIME type, e.g. `audio/opus` or `video/VP8`
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// RTCP feedback mechanism supported by a codec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// Capability set exchanged between routers and clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// First capability entry matching the given media kind, if any.
    #[must_use]
    pub fn codec_for(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.kind == kind)
    }
}

/// Negotiated codec of a concrete stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// Per-stream RTP parameters (produced or consumed)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
}

/// DTLS endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub protocol: String,
}

/// Everything a signaling client needs to connect a WebRTC transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectInfo {
    pub transport_id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Options for creating an interactive (ICE/DTLS) transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_incoming_bitrate: Option<u32>,
}

/// Options for creating a plain (RTP-forwarding) transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
    /// When true, RTP and RTCP share one port and no RTCP lease is needed
    pub rtcp_mux: bool,
    pub comedia: bool,
}

/// Remote endpoint a plain transport forwards RTP to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainConnectOptions {
    pub ip: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
}

/// Entry point into the media engine: a factory for routing contexts.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a routing context negotiating the given codec set.
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn MediaRouter>>;
}

/// A routing context that negotiates codecs and relays streams between the
/// transports attached to it.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> &RouterId;

    /// Capability set clients must load before producing or consuming.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn WebRtcTransport>>;

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<Arc<dyn PlainTransport>>;

    /// Whether a consumer with the offered capabilities could receive the
    /// given producer's stream. Unknown or closed producers yield `false`.
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Accept a stream piped from another router. The returned producer is
    /// local to this router and is what consumers here attach to.
    async fn pipe_producer(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>>;

    /// Close the router and everything attached to it. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Behavior common to both transport families.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Create a consumer for the given producer, optionally paused.
    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>>;

    /// Close the transport. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Interactive transport handed to signaling clients.
#[async_trait]
pub trait WebRtcTransport: MediaTransport {
    /// Connection parameters to send back on `createTransport`.
    fn connect_info(&self) -> TransportConnectInfo;

    /// Bind the remote end's DTLS parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    /// Attach a media source to this transport.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>>;
}

/// Non-interactive transport forwarding RTP to a fixed remote port.
#[async_trait]
pub trait PlainTransport: MediaTransport {
    /// Point the transport at the remote RTP (and optional RTCP) port.
    async fn connect(&self, remote: PlainConnectOptions) -> Result<()>;
}

/// The sending end of one media stream.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn closed(&self) -> bool;

    /// Close the producer. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// The receiving end of one media stream, bound to a transport and a
/// producer. Consumers are created paused; callers resume them once the
/// receiving side has signaled readiness.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn kind(&self) -> MediaKind;
    fn producer_id(&self) -> &ProducerId;
    fn rtp_parameters(&self) -> RtpParameters;
    fn paused(&self) -> bool;

    /// Unpause media flow. Safe to call more than once.
    async fn resume(&self) -> Result<()>;

    /// Force the producer to emit a keyframe so the receiver can decode
    /// from the next packet instead of waiting for a natural GOP boundary.
    async fn request_keyframe(&self) -> Result<()>;

    /// Close the consumer. Idempotent.
    async fn close(&self) -> Result<()>;
}
