//! classcast media layer
//!
//! This crate defines the contract between classcast and its external media
//! engine (an SFU that negotiates codecs and relays streams between
//! transports), plus the small media-adjacent utilities the rest of the
//! backend needs:
//!
//! - **`engine`**: object-safe async traits for routers, transports,
//!   producers and consumers, with plain serde parameter types
//! - **`loopback`**: an in-process engine implementation used by the test
//!   suite and for single-node development
//! - **`ports`**: UDP port leasing for plain-RTP recording endpoints
//! - **`sdp`**: session-description text generation for the external
//!   recorder process
//!
//! The engine traits intentionally cover only what the signaling and
//! recording paths orchestrate. Codec internals, ICE/NAT traversal and the
//! byte-level transport protocol live entirely behind the engine.

mod config;
mod engine;
mod error;
mod loopback;
mod ports;
mod sdp;
mod types;

pub use config::{default_media_codecs, MediaConfig};
pub use engine::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaConsumer,
    MediaEngine, MediaProducer, MediaRouter, MediaTransport, PlainConnectOptions, PlainTransport,
    PlainTransportOptions, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpParameters, TransportConnectInfo, WebRtcTransport, WebRtcTransportOptions,
};
pub use error::MediaError;
pub use loopback::LoopbackEngine;
pub use ports::PortAllocator;
pub use sdp::{build_session_description, codec_info_from_rtp_parameters, CodecInfo, SdpTrack};
pub use types::{ClassId, ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
