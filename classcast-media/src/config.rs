//! Media layer configuration

use crate::engine::{RtcpFeedback, RtpCodecCapability};
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local address transports bind to
    pub listen_ip: String,
    /// Address announced to clients and written into recorder SDP
    pub announced_ip: String,
    /// Lower bound of the recording RTP port range (inclusive)
    pub min_port: u16,
    /// Upper bound of the recording RTP port range (inclusive)
    pub max_port: u16,
    /// RTP/RTCP port muxing on plain transports; when false every
    /// recording tap leases a second port for RTCP
    pub rtcp_mux: bool,
    /// Let the plain transport learn the remote endpoint from the first
    /// received packet instead of an explicit connect
    pub comedia: bool,
    /// Cap on per-transport inbound bitrate, in bps (0 = engine default)
    pub max_incoming_bitrate: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: 20000,
            max_port: 30000,
            rtcp_mux: true,
            comedia: false,
            max_incoming_bitrate: 1_500_000,
        }
    }
}

/// Default router codec set: Opus for audio, VP8/VP9/H264 for video.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: Some(96),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![
                RtcpFeedback {
                    kind: "nack".to_string(),
                    parameter: None,
                },
                RtcpFeedback {
                    kind: "nack".to_string(),
                    parameter: Some("pli".to_string()),
                },
            ],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(97),
            parameters: [(
                "x-google-start-bitrate".to_string(),
                serde_json::json!(1000),
            )]
            .into_iter()
            .collect(),
            rtcp_feedback: vec![
                RtcpFeedback {
                    kind: "nack".to_string(),
                    parameter: None,
                },
                RtcpFeedback {
                    kind: "ccm".to_string(),
                    parameter: Some("fir".to_string()),
                },
                RtcpFeedback {
                    kind: "goog-remb".to_string(),
                    parameter: None,
                },
            ],
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(98),
            parameters: [
                ("profile-id".to_string(), serde_json::json!(2)),
                (
                    "x-google-start-bitrate".to_string(),
                    serde_json::json!(1000),
                ),
            ]
            .into_iter()
            .collect(),
            rtcp_feedback: Vec::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(99),
            parameters: [
                ("packetization-mode".to_string(), serde_json::json!(1)),
                ("profile-level-id".to_string(), serde_json::json!("42e01f")),
                ("level-asymmetry-allowed".to_string(), serde_json::json!(1)),
                (
                    "x-google-start-bitrate".to_string(),
                    serde_json::json!(1000),
                ),
            ]
            .into_iter()
            .collect(),
            rtcp_feedback: Vec::new(),
        },
    ]
}
