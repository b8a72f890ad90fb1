//! Session-description generation for the external recorder
//!
//! The recorder attaches to the plain-RTP taps by reading an SDP block
//! naming the leased ports and the negotiated codecs. Only the subset of
//! SDP the remux process needs is emitted.

use crate::engine::RtpParameters;
use crate::error::{MediaError, Result};
use crate::types::MediaKind;
use std::fmt::Write;

/// Codec facts extracted from a consumer's RTP parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_type: u8,
    /// Codec name without the `audio/` / `video/` prefix, e.g. `opus`
    pub codec_name: String,
    pub clock_rate: u32,
    /// Channel count; audio only
    pub channels: Option<u8>,
}

/// Extract the negotiated codec from a stream's RTP parameters.
pub fn codec_info_from_rtp_parameters(
    kind: MediaKind,
    rtp_parameters: &RtpParameters,
) -> Result<CodecInfo> {
    let codec = rtp_parameters
        .codecs
        .first()
        .ok_or_else(|| MediaError::Engine(format!("{kind} rtp parameters carry no codec")))?;

    let prefix = format!("{kind}/");
    let codec_name = codec
        .mime_type
        .strip_prefix(&prefix)
        .unwrap_or(&codec.mime_type)
        .to_string();

    Ok(CodecInfo {
        payload_type: codec.payload_type,
        codec_name,
        clock_rate: codec.clock_rate,
        channels: match kind {
            MediaKind::Audio => codec.channels,
            MediaKind::Video => None,
        },
    })
}

/// One recorded media section: the port its RTP is forwarded to plus the
/// codec the recorder must expect there.
#[derive(Debug, Clone)]
pub struct SdpTrack {
    pub rtp_port: u16,
    pub codec: CodecInfo,
}

/// Build the SDP text handed to the recorder process.
///
/// Both sections are marked `sendonly`: the recorder only receives.
#[must_use]
pub fn build_session_description(
    announced_ip: &str,
    video: Option<&SdpTrack>,
    audio: Option<&SdpTrack>,
) -> String {
    let mut sdp = String::new();
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN IP4 {announced_ip}");
    let _ = writeln!(sdp, "s=classcast");
    let _ = writeln!(sdp, "c=IN IP4 {announced_ip}");
    let _ = writeln!(sdp, "t=0 0");

    if let Some(track) = video {
        let codec = &track.codec;
        let _ = writeln!(sdp, "m=video {} RTP/AVP {}", track.rtp_port, codec.payload_type);
        let _ = writeln!(
            sdp,
            "a=rtpmap:{} {}/{}",
            codec.payload_type, codec.codec_name, codec.clock_rate
        );
        let _ = writeln!(sdp, "a=sendonly");
    }

    if let Some(track) = audio {
        let codec = &track.codec;
        let _ = writeln!(sdp, "m=audio {} RTP/AVP {}", track.rtp_port, codec.payload_type);
        match codec.channels {
            Some(channels) => {
                let _ = writeln!(
                    sdp,
                    "a=rtpmap:{} {}/{}/{}",
                    codec.payload_type, codec.codec_name, codec.clock_rate, channels
                );
            }
            None => {
                let _ = writeln!(
                    sdp,
                    "a=rtpmap:{} {}/{}",
                    codec.payload_type, codec.codec_name, codec.clock_rate
                );
            }
        }
        let _ = writeln!(sdp, "a=sendonly");
    }

    sdp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RtpCodecParameters;

    fn video_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 97,
                clock_rate: 90000,
                channels: None,
            }],
        }
    }

    fn audio_parameters() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 96,
                clock_rate: 48000,
                channels: Some(2),
            }],
        }
    }

    #[test]
    fn extracts_codec_info() {
        let info = codec_info_from_rtp_parameters(MediaKind::Video, &video_parameters()).unwrap();
        assert_eq!(info.codec_name, "VP8");
        assert_eq!(info.payload_type, 97);
        assert_eq!(info.clock_rate, 90000);
        assert_eq!(info.channels, None);

        let info = codec_info_from_rtp_parameters(MediaKind::Audio, &audio_parameters()).unwrap();
        assert_eq!(info.codec_name, "opus");
        assert_eq!(info.channels, Some(2));
    }

    #[test]
    fn empty_parameters_are_rejected() {
        let result = codec_info_from_rtp_parameters(MediaKind::Audio, &RtpParameters::default());
        assert!(result.is_err());
    }

    #[test]
    fn sdp_names_both_ports_and_codecs() {
        let video =
            codec_info_from_rtp_parameters(MediaKind::Video, &video_parameters()).unwrap();
        let audio =
            codec_info_from_rtp_parameters(MediaKind::Audio, &audio_parameters()).unwrap();

        let sdp = build_session_description(
            "203.0.113.7",
            Some(&SdpTrack {
                rtp_port: 20444,
                codec: video,
            }),
            Some(&SdpTrack {
                rtp_port: 20446,
                codec: audio,
            }),
        );

        assert!(sdp.contains("c=IN IP4 203.0.113.7"));
        assert!(sdp.contains("m=video 20444 RTP/AVP 97"));
        assert!(sdp.contains("a=rtpmap:97 VP8/90000"));
        assert!(sdp.contains("m=audio 20446 RTP/AVP 96"));
        assert!(sdp.contains("a=rtpmap:96 opus/48000/2"));
        assert_eq!(sdp.matches("a=sendonly").count(), 2);
    }
}
