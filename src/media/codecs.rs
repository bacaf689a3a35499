use std::collections::BTreeMap;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

use super::types::{MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters};

/// Codecs every routing context accepts from clients.
pub fn supported_codecs() -> Vec<(RTCRtpCodecParameters, RTPCodecType)> {
    // RTCP feedback mechanisms for video - critical for keyframe recovery
    let video_rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_string(),
            parameter: "".to_string(),
        },
        RTCPFeedback {
            typ: "ccm".to_string(),
            parameter: "fir".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "pli".to_string(),
        },
    ];

    vec![
        (
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        ),
        (
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: "".to_string(),
                    rtcp_feedback: video_rtcp_feedback,
                },
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        ),
    ]
}

/// Router capabilities in protocol form.
pub fn router_capabilities() -> RtpCapabilities {
    let codecs = supported_codecs()
        .into_iter()
        .filter_map(|(params, codec_type)| {
            let kind = match codec_type {
                RTPCodecType::Audio => MediaKind::Audio,
                RTPCodecType::Video => MediaKind::Video,
                _ => return None,
            };
            let capability = params.capability;
            Some(RtpCodecCapability {
                kind,
                mime_type: capability.mime_type,
                preferred_payload_type: Some(params.payload_type),
                clock_rate: capability.clock_rate,
                channels: (capability.channels > 0).then_some(capability.channels),
                parameters: parse_fmtp(&capability.sdp_fmtp_line),
                rtcp_feedback: capability
                    .rtcp_feedback
                    .into_iter()
                    .map(|fb| RtcpFeedback {
                        typ: fb.typ,
                        parameter: fb.parameter,
                    })
                    .collect(),
            })
        })
        .collect();

    RtpCapabilities { codecs }
}

/// Parses an SDP fmtp line ("minptime=10;useinbandfec=1") into typed parameters.
pub fn parse_fmtp(line: &str) -> BTreeMap<String, serde_json::Value> {
    line.split(';')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            let value = match value.parse::<u64>() {
                Ok(number) => serde_json::Value::from(number),
                Err(_) => serde_json::Value::from(value.to_string()),
            };
            Some((key.to_string(), value))
        })
        .collect()
}

/// Renders typed parameters back into an fmtp line.
pub fn format_fmtp(parameters: &BTreeMap<String, serde_json::Value>) -> String {
    parameters
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub fn kind_of_mime(mime_type: &str) -> Option<MediaKind> {
    let lower = mime_type.to_ascii_lowercase();
    if lower.starts_with("audio/") {
        Some(MediaKind::Audio)
    } else if lower.starts_with("video/") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Retransmission codecs carry no media of their own.
pub fn is_rtx(mime_type: &str) -> bool {
    mime_type.to_ascii_lowercase().ends_with("/rtx")
}

/// Same codec: mime type (case-insensitive), clock rate and audio channel count.
pub fn codec_matches(capability: &RtpCodecCapability, codec: &RtpCodecParameters) -> bool {
    if !capability.mime_type.eq_ignore_ascii_case(&codec.mime_type) {
        return false;
    }
    if capability.clock_rate != codec.clock_rate {
        return false;
    }
    match capability.kind {
        MediaKind::Audio => capability.channels.unwrap_or(1) == codec.channels.unwrap_or(1),
        MediaKind::Video => true,
    }
}

/// Finds the entry of `capabilities` able to carry `codec`.
pub fn find_matching<'a>(
    capabilities: &'a RtpCapabilities,
    codec: &RtpCodecParameters,
) -> Option<&'a RtpCodecCapability> {
    capabilities
        .codecs
        .iter()
        .find(|capability| codec_matches(capability, codec))
}
