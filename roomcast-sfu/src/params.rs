//! Negotiation parameter shapes exchanged with clients and the media engine
//!
//! The signaling core treats these as opaque payloads and only moves them
//! between the wire and the engine. Field names follow the camelCase JSON
//! the browser-side device library produces and expects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::MediaKind;

/// A codec the router (or a receiving device) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

impl RtpCodecCapability {
    /// Whether this capability describes the given codec (MIME type, clock rate, channel count)
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
            && self.clock_rate == clock_rate
            && (self.kind == MediaKind::Video || self.channels.unwrap_or(1) == channels.unwrap_or(1))
    }
}

/// Declared capabilities of a router or a receiving device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// A codec as negotiated on a concrete RTP stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

/// RTP parameters of a sending or receiving stream
///
/// Only the codec list is interpreted; everything else (encodings, header
/// extensions, RTCP settings) is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters: the security half of transport negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything a client needs to build its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rtp_parameters_keep_unknown_fields() {
        let raw = json!({
            "mid": "0",
            "codecs": [{"mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000}],
            "encodings": [{"ssrc": 1111}],
            "rtcp": {"cname": "abc"}
        });

        let params: RtpParameters = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(params.codecs.len(), 1);
        assert!(params.extra.contains_key("encodings"));
        assert_eq!(serde_json::to_value(&params).unwrap(), raw);
    }

    #[test]
    fn test_codec_matching_ignores_mime_case() {
        let opus = RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            preferred_payload_type: None,
        };

        assert!(opus.matches("audio/OPUS", 48000, Some(2)));
        assert!(!opus.matches("audio/opus", 16000, Some(2)));
        assert!(!opus.matches("audio/opus", 48000, Some(1)));
    }

    #[test]
    fn test_ice_candidate_type_field_name() {
        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_076_302_079,
            ip: "127.0.0.1".to_string(),
            protocol: "udp".to_string(),
            port: 40000,
            candidate_type: "host".to_string(),
            tcp_type: None,
        };

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["type"], "host");
        assert!(value.get("tcpType").is_none());
    }
}
