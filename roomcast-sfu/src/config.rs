//! SFU Configuration

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::params::RtpCodecCapability;
use crate::types::MediaKind;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Codecs the router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Options applied to every WebRTC transport the router creates
    pub webrtc_transport: WebRtcTransportConfig,
    /// Maximum number of simultaneously connected peers (0 = unlimited)
    pub max_peers: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
            webrtc_transport: WebRtcTransportConfig::default(),
            max_peers: 0,
        }
    }
}

impl SfuConfig {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must contain at least one codec".to_string());
        }
        for codec in &self.media_codecs {
            let prefix = format!("{}/", codec.kind);
            if !codec.mime_type.to_ascii_lowercase().starts_with(&prefix) {
                errors.push(format!(
                    "sfu.media_codecs: mime type '{}' does not match kind '{}'",
                    codec.mime_type, codec.kind
                ));
            }
            if codec.clock_rate == 0 {
                errors.push(format!("sfu.media_codecs: '{}' has a zero clock rate", codec.mime_type));
            }
        }
        if self.webrtc_transport.listen_ips.is_empty() {
            errors.push("sfu.webrtc_transport.listen_ips must not be empty".to_string());
        }
        if !self.webrtc_transport.enable_udp && !self.webrtc_transport.enable_tcp {
            errors.push("sfu.webrtc_transport: at least one of enable_udp / enable_tcp must be set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// WebRTC transport options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// First port handed out to transports
    pub rtc_min_port: u16,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("127.0.0.1".to_string()),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            rtc_min_port: 40000,
        }
    }
}

/// Local address a transport listens on, and the address advertised to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenIp {
    pub ip: String,
    #[serde(default)]
    pub announced_ip: Option<String>,
}

impl ListenIp {
    /// Address placed in ICE candidates
    #[must_use]
    pub fn advertised(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.ip)
    }
}

fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            preferred_payload_type: None,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
            preferred_payload_type: None,
        },
    ]
}
