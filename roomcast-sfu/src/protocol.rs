//! Wire protocol
//!
//! Every frame is a JSON envelope `{"action": "...", "data": {...}}`.
//! Inbound frames are decoded into [`ClientMessage`]; outbound messages are
//! [`ServerMessage`] values serialized into the same envelope shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::error::SfuError;
use crate::params::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParameters};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};

/// Raw inbound envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumer {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducer {
    pub producer_id: ProducerId,
}

/// Messages a client can send
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CreateProducerTransport,
    ConnectProducerTransport(ConnectTransport),
    Produce(Produce),
    CreateConsumerTransport,
    ConnectConsumerTransport(ConnectTransport),
    Consume(Consume),
    ResumeConsumer(ResumeConsumer),
    CloseProducer(CloseProducer),
    /// Any action this server does not implement
    Unknown { action: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    /// Not JSON, or no `action` field. Dropped without a reply.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Known action whose `data` does not decode. Answered with an error message.
    #[error("invalid data for '{action}': {source}")]
    InvalidData {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

fn data<T: DeserializeOwned>(action: &str, data: Value) -> Result<T, ParseError> {
    serde_json::from_value(data).map_err(|source| ParseError::InvalidData {
        action: action.to_string(),
        source,
    })
}

impl ClientMessage {
    /// Decode one text frame
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let Envelope { action, data: payload } =
            serde_json::from_str(text).map_err(ParseError::Malformed)?;

        let message = match action.as_str() {
            "createProducerTransport" => Self::CreateProducerTransport,
            "connectProducerTransport" => Self::ConnectProducerTransport(data(&action, payload)?),
            "produce" => Self::Produce(data(&action, payload)?),
            "createConsumerTransport" => Self::CreateConsumerTransport,
            "connectConsumerTransport" => Self::ConnectConsumerTransport(data(&action, payload)?),
            "consume" => Self::Consume(data(&action, payload)?),
            "resumeConsumer" => Self::ResumeConsumer(data(&action, payload)?),
            "closeProducer" => Self::CloseProducer(data(&action, payload)?),
            _ => Self::Unknown { action },
        };
        Ok(message)
    }

    /// Wire name of the action
    #[must_use]
    pub fn action(&self) -> &str {
        match self {
            Self::CreateProducerTransport => "createProducerTransport",
            Self::ConnectProducerTransport(_) => "connectProducerTransport",
            Self::Produce(_) => "produce",
            Self::CreateConsumerTransport => "createConsumerTransport",
            Self::ConnectConsumerTransport(_) => "connectConsumerTransport",
            Self::Consume(_) => "consume",
            Self::ResumeConsumer(_) => "resumeConsumer",
            Self::CloseProducer(_) => "closeProducer",
            Self::Unknown { action } => action,
        }
    }
}

/// Public description of an active producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

/// Why a consume request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumeFailure {
    #[serde(rename = "producer not found")]
    ProducerNotFound,
    #[serde(rename = "cannot consume")]
    CannotConsume,
    #[serde(rename = "consumer transport not found")]
    TransportNotFound,
}

impl ConsumeFailure {
    /// The refusal a failed consume is reported as, or None for faults that
    /// are not a refusal
    #[must_use]
    pub fn from_error(err: &SfuError) -> Option<Self> {
        match err {
            SfuError::NotFound { entity: "producer", .. } => Some(Self::ProducerNotFound),
            SfuError::NotFound {
                entity: "consumer transport",
                ..
            } => Some(Self::TransportNotFound),
            SfuError::Incompatible(_) => Some(Self::CannotConsume),
            _ => None,
        }
    }
}

impl fmt::Display for ConsumeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProducerNotFound => "producer not found",
            Self::CannotConsume => "cannot consume",
            Self::TransportNotFound => "consumer transport not found",
        })
    }
}

/// Messages the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Welcome message sent once on connect
    RouterRtpCapabilities {
        peer_id: PeerId,
        router_rtp_capabilities: RtpCapabilities,
        existing_producers: Vec<ProducerInfo>,
    },
    ProducerTransportCreated {
        id: TransportId,
        #[serde(flatten)]
        parameters: TransportParameters,
    },
    ConsumerTransportCreated {
        id: TransportId,
        #[serde(flatten)]
        parameters: TransportParameters,
    },
    ProducerCreated {
        id: ProducerId,
    },
    NewProducer(ProducerInfo),
    ConsumerCreated {
        producer_id: ProducerId,
        id: ConsumerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        producer_peer_id: PeerId,
    },
    ConsumeFailed {
        producer_id: ProducerId,
        reason: ConsumeFailure,
    },
    ProducerClosed(ProducerInfo),
    PeerDeparted {
        peer_id: PeerId,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl fmt::Display) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    /// Wire name of the action
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::RouterRtpCapabilities { .. } => "routerRtpCapabilities",
            Self::ProducerTransportCreated { .. } => "producerTransportCreated",
            Self::ConsumerTransportCreated { .. } => "consumerTransportCreated",
            Self::ProducerCreated { .. } => "producerCreated",
            Self::NewProducer(_) => "newProducer",
            Self::ConsumerCreated { .. } => "consumerCreated",
            Self::ConsumeFailed { .. } => "consumeFailed",
            Self::ProducerClosed(_) => "producerClosed",
            Self::PeerDeparted { .. } => "peerDeparted",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize into a text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
