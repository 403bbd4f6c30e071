//! Signaling wire messages.
//!
//! Every frame is one JSON object tagged by a `type` field. Session
//! descriptions and ICE candidates are opaque: they are carried as arbitrary
//! JSON values and relayed unchanged.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The frame is JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,
    /// The object has no `type` field.
    #[error("message has no `type` field")]
    MissingType,
    /// A known message type lacks a field it requires.
    #[error("`{kind}` message is missing required field `{field}`")]
    MissingField {
        /// Message type.
        kind: &'static str,
        /// Missing field name.
        field: &'static str,
    },
    /// A binary frame arrived where only text is accepted.
    #[error("binary frames are not accepted")]
    Binary,
}

/// A message sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// Session description offer.
    Offer {
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Session description answer.
    Answer {
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Network candidate.
    IceCandidate {
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Application-level liveness probe.
    Ping,
    /// A well-formed message whose type the relay does not handle. A
    /// non-string `type` is kept in its JSON rendering.
    Unknown(String),
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let Value::Object(mut obj) = serde_json::from_str::<Value>(text)? else {
            return Err(ProtocolError::NotAnObject);
        };
        let kind = match obj.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(other) => return Ok(Self::Unknown(other.to_string())),
            None => return Err(ProtocolError::MissingType),
        };

        match kind.as_str() {
            "offer" => Ok(Self::Offer {
                sdp: required(&mut obj, "offer", "sdp")?,
            }),
            "answer" => Ok(Self::Answer {
                sdp: required(&mut obj, "answer", "sdp")?,
            }),
            "ice-candidate" => Ok(Self::IceCandidate {
                candidate: required(&mut obj, "ice-candidate", "candidate")?,
            }),
            "ping" => Ok(Self::Ping),
            _ => Ok(Self::Unknown(kind)),
        }
    }

    /// Bounded metric label; every unrecognized type shares `"unknown"`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Ping => "ping",
            Self::Unknown(_) => "unknown",
        }
    }

    /// The message to fan out to the sender's room, if this one is relayed.
    pub fn into_relay(self, from: &str) -> Option<ServerMessage> {
        let from = from.to_owned();
        match self {
            Self::Offer { sdp } => Some(ServerMessage::Offer { from, sdp }),
            Self::Answer { sdp } => Some(ServerMessage::Answer { from, sdp }),
            Self::IceCandidate { candidate } => {
                Some(ServerMessage::IceCandidate { from, candidate })
            }
            Self::Ping | Self::Unknown(_) => None,
        }
    }
}

fn required(
    obj: &mut Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<Value, ProtocolError> {
    obj.remove(field)
        .ok_or(ProtocolError::MissingField { kind, field })
}

/// A message sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Another peer joined the room.
    PeerJoined {
        /// The joining peer.
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Relayed offer.
    Offer {
        /// Sending peer.
        from: String,
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Relayed answer.
    Answer {
        /// Sending peer.
        from: String,
        /// Opaque SDP payload.
        sdp: Value,
    },
    /// Relayed ICE candidate.
    IceCandidate {
        /// Sending peer.
        from: String,
        /// Opaque candidate payload.
        candidate: Value,
    },
    /// Reply to an application-level `ping`.
    Pong,
}

impl ServerMessage {
    /// The `type` tag written on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeerJoined { .. } => "peer-joined",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Pong => "pong",
        }
    }

    /// Serialize once for sharing across recipients.
    pub fn to_frame(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}
