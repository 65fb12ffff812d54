//! Encoder and decoder for session frames.
//!
//! These two types are the only place where the JSON vocabulary is spelled
//! out; the session layer deals in `ClientRequest` and `ServerMessage`.

use serde_json::Value;
use thiserror::Error;

use crate::message::{ClientRequest, ServerMessage, ServerOp};
use crate::version::ProtocolVersion;

/// Maximum accepted client frame size (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Errors raised while decoding client frames or encoding events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Missing or invalid field {field:?} for op {op:?}")]
    MissingField { op: String, field: &'static str },

    #[error("Unknown op: {0:?}")]
    UnknownOp(String),

    #[error("Binary frames are not supported")]
    BinaryFrame,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl ProtocolError {
    /// Returns true if the error concerns an event rather than framing.
    pub fn is_invalid_event(&self) -> bool {
        matches!(self, Self::InvalidEvent(_))
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Decodes client text frames into requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionProtocolDecoder;

impl SessionProtocolDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decodes one text frame.
    pub fn decode(&self, text: &str) -> Result<ClientRequest, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        let op = object
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                op: String::new(),
                field: "op",
            })?;
        let data = object.get("data");

        match op {
            "token" => {
                let token = data_str(data, "token").ok_or_else(|| ProtocolError::MissingField {
                    op: op.to_string(),
                    field: "data.token",
                })?;
                Ok(ClientRequest::Token {
                    token: token.to_string(),
                })
            }
            "subscribe" => {
                let event_name = data_str(data, "event_name")
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        ProtocolError::InvalidEvent("subscribe requires data.event_name".to_string())
                    })?;
                Ok(ClientRequest::Subscribe {
                    event_name: event_name.to_string(),
                })
            }
            "start" => Ok(ClientRequest::Start),
            "ping" => {
                let payload = data
                    .and_then(|d| d.get("payload"))
                    .cloned()
                    .ok_or_else(|| ProtocolError::MissingField {
                        op: op.to_string(),
                        field: "data.payload",
                    })?;
                Ok(ClientRequest::Ping { payload })
            }
            other => Err(ProtocolError::UnknownOp(other.to_string())),
        }
    }
}

fn data_str<'a>(data: Option<&'a Value>, key: &str) -> Option<&'a str> {
    data.and_then(|d| d.get(key)).and_then(Value::as_str)
}

// ============================================================================
// Encoder
// ============================================================================

/// Encodes gateway frames for one protocol version.
#[derive(Debug, Clone, Copy)]
pub struct SessionProtocolEncoder {
    version: ProtocolVersion,
}

impl SessionProtocolEncoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Encodes the frame announcing a ready session.
    pub fn encode_init(&self) -> Result<String, ProtocolError> {
        encode(&ServerMessage::ok(ServerOp::Init))
    }

    /// Encodes a successful reply to `op`.
    pub fn encode_reply(&self, op: ServerOp) -> Result<String, ProtocolError> {
        encode(&ServerMessage::ok(op))
    }

    /// Encodes a refused reply to `op`.
    pub fn encode_refusal(&self, op: ServerOp, code: u16, msg: &str) -> Result<String, ProtocolError> {
        encode(&ServerMessage::refused(op, code, msg))
    }

    /// Encodes the reply to a ping.
    pub fn encode_pong(&self, payload: Value) -> Result<String, ProtocolError> {
        encode(&ServerMessage::pong(payload))
    }

    /// Encodes a bus event body.
    ///
    /// The body must be a JSON object with a string `name`. Version 1
    /// clients receive the body as-is, version 2 clients an `event` frame.
    pub fn encode_event(&self, body: &Value) -> Result<String, ProtocolError> {
        validate_event(body)?;

        if self.version.wraps_events() {
            encode(&ServerMessage::event(body.clone()))
        } else {
            serde_json::to_string(body).map_err(|e| ProtocolError::Serialization(e.to_string()))
        }
    }
}

/// Checks that a bus body looks like an event.
pub fn validate_event(body: &Value) -> Result<&str, ProtocolError> {
    body.as_object()
        .ok_or_else(|| ProtocolError::InvalidEvent("event body is not an object".to_string()))?
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidEvent("event has no name".to_string()))
}

fn encode(msg: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
