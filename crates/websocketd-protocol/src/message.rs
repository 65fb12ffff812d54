//! Protocol message types for gateway communication.

use serde::{Deserialize, Serialize};

/// Requests sent by clients to the gateway.
///
/// Serialized as `{"op": "<op>", "data": {...}}`; `start` carries no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Authenticate, or replace the token of an authenticated session
    Token {
        /// Token identifier issued by the auth service
        token: String,
    },

    /// Receive bus events with this name (`*` for every event)
    Subscribe {
        /// Bus event name
        event_name: String,
    },

    /// Start event delivery (protocol version 2)
    Start,

    /// Application-level keepalive
    Ping {
        /// Opaque payload echoed back in the `pong`
        payload: serde_json::Value,
    },
}

impl ClientRequest {
    /// Creates a token message.
    pub fn token(token: impl Into<String>) -> Self {
        Self::Token {
            token: token.into(),
        }
    }

    /// Creates a subscribe message.
    pub fn subscribe(event_name: impl Into<String>) -> Self {
        Self::Subscribe {
            event_name: event_name.into(),
        }
    }

    /// Creates a start message.
    pub fn start() -> Self {
        Self::Start
    }

    /// Creates a ping message.
    pub fn ping(payload: impl Into<serde_json::Value>) -> Self {
        Self::Ping {
            payload: payload.into(),
        }
    }

    /// Returns the op name of this request.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Subscribe { .. } => "subscribe",
            Self::Start => "start",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Op carried by frames sent from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerOp {
    /// Session authenticated, client may subscribe
    Init,
    /// Reply to `subscribe`
    Subscribe,
    /// Reply to `start`
    Start,
    /// Reply to `token`
    Token,
    /// Reply to `ping`
    Pong,
    /// Bus event delivery
    Event,
}

/// Frame sent from the gateway to a client (protocol version 2 shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// What this frame is
    pub op: ServerOp,

    /// 0 on success, non-zero when the request was refused
    pub code: u16,

    /// Human-readable detail, empty on success
    pub msg: String,

    /// Payload (`event` body, `pong` payload)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ServerMessage {
    /// Success code.
    pub const CODE_OK: u16 = 0;

    /// Refusal code for subscriptions the token may not receive.
    pub const CODE_FORBIDDEN: u16 = 403;

    /// Creates a successful frame without payload.
    pub fn ok(op: ServerOp) -> Self {
        Self {
            op,
            code: Self::CODE_OK,
            msg: String::new(),
            data: None,
        }
    }

    /// Creates a refused frame.
    pub fn refused(op: ServerOp, code: u16, msg: impl Into<String>) -> Self {
        Self {
            op,
            code,
            msg: msg.into(),
            data: None,
        }
    }

    /// Creates a pong frame echoing `payload`.
    pub fn pong(payload: serde_json::Value) -> Self {
        Self {
            data: Some(serde_json::json!({ "payload": payload })),
            ..Self::ok(ServerOp::Pong)
        }
    }

    /// Creates an event frame carrying a bus event body.
    pub fn event(body: serde_json::Value) -> Self {
        Self {
            data: Some(body),
            ..Self::ok(ServerOp::Event)
        }
    }

    /// Returns true if the frame reports success.
    pub fn is_ok(&self) -> bool {
        self.code == Self::CODE_OK
    }
}
