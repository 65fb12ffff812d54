use thiserror::Error;

use websocketd_core::DomainError;
use websocketd_protocol::{CloseReason, ProtocolError, VersionError};

use crate::auth::AuthError;
use crate::bus::BusError;

/// Longest reason a close frame can carry.
const MAX_CLOSE_REASON: usize = 123;

/// Reasons a session ends.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No token received")]
    NoToken,

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] DomainError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthError),

    #[error("Token is not attached to a tenant")]
    NoTenant,

    #[error("Token expired or revoked")]
    AuthenticationExpired,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    UnsupportedVersion(#[from] VersionError),

    #[error("Bus connection lost")]
    BusConnectionLost,

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Server shutting down")]
    Shutdown,

    #[error("Client disconnected")]
    Disconnected,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SessionError {
    /// Close frame to send, `None` when the peer is already gone.
    pub fn close_reason(&self) -> Option<CloseReason> {
        let code = match self {
            Self::NoToken => CloseReason::NO_TOKEN,
            Self::InvalidToken(_) => CloseReason::INVALID_TOKEN,
            Self::AuthenticationFailed(_) | Self::NoTenant => CloseReason::AUTH_FAILED,
            Self::AuthenticationExpired => CloseReason::AUTH_EXPIRED,
            Self::Protocol(_) => CloseReason::PROTOCOL_ERROR,
            Self::UnsupportedVersion(_) => CloseReason::UNSUPPORTED_VERSION,
            Self::BusConnectionLost | Self::Bus(_) => CloseReason::INTERNAL_ERROR,
            Self::Shutdown => CloseReason::GOING_AWAY,
            Self::Disconnected | Self::WebSocket(_) => return None,
        };
        Some(CloseReason::new(code, truncate(self.to_string(), MAX_CLOSE_REASON)))
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
