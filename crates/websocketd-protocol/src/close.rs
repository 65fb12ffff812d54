//! WebSocket close codes sent by the gateway.
//!
//! Application codes live in the 4000-4999 private range; bus failures and
//! shutdown use the standard 1011 and 1001.

use std::fmt;

/// Close code and reason sent in the final close frame of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// No token in the handshake nor in time as a `token` message.
    pub const NO_TOKEN: u16 = 4001;
    /// The auth service refused the token or could not be reached.
    pub const AUTH_FAILED: u16 = 4002;
    /// The token expired or was revoked during the session.
    pub const AUTH_EXPIRED: u16 = 4003;
    /// Malformed client frame.
    pub const PROTOCOL_ERROR: u16 = 4004;
    /// Requested protocol version is not spoken by this server.
    pub const UNSUPPORTED_VERSION: u16 = 4005;
    /// Token identifier is not well formed.
    pub const INVALID_TOKEN: u16 = 4006;
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 1001;
    /// Bus connection lost or internal failure.
    pub const INTERNAL_ERROR: u16 = 1011;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Returns true for gateway-specific codes.
    pub fn is_application_code(&self) -> bool {
        (4000..5000).contains(&self.code)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_codes() {
        assert!(CloseReason::new(CloseReason::NO_TOKEN, "").is_application_code());
        assert!(!CloseReason::new(CloseReason::GOING_AWAY, "").is_application_code());
    }

    #[test]
    fn test_display() {
        let reason = CloseReason::new(CloseReason::AUTH_EXPIRED, "token expired");
        assert_eq!(reason.to_string(), "4003 (token expired)");
    }
}
