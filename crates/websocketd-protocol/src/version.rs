//! Protocol versioning.
//!
//! Clients choose the version with the `version` query parameter of the
//! WebSocket URL (`/?version=2`). Without it, version 1 is assumed.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version spoken on one connection.
///
/// - Version 1: bus events are written as the raw event body and flow as
///   soon as the first subscription exists.
/// - Version 2: bus events are wrapped in an `event` frame, the server
///   announces itself with `init` and events flow only after `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    pub const V1: ProtocolVersion = ProtocolVersion(1);
    pub const V2: ProtocolVersion = ProtocolVersion(2);

    /// Version used when the client does not ask for one.
    pub const DEFAULT: ProtocolVersion = Self::V1;

    /// Every version this server speaks.
    pub const SUPPORTED: [ProtocolVersion; 2] = [Self::V1, Self::V2];

    /// Parses the `version` query parameter value.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let number = s
            .trim()
            .parse::<u8>()
            .map_err(|_| VersionError::InvalidFormat(s.to_string()))?;

        let version = ProtocolVersion(number);
        if Self::SUPPORTED.contains(&version) {
            Ok(version)
        } else {
            Err(VersionError::Unsupported(version))
        }
    }

    /// Parses an optional query parameter, falling back to [`Self::DEFAULT`].
    pub fn from_query(value: Option<&str>) -> Result<Self, VersionError> {
        value.map_or(Ok(Self::DEFAULT), Self::parse)
    }

    /// Returns true if bus events are wrapped in `event` frames.
    pub fn wraps_events(&self) -> bool {
        *self >= Self::V2
    }

    /// Returns true if the client must send `start` before events flow.
    pub fn requires_start(&self) -> bool {
        *self >= Self::V2
    }

    pub fn number(&self) -> u8 {
        self.0
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported protocol version: {0}")]
    Unsupported(ProtocolVersion),
}
