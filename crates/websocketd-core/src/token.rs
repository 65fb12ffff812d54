//! Auth service tokens as seen by the gateway.
//!
//! The gateway never owns tokens: it caches what the auth service returned
//! (ACL, tenant, last-known expiry) and re-checks it periodically.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::tenant::TenantUuid;

/// Maximum accepted length of a token identifier.
pub const MAX_TOKEN_ID_LEN: usize = 512;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Opaque token identifier issued by the auth service.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    /// Validates and wraps a raw token identifier.
    ///
    /// Identifiers must be 1..=512 characters of `[A-Za-z0-9._-]`.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        if raw.is_empty() {
            return Err(DomainError::InvalidTokenId {
                reason: "empty".to_string(),
            });
        }
        if raw.len() > MAX_TOKEN_ID_LEN {
            return Err(DomainError::InvalidTokenId {
                reason: format!("longer than {MAX_TOKEN_ID_LEN} characters"),
            });
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(DomainError::InvalidTokenId {
                reason: format!("forbidden character {c:?}"),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first 8 characters, safe to put in logs.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

// Token ids are credentials: never print them in full.
impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({}…)", self.short())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.short())
    }
}

// ============================================================================
// Token
// ============================================================================

/// Metadata attached to a token by the auth service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    /// UUID of the user (or service) owning the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Tenant the token belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_uuid: Option<TenantUuid>,

    /// Token purpose ("user", "internal", "external_api", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

/// Token data as returned by the auth service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawToken")]
pub struct Token {
    /// The token identifier
    pub token: TokenId,

    /// Last-known expiry, `None` when the auth service did not report one
    pub expires_at: Option<DateTime<Utc>>,

    /// Access-control entries granted by the token
    pub acl: Vec<String>,

    /// Auth session the token belongs to
    pub session_uuid: Option<String>,

    /// Owner and tenant information
    pub metadata: TokenMetadata,
}

impl Token {
    /// Creates a token with no ACL and no metadata.
    pub fn new(token: TokenId, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token,
            expires_at,
            acl: Vec::new(),
            session_uuid: None,
            metadata: TokenMetadata::default(),
        }
    }

    /// Sets the ACL entries.
    #[must_use]
    pub fn with_acl<I, S>(mut self, acl: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acl = acl.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the owning tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantUuid) -> Self {
        self.metadata.tenant_uuid = Some(tenant);
        self
    }

    /// Sets the owning user.
    #[must_use]
    pub fn with_user(mut self, user_uuid: impl Into<String>) -> Self {
        self.metadata.uuid = Some(user_uuid.into());
        self
    }

    /// Tenant the token belongs to, if known.
    pub fn tenant(&self) -> Option<&TenantUuid> {
        self.metadata.tenant_uuid.as_ref()
    }

    /// UUID of the token owner, if known.
    pub fn user_uuid(&self) -> Option<&str> {
        self.metadata.uuid.as_deref()
    }

    /// Returns true if the token expiry is known and at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Wire shape of a token, before validation.
#[derive(Debug, Deserialize)]
struct RawToken {
    token: String,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    utc_expires_at: Option<String>,
    #[serde(default)]
    acl: Vec<String>,
    #[serde(default)]
    session_uuid: Option<String>,
    #[serde(default)]
    metadata: Option<TokenMetadata>,
}

impl TryFrom<RawToken> for Token {
    type Error = DomainError;

    fn try_from(raw: RawToken) -> Result<Self, Self::Error> {
        // utc_expires_at is authoritative; expires_at is local time on older auth servers
        let expires_at = match raw.utc_expires_at.or(raw.expires_at) {
            Some(value) => Some(parse_timestamp(&value)?),
            None => None,
        };

        Ok(Self {
            token: TokenId::parse(&raw.token)?,
            expires_at,
            acl: raw.acl,
            session_uuid: raw.session_uuid,
            metadata: raw.metadata.unwrap_or_default(),
        })
    }
}

/// Parses an auth service timestamp.
///
/// Accepts RFC 3339 (with offset) and naive ISO 8601 (assumed UTC).
pub fn parse_timestamp(value: &str) -> DomainResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DomainError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
