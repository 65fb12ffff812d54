//! Background token checks for active sessions.
//!
//! Two strategies exist:
//! - static: ask the auth service whether the token is still valid every
//!   `auth_check_static_interval` seconds
//! - dynamic: derive the delay from the token expiry, then refetch the
//!   token and keep its new expiry
//!
//! A checker only ends when the token is found invalid, the auth service
//! cannot be reached, or the session dropped its token sender. Tokens
//! refetched by the dynamic strategy are published back to the session,
//! which then filters with their ACL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use websocketd_core::Token;

use super::client::{AuthError, TokenService};
use super::WEBSOCKETD_ACL;

/// Delay before rechecking a token that is already past its expiry.
pub const EXPIRED_RECHECK_DELAY: Duration = Duration::from_secs(15);

/// Longest delay for a token expiring within [`NEAR_EXPIRY_THRESHOLD`].
pub const NEAR_EXPIRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Expiry gap under which [`NEAR_EXPIRY_MAX_DELAY`] applies.
pub const NEAR_EXPIRY_THRESHOLD: Duration = Duration::from_secs(80);

/// Longest delay between two checks.
pub const MAX_CHECK_DELAY: Duration = Duration::from_secs(75);

/// Computes when a token expiring at `expires_at` should be checked again.
pub fn calculate_next_check(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    let Some(expires_at) = expires_at else {
        return MAX_CHECK_DELAY;
    };

    // Negative gaps fail the conversion
    let Ok(gap) = (expires_at - now).to_std() else {
        return EXPIRED_RECHECK_DELAY;
    };

    if gap.is_zero() {
        EXPIRED_RECHECK_DELAY
    } else if gap < NEAR_EXPIRY_THRESHOLD {
        gap.min(NEAR_EXPIRY_MAX_DELAY)
    } else {
        MAX_CHECK_DELAY
    }
}

/// Reasons a checker stops.
#[derive(Debug, Error)]
pub enum AuthCheckError {
    /// The token is no longer accepted by the auth service
    #[error("Token expired or revoked")]
    Expired,

    /// The auth service could not answer
    #[error(transparent)]
    Auth(AuthError),
}

/// Token check strategy of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChecker {
    Static { interval: Duration },
    Dynamic,
}

impl AuthChecker {
    /// Delay before the next check of `token`.
    pub fn next_delay(&self, token: &Token, now: DateTime<Utc>) -> Duration {
        match self {
            Self::Static { interval } => *interval,
            Self::Dynamic => calculate_next_check(token.expires_at, now),
        }
    }

    /// Checks the token published on `tokens` until it becomes invalid.
    ///
    /// A new token on the channel restarts the schedule. Refetched tokens
    /// are published on `refreshed`. Returns `Ok(())` once the `tokens`
    /// sender is dropped.
    pub async fn run(
        self,
        service: Arc<dyn TokenService>,
        mut tokens: watch::Receiver<Token>,
        refreshed: watch::Sender<Token>,
    ) -> Result<(), AuthCheckError> {
        let mut current = tokens.borrow_and_update().clone();

        loop {
            let delay = self.next_delay(&current, Utc::now());
            debug!(token = %current.token, delay_secs = delay.as_secs_f64(), "Next token check scheduled");

            tokio::select! {
                changed = tokens.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    current = tokens.borrow_and_update().clone();
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self {
                Self::Static { .. } => {
                    let valid = service
                        .is_valid_token(&current.token, WEBSOCKETD_ACL)
                        .await
                        .map_err(AuthCheckError::Auth)?;
                    if !valid {
                        info!(token = %current.token, "Token is no longer valid");
                        return Err(AuthCheckError::Expired);
                    }
                }
                Self::Dynamic => match service.get_token(&current.token, WEBSOCKETD_ACL).await {
                    Ok(token) => {
                        current = token;
                        refreshed.send_replace(current.clone());
                    }
                    Err(e) if e.is_denied() => {
                        info!(token = %current.token, "Token is no longer valid");
                        return Err(AuthCheckError::Expired);
                    }
                    Err(e) => return Err(AuthCheckError::Auth(e)),
                },
            }
        }
    }
}
