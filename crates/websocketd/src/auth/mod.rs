//! Authentication against the auth service.
//!
//! - `client` - the `TokenService` seam and its HTTP implementation
//! - `checker` - per-session background token checks
//! - `renewer` - the gateway's own service token
//!
//! `Authenticator` is what sessions use: it pins the connection ACL and the
//! configured check strategy.

pub mod checker;
pub mod client;
pub mod renewer;

pub use checker::{calculate_next_check, AuthCheckError, AuthChecker};
pub use client::{AuthError, HttpAuthClient, TokenService};
pub use renewer::ServiceTokenRenewer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use websocketd_core::{Token, TokenId};

use crate::config::AuthCheckStrategy;

/// ACL a token needs to open a gateway session.
pub const WEBSOCKETD_ACL: &str = "websocketd";

/// Session-facing authentication handle.
///
/// Cheap to clone; all clones share the same token service.
#[derive(Clone)]
pub struct Authenticator {
    service: Arc<dyn TokenService>,
    checker: AuthChecker,
}

impl Authenticator {
    pub fn new(service: Arc<dyn TokenService>, strategy: AuthCheckStrategy, static_interval: Duration) -> Self {
        let checker = match strategy {
            AuthCheckStrategy::Static => AuthChecker::Static {
                interval: static_interval,
            },
            AuthCheckStrategy::Dynamic => AuthChecker::Dynamic,
        };
        Self { service, checker }
    }

    /// Fetches `token`, requiring the connection ACL.
    ///
    /// Denials and transport failures are both errors.
    pub async fn get_token(&self, token: &TokenId) -> Result<Token, AuthError> {
        self.service.get_token(token, WEBSOCKETD_ACL).await
    }

    /// Returns whether `token` currently grants `acl`.
    pub async fn is_valid_token(&self, token: &TokenId, acl: &str) -> Result<bool, AuthError> {
        self.service.is_valid_token(token, acl).await
    }

    /// Returns the configured check strategy.
    pub fn checker(&self) -> AuthChecker {
        self.checker
    }

    /// Starts the background check of the token published on `tokens`.
    ///
    /// Refetched tokens come back on `refreshed`.
    pub fn spawn_checker(
        &self,
        tokens: watch::Receiver<Token>,
        refreshed: watch::Sender<Token>,
    ) -> JoinHandle<Result<(), AuthCheckError>> {
        tokio::spawn(self.checker.run(Arc::clone(&self.service), tokens, refreshed))
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("checker", &self.checker)
            .finish_non_exhaustive()
    }
}
