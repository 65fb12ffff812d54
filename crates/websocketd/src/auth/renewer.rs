//! Renewal of the gateway's own service token.
//!
//! The renewer creates a token with the configured service credentials,
//! hands it to its subscribers, and creates a new one before it expires.
//! One-shot subscribers are dropped after their first delivery.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use websocketd_core::Token;

use super::client::TokenService;

/// First retry delay after a failed creation.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Longest retry delay after failed creations.
const MAX_BACKOFF: Duration = Duration::from_secs(32);

/// Shortest delay between two renewals.
const MIN_RENEW_DELAY: Duration = Duration::from_secs(1);

type Callback = Box<dyn FnMut(&Token) + Send>;

struct Subscriber {
    callback: Callback,
    oneshot: bool,
}

/// Keeps a valid service token and notifies subscribers of each new one.
pub struct ServiceTokenRenewer {
    service: Arc<dyn TokenService>,
    expiration: u64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ServiceTokenRenewer {
    /// Creates a renewer requesting tokens valid for `expiration` seconds.
    pub fn new(service: Arc<dyn TokenService>, expiration: u64) -> Self {
        Self {
            service,
            expiration,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Calls `callback` with every new token.
    pub fn subscribe(&self, callback: impl FnMut(&Token) + Send + 'static) {
        self.add_subscriber(Box::new(callback), false);
    }

    /// Calls `callback` with the next new token only.
    pub fn subscribe_oneshot(&self, callback: impl FnMut(&Token) + Send + 'static) {
        self.add_subscriber(Box::new(callback), true);
    }

    fn add_subscriber(&self, callback: Callback, oneshot: bool) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { callback, oneshot });
    }

    /// Returns the number of pending subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn notify(&self, token: &Token) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain_mut(|subscriber| {
            (subscriber.callback)(token);
            !subscriber.oneshot
        });
    }

    /// Delay until `token` should be replaced: 75% of its remaining lifetime.
    fn renew_delay(&self, token: &Token) -> Duration {
        let lifetime = token
            .expires_at
            .and_then(|expires_at| (expires_at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::from_secs(self.expiration));
        lifetime.mul_f64(0.75).max(MIN_RENEW_DELAY)
    }

    /// Runs the renewal loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let created = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.service.create_token(self.expiration) => result,
            };

            let delay = match created {
                Ok(token) => {
                    info!(token = %token.token, "Service token renewed");
                    self.notify(&token);
                    backoff = INITIAL_BACKOFF;
                    self.renew_delay(&token)
                }
                Err(e) => {
                    warn!(error = %e, retry_secs = backoff.as_secs(), "Failed to create service token");
                    let delay = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Service token renewer stopped");
    }

    /// Spawns the renewal loop.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::client::AuthError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use websocketd_core::{TenantUuid, TokenId};

    /// Fails `failures` times, then hands out numbered tokens.
    struct CountingService {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl TokenService for CountingService {
        async fn get_token(&self, _: &TokenId, _: &str) -> Result<Token, AuthError> {
            Err(AuthError::Denied { status: 404 })
        }

        async fn is_valid_token(&self, _: &TokenId, _: &str) -> Result<bool, AuthError> {
            Ok(false)
        }

        async fn create_token(&self, _expiration: u64) -> Result<Token, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AuthError::Transport("unreachable".to_string()));
            }
            let id = TokenId::parse(&format!("service-{n}")).unwrap();
            Ok(Token::new(id, None).with_tenant("6b1c5e55-2f4e-4bb9-9a39-8f7e0c1d2a3b".parse::<TenantUuid>().unwrap()))
        }
    }

    fn renewer(failures: usize) -> Arc<ServiceTokenRenewer> {
        let service = Arc::new(CountingService {
            calls: AtomicUsize::new(0),
            failures,
        });
        Arc::new(ServiceTokenRenewer::new(service, 100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_oneshot_and_persistent_subscribers() {
        let renewer = renewer(0);
        let persistent = Arc::new(Mutex::new(Vec::new()));
        let oneshot = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&persistent);
        renewer.subscribe(move |token| seen.lock().unwrap().push(token.token.as_str().to_string()));
        let seen = Arc::clone(&oneshot);
        renewer.subscribe_oneshot(move |token| seen.lock().unwrap().push(token.token.as_str().to_string()));

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&renewer).spawn(cancel.clone());

        // Renewals happen every 75s for a 100s token
        tokio::time::sleep(Duration::from_secs(160)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*persistent.lock().unwrap(), vec!["service-0", "service-1", "service-2"]);
        assert_eq!(*oneshot.lock().unwrap(), vec!["service-0"]);
        assert_eq!(renewer.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_creation_backs_off() {
        let renewer = renewer(3);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        renewer.subscribe_oneshot(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&renewer).spawn(cancel.clone());

        // Retries after 1s, 2s and 4s
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_promptly() {
        let renewer = renewer(usize::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        renewer.run(cancel).await;
    }
}
