use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use websocketd_core::MasterTenantProxy;

use super::{Handshake, Session};
use crate::auth::Authenticator;
use crate::bus::BusService;
use crate::config::Config;

/// Per-session timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Time a client has to send its token when the handshake had none
    pub token_timeout: Duration,

    /// Server ping period, `None` disables pings
    pub ping_interval: Option<Duration>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_timeout: config.token_timeout(),
            ping_interval: config.websocket.ping_interval(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Builds sessions wired to one worker's shared services.
///
/// Holds no per-connection state beyond the id counter; clones share it.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    authenticator: Authenticator,
    bus: BusService,
    master_tenant: MasterTenantProxy,
    settings: SessionSettings,
    shutdown: CancellationToken,
    next_id: Arc<AtomicU64>,
}

impl SessionFactory {
    pub fn new(
        authenticator: Authenticator,
        bus: BusService,
        master_tenant: MasterTenantProxy,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            authenticator,
            bus,
            master_tenant,
            settings,
            shutdown,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates the session for an accepted connection.
    pub fn create<S>(&self, ws: WebSocketStream<S>, handshake: Handshake) -> Session<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Session::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            ws,
            handshake,
            self.authenticator.clone(),
            self.bus.clone(),
            self.master_tenant.clone(),
            self.settings,
            self.shutdown.clone(),
        )
    }
}
