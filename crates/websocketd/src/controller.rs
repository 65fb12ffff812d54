//! Top-level orchestration.
//!
//! Phases run strictly in order:
//! 1. Bus exchanges are declared, raced against shutdown. A shutdown
//!    during this phase skips straight to the end without starting
//!    workers.
//! 2. The service token renewer starts; its first token sets the master
//!    tenant.
//! 3. The worker pool starts and runs until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use websocketd_core::MasterTenantProxy;

use crate::auth::{HttpAuthClient, ServiceTokenRenewer, TokenService};
use crate::bus::BusConnector;
use crate::config::Config;
use crate::pool::ProcessPool;

pub struct Controller {
    config: Arc<Config>,
    bus: BusConnector,
    token_service: Arc<dyn TokenService>,
    master_tenant: MasterTenantProxy,
    shutdown: CancellationToken,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl Controller {
    /// Builds the controller for `config`; `shutdown` ends [`Controller::run`].
    pub fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let token_service: Arc<dyn TokenService> =
            Arc::new(HttpAuthClient::from_config(&config.auth).context("Failed to build auth client")?);

        Ok(Self {
            bus: BusConnector::from_config(&config.bus),
            config: Arc::new(config),
            token_service,
            master_tenant: MasterTenantProxy::new(),
            shutdown,
            ready: None,
        })
    }

    /// Uses `bus` instead of the configured bus.
    #[must_use]
    pub fn with_bus(mut self, bus: BusConnector) -> Self {
        self.bus = bus;
        self
    }

    /// Uses `service` instead of the configured auth service.
    #[must_use]
    pub fn with_token_service(mut self, service: Arc<dyn TokenService>) -> Self {
        self.token_service = service;
        self
    }

    /// Sends the listening address on `ready` once workers are started.
    #[must_use]
    pub fn notify_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// The master tenant cell shared with the workers.
    pub fn master_tenant(&self) -> MasterTenantProxy {
        self.master_tenant.clone()
    }

    /// Runs until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        // Worker settings are checked before anything starts
        let pool = ProcessPool::new(
            Arc::clone(&self.config),
            self.master_tenant.clone(),
            self.shutdown.child_token(),
        )
        .context("Invalid worker pool configuration")?
        .with_bus(self.bus.clone())
        .with_token_service(Arc::clone(&self.token_service));

        // Phase 1: bus exchanges
        let initialized = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            result = self.initialize_bus() => Some(result),
        };
        match initialized {
            None => {
                info!("Shutdown requested during bus initialization");
                return Ok(());
            }
            Some(result) => result?,
        }

        // Phase 2: service token and master tenant
        let renewer_stop = self.shutdown.child_token();
        let renewer = self.start_renewer(renewer_stop.clone());

        // Phase 3: workers
        let mut pool = pool;
        let started = pool.start().context("Failed to start worker pool");
        let addr = match started {
            Ok(addr) => addr,
            Err(e) => {
                renewer_stop.cancel();
                return Err(e);
            }
        };
        if let Some(ready) = self.ready {
            let _ = ready.send(addr);
        }

        self.shutdown.cancelled().await;
        info!("Stopping workers");

        pool.stop();
        pool.wait().await;

        renewer_stop.cancel();
        if let Some(renewer) = renewer {
            let _ = renewer.await;
        }

        info!("Controller stopped");
        Ok(())
    }

    async fn initialize_bus(&self) -> Result<()> {
        let bus = self.bus.connect().await.context("Failed to connect to bus")?;
        bus.initialize_exchanges()
            .await
            .context("Failed to initialize bus exchanges")?;
        if let Err(e) = bus.close().await {
            warn!(error = %e, "Failed to close initialization bus connection");
        }
        Ok(())
    }

    fn start_renewer(&self, stop: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.auth.service_id.is_none() || self.config.auth.service_key.is_none() {
            warn!("No service credentials configured, master tenant stays unknown");
            return None;
        }

        let renewer = Arc::new(ServiceTokenRenewer::new(
            Arc::clone(&self.token_service),
            self.config.auth.token_expiration,
        ));
        let master_tenant = self.master_tenant.clone();
        renewer.subscribe_oneshot(move |token| {
            master_tenant.set_master_tenant(token);
        });

        Some(renewer.spawn(stop))
    }
}
