//! Worker pool.
//!
//! Each worker is an OS thread running its own single-threaded tokio
//! runtime, its own bus connection and its own `WebsocketServer`. All
//! listeners are bound before any worker starts, with `SO_REUSEPORT`, so
//! the kernel spreads connections over workers. The master tenant cell is
//! shared by every worker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       ProcessPool                        │
//! │                                                          │
//! │  ┌──────────────┐  ┌──────────────┐     ┌──────────────┐ │
//! │  │  worker{0}   │  │  worker{1}   │ ... │  worker{n}   │ │
//! │  │ runtime      │  │ runtime      │     │ runtime      │ │
//! │  │ BusService   │  │ BusService   │     │ BusService   │ │
//! │  │ Websocket-   │  │ Websocket-   │     │ Websocket-   │ │
//! │  │   Server     │  │   Server     │     │   Server     │ │
//! │  └──────────────┘  └──────────────┘     └──────────────┘ │
//! │          ▲ shared: MasterTenantProxy, shutdown token      │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio_native_tls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use websocketd_core::MasterTenantProxy;

use crate::auth::{Authenticator, AuthError, HttpAuthClient, TokenService};
use crate::bus::BusConnector;
use crate::config::{Config, ProcessWorkers};
use crate::server::{bind_listener, load_tls, resolve_address, ServerError, WebsocketServer};
use crate::session::{SessionFactory, SessionSettings};

/// First delay before reconnecting a worker's bus.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Longest delay between two bus reconnections.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(32);

/// Errors raised while building or starting the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Invalid process_workers value {value}: expected a positive integer or \"auto\"")]
    InvalidWorkerCount { value: String },

    #[error("Pool already started")]
    AlreadyStarted,

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Failed to spawn worker {id}: {error}")]
    Spawn { id: usize, error: String },
}

/// Turns the `process_workers` setting into a worker count.
pub fn resolve_workers(setting: &ProcessWorkers) -> Result<usize, PoolError> {
    match setting {
        ProcessWorkers::Count(n) if *n > 0 => usize::try_from(*n).map_err(|_| PoolError::InvalidWorkerCount {
            value: n.to_string(),
        }),
        ProcessWorkers::Count(n) => Err(PoolError::InvalidWorkerCount { value: n.to_string() }),
        ProcessWorkers::Named(name) if name == ProcessWorkers::AUTO => {
            Ok(thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
        }
        ProcessWorkers::Named(name) => Err(PoolError::InvalidWorkerCount {
            value: format!("{name:?}"),
        }),
    }
}

/// Everything a worker needs, cloned once per worker.
#[derive(Clone)]
struct WorkerContext {
    config: Arc<Config>,
    master_tenant: MasterTenantProxy,
    bus: BusConnector,
    token_service: Arc<dyn TokenService>,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
}

/// Fixed set of worker threads serving WebSocket clients.
pub struct ProcessPool {
    workers: usize,
    context: WorkerContext,
    handles: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ProcessPool {
    /// Validates the configuration and prepares the pool.
    ///
    /// Fails before anything is spawned if `process_workers` is invalid.
    pub fn new(
        config: Arc<Config>,
        master_tenant: MasterTenantProxy,
        shutdown: CancellationToken,
    ) -> Result<Self, PoolError> {
        let workers = resolve_workers(&config.process_workers)?;
        let token_service: Arc<dyn TokenService> = Arc::new(HttpAuthClient::from_config(&config.auth)?);
        let tls = load_tls(&config.websocket)?;

        Ok(Self {
            workers,
            context: WorkerContext {
                bus: BusConnector::from_config(&config.bus),
                config,
                master_tenant,
                token_service,
                tls,
                shutdown,
            },
            handles: Vec::new(),
            local_addr: None,
        })
    }

    /// Uses `bus` instead of the configured bus.
    #[must_use]
    pub fn with_bus(mut self, bus: BusConnector) -> Self {
        self.context.bus = bus;
        self
    }

    /// Uses `service` instead of the configured auth service.
    #[must_use]
    pub fn with_token_service(mut self, service: Arc<dyn TokenService>) -> Self {
        self.context.token_service = service;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Address the workers listen on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listeners and spawns the workers.
    pub fn start(&mut self) -> Result<SocketAddr, PoolError> {
        if !self.handles.is_empty() {
            return Err(PoolError::AlreadyStarted);
        }

        let mut addr = resolve_address(&self.context.config.websocket)?;
        let mut listeners = Vec::with_capacity(self.workers);
        for id in 0..self.workers {
            let listener = bind_listener(addr)?;
            // Later workers must reuse the port the first one got (port 0)
            if id == 0 {
                if let Ok(bound) = listener.local_addr() {
                    addr = bound;
                }
            }
            listeners.push(listener);
        }

        for (id, listener) in listeners.into_iter().enumerate() {
            let context = self.context.clone();
            let handle = thread::Builder::new()
                .name(format!("websocketd-worker-{id}"))
                .spawn(move || run_worker_thread(id, listener, context))
                .map_err(|e| PoolError::Spawn {
                    id,
                    error: e.to_string(),
                });

            match handle {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    // Do not leave the already started workers running
                    self.context.shutdown.cancel();
                    return Err(e);
                }
            }
        }

        info!(workers = self.workers, addr = %addr, "Worker pool started");
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Asks every worker to stop.
    pub fn stop(&self) {
        self.context.shutdown.cancel();
    }

    /// Blocks until every worker has exited.
    pub fn join(mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }

    /// Waits for every worker without blocking the calling runtime.
    pub async fn wait(self) {
        if let Err(e) = tokio::task::spawn_blocking(move || self.join()).await {
            error!(error = %e, "Failed to join worker pool");
        }
    }
}

fn run_worker_thread(id: usize, listener: std::net::TcpListener, context: WorkerContext) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(worker = id, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    let span = info_span!("worker", id);
    runtime.block_on(
        async move {
            if let Err(e) = run_worker(listener, context).await {
                error!(error = %e, "Worker failed");
            }
        }
        .instrument(span),
    );
}

/// Serves connections, reconnecting the bus whenever it is lost.
async fn run_worker(listener: std::net::TcpListener, context: WorkerContext) -> Result<(), ServerError> {
    let listener = WebsocketServer::listener_from_std(listener)?;
    let authenticator = Authenticator::new(
        Arc::clone(&context.token_service),
        context.config.auth_check_strategy,
        context.config.auth_check_static_interval(),
    );
    let settings = SessionSettings::from_config(&context.config);
    let shutdown = &context.shutdown;
    let mut delay = INITIAL_RECONNECT_DELAY;

    info!("Worker started");

    while !shutdown.is_cancelled() {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = context.bus.connect() => connected,
        };
        let bus = match connected {
            Ok(bus) => {
                delay = INITIAL_RECONNECT_DELAY;
                bus
            }
            Err(e) => {
                warn!(error = %e, retry_secs = delay.as_secs(), "Bus connection failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                continue;
            }
        };

        let factory = SessionFactory::new(
            authenticator.clone(),
            bus.clone(),
            context.master_tenant.clone(),
            settings,
            shutdown.clone(),
        );
        let stop = shutdown.child_token();
        let server = WebsocketServer::new(Arc::clone(&listener), context.tls.clone(), factory, stop.clone());

        let lost = bus.connection_lost();
        let watcher = tokio::spawn(async move {
            lost.cancelled().await;
            stop.cancel();
        });

        server.serve().await?;
        watcher.abort();

        if let Err(e) = bus.close().await {
            warn!(error = %e, "Failed to close bus connection");
        }
        if !shutdown.is_cancelled() {
            warn!("Bus connection lost, reconnecting");
        }
    }

    info!("Worker stopped");
    Ok(())
}
