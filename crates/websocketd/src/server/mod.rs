//! WebSocket server of one worker.
//!
//! The server:
//! - Accepts TCP connections on a listener bound with `SO_REUSEPORT`, so
//!   every worker can listen on the same address
//! - Optionally wraps them in TLS
//! - Upgrades each to a WebSocket and runs a `Session` for it
//! - Stops accepting on `stop()`, then waits for open sessions to close
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐
//! │  WebsocketServer  │
//! │                   │
//! │    TcpListener    │
//! └─────────┬─────────┘
//!           │ accept()
//!           ▼
//! ┌───────────────────┐     ┌─────────────────┐
//! │ handle_connection │────▶│ SessionFactory  │
//! │ (TLS + upgrade)   │     │                 │
//! └───────────────────┘     └────────┬────────┘
//!                                    │ create
//!                                    ▼
//!                           ┌─────────────────┐
//!                           │     Session     │
//!                           └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and allow continued operation

mod connection;

pub use connection::{handle_connection, ConnectionError, HANDSHAKE_TIMEOUT};

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::WebsocketConfig;
use crate::session::SessionFactory;

/// Pending connection backlog of the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Binds a non-blocking listener that other workers may share.
pub fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let setup = |e: std::io::Error| ServerError::SocketSetup {
        addr: addr.to_string(),
        error: e.to_string(),
    };

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(setup)?;
    socket.set_reuse_address(true).map_err(setup)?;
    socket.set_reuse_port(true).map_err(setup)?;
    socket.set_nonblocking(true).map_err(setup)?;
    socket.set_tcp_nodelay(true).map_err(setup)?;
    socket.bind(&addr.into()).map_err(setup)?;
    socket.listen(LISTEN_BACKLOG).map_err(setup)?;

    Ok(socket.into())
}

/// Resolves the configured listen address.
pub fn resolve_address(config: &WebsocketConfig) -> Result<SocketAddr, ServerError> {
    let address = config.bind_address();
    address
        .to_socket_addrs()
        .map_err(|e| ServerError::SocketSetup {
            addr: address.clone(),
            error: e.to_string(),
        })?
        .next()
        .ok_or(ServerError::SocketSetup {
            addr: address,
            error: "address did not resolve".to_string(),
        })
}

/// Loads the TLS identity when `ssl` is enabled.
pub fn load_tls(config: &WebsocketConfig) -> Result<Option<TlsAcceptor>, ServerError> {
    if !config.ssl {
        return Ok(None);
    }

    let (Some(certificate), Some(private_key)) = (&config.certificate, &config.private_key) else {
        return Err(ServerError::Tls(
            "ssl is enabled without certificate and private_key".to_string(),
        ));
    };

    let read = |path: &PathBuf| {
        std::fs::read(path).map_err(|e| ServerError::Tls(format!("failed to read {}: {e}", path.display())))
    };
    let identity = native_tls::Identity::from_pkcs8(&read(certificate)?, &read(private_key)?)
        .map_err(|e| ServerError::Tls(e.to_string()))?;
    let acceptor = native_tls::TlsAcceptor::new(identity).map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(Some(TlsAcceptor::from(acceptor)))
}

/// Accept loop of one worker.
pub struct WebsocketServer {
    listener: Arc<TcpListener>,
    tls: Option<TlsAcceptor>,
    factory: SessionFactory,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl WebsocketServer {
    /// Creates a server accepting on `listener`.
    ///
    /// `stop` ends the accept loop; it is usually a child of the process
    /// shutdown token.
    pub fn new(
        listener: Arc<TcpListener>,
        tls: Option<TlsAcceptor>,
        factory: SessionFactory,
        stop: CancellationToken,
    ) -> Self {
        Self {
            listener,
            tls,
            factory,
            stop,
            tracker: TaskTracker::new(),
        }
    }

    /// Wraps a listener from [`bind_listener`]. Must run inside a runtime.
    pub fn listener_from_std(listener: std::net::TcpListener) -> Result<Arc<TcpListener>, ServerError> {
        let addr = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        TcpListener::from_std(listener)
            .map(Arc::new)
            .map_err(|e| ServerError::SocketSetup {
                addr,
                error: e.to_string(),
            })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.tracker.len()
    }

    /// Accepts connections until stopped, then waits for open sessions.
    pub async fn serve(&self) -> Result<(), ServerError> {
        info!(addr = ?self.local_addr(), tls = self.tls.is_some(), "WebSocket server listening");

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!("Server stop requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("WebSocket server stopped");
        Ok(())
    }

    /// Stops the accept loop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let tls = self.tls.clone();
        let factory = self.factory.clone();

        self.tracker.spawn(async move {
            if let Err(e) = handle_connection(stream, peer, tls, factory).await {
                debug!(peer = %peer, error = %e, "Connection dropped before session start");
            }
        });
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {addr}: {error}")]
    SocketSetup { addr: String, error: String },

    #[error("TLS setup failed: {0}")]
    Tls(String),
}
