//! WebSocket upgrade of one accepted connection.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Failed upgrades are logged and drop the connection

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::accept_hdr_async_with_config;
use tracing::{debug, Instrument};

use websocketd_protocol::MAX_MESSAGE_SIZE;

use crate::session::{Handshake, SessionFactory};

/// Time a client has to complete the TLS and HTTP upgrade.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors while upgrading a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("TLS handshake failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("WebSocket handshake failed: {0}")]
    Upgrade(#[from] tokio_tungstenite::tungstenite::Error),
}

fn websocket_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE))
}

/// Upgrades `stream` and runs its session to completion.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    factory: SessionFactory,
) -> Result<(), ConnectionError> {
    match tls {
        Some(acceptor) => {
            let stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| ConnectionError::Timeout)??;
            upgrade_and_run(stream, peer, factory).await
        }
        None => upgrade_and_run(stream, peer, factory).await,
    }
}

async fn upgrade_and_run<S>(stream: S, peer: SocketAddr, factory: SessionFactory) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut handshake = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        handshake = Some(Handshake::from_request(request));
        Ok(response)
    };

    let ws = timeout(
        HANDSHAKE_TIMEOUT,
        accept_hdr_async_with_config(stream, callback, Some(websocket_config())),
    )
    .await
    .map_err(|_| ConnectionError::Timeout)??;

    let handshake = handshake.unwrap_or_else(|| Handshake::from_parts(None, None));
    let session = factory.create(ws, handshake);
    let span = tracing::info_span!("session", id = session.id(), %peer);

    async move {
        debug!("WebSocket connection accepted");
        session.run().await;
        debug!("Session closed");
    }
    .instrument(span)
    .await;

    Ok(())
}
