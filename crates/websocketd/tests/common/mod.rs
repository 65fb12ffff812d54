//! Shared helpers for the gateway integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free behavior of
//! production code is checked through assertions.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use websocketd::auth::{AuthError, TokenService};
use websocketd::bus::{BusConnector, MemoryBus};
use websocketd::config::{AuthCheckStrategy, Config, ProcessWorkers};
use websocketd::pool::ProcessPool;
use websocketd::session::TOKEN_HEADER;
use websocketd_core::{MasterTenantProxy, TenantUuid, Token, TokenId};
use websocketd_protocol::ClientRequest;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for a frame from the gateway
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Time given to the session to drain events nobody should see
pub const SETTLE_TIME: Duration = Duration::from_millis(150);

pub const TENANT: &str = "6b1c5e55-2f4e-4bb9-9a39-8f7e0c1d2a3b";
pub const OTHER_TENANT: &str = "0d6f2c7a-91b4-4f3e-8a55-3c2b1e0f9d88";

pub fn tenant() -> TenantUuid {
    TENANT.parse().unwrap()
}

pub fn other_tenant() -> TenantUuid {
    OTHER_TENANT.parse().unwrap()
}

/// Builds a token granting the gateway ACL plus `acl`.
pub fn token(id: &str, tenant: Option<TenantUuid>, acl: &[&str]) -> Token {
    let mut entries = vec!["websocketd".to_string()];
    entries.extend(acl.iter().map(|entry| entry.to_string()));

    let token = Token::new(TokenId::parse(id).unwrap(), None).with_acl(entries);
    match tenant {
        Some(tenant) => token.with_tenant(tenant),
        None => token,
    }
}

// ============================================================================
// Scripted auth service
// ============================================================================

/// Auth service answering from an in-memory token table.
#[derive(Default)]
pub struct ScriptedTokenService {
    tokens: Mutex<HashMap<String, Token>>,
    revoked: Mutex<HashSet<String>>,
    service_token: Mutex<Option<Token>>,
    created: Mutex<usize>,
}

impl ScriptedTokenService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `token` known and valid.
    pub fn insert(&self, token: Token) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.token.as_str().to_string(), token);
    }

    /// Makes a known token invalid from now on.
    pub fn revoke(&self, id: &str) {
        self.revoked.lock().unwrap().insert(id.to_string());
    }

    /// Token handed out by `create_token`.
    pub fn set_service_token(&self, token: Token) {
        *self.service_token.lock().unwrap() = Some(token);
    }

    pub fn created_count(&self) -> usize {
        *self.created.lock().unwrap()
    }

    fn lookup(&self, id: &TokenId) -> Option<Token> {
        if self.revoked.lock().unwrap().contains(id.as_str()) {
            return None;
        }
        self.tokens.lock().unwrap().get(id.as_str()).cloned()
    }
}

#[async_trait]
impl TokenService for ScriptedTokenService {
    async fn get_token(&self, token: &TokenId, _acl: &str) -> Result<Token, AuthError> {
        self.lookup(token).ok_or(AuthError::Denied { status: 404 })
    }

    async fn is_valid_token(&self, token: &TokenId, _acl: &str) -> Result<bool, AuthError> {
        Ok(self.lookup(token).is_some())
    }

    async fn create_token(&self, _expiration: u64) -> Result<Token, AuthError> {
        *self.created.lock().unwrap() += 1;
        self.service_token
            .lock()
            .unwrap()
            .clone()
            .ok_or(AuthError::MissingCredentials)
    }
}

// ============================================================================
// Test server
// ============================================================================

/// Configuration listening on an ephemeral local port.
pub fn test_config() -> Config {
    let mut config = Config {
        process_workers: ProcessWorkers::Count(1),
        auth_check_strategy: AuthCheckStrategy::Static,
        auth_check_static_interval: 0.1,
        token_timeout: 0.5,
        ..Config::default()
    };
    config.websocket.listen = "127.0.0.1".to_string();
    config.websocket.port = 0;
    config.websocket.ping_interval = 0;
    config
}

/// Worker pool on an in-memory bus with a scripted auth service.
pub struct TestServer {
    pub addr: SocketAddr,
    pub bus: MemoryBus,
    pub tokens: Arc<ScriptedTokenService>,
    pub master_tenant: MasterTenantProxy,
    pool: ProcessPool,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = test_config();
        configure(&mut config);

        let bus = MemoryBus::new();
        let tokens = ScriptedTokenService::new();
        let master_tenant = MasterTenantProxy::new();

        let mut pool = ProcessPool::new(Arc::new(config), master_tenant.clone(), CancellationToken::new())
            .expect("build pool")
            .with_bus(BusConnector::Memory(bus.clone()))
            .with_token_service(tokens.clone());
        let addr = pool.start().expect("start pool");

        Self {
            addr,
            bus,
            tokens,
            master_tenant,
            pool,
        }
    }

    /// Connects with `query` appended to the URL.
    pub async fn connect(&self, query: &str) -> TestClient {
        let url = format!("ws://{}/?{}", self.addr, query);
        let (ws, _) = connect_async(url).await.expect("connect to gateway");
        TestClient { ws }
    }

    /// Connects with the token in the auth header.
    pub async fn connect_with_header(&self, query: &str, token: &str) -> TestClient {
        let mut request = format!("ws://{}/?{}", self.addr, query)
            .into_client_request()
            .expect("build request");
        request
            .headers_mut()
            .insert(TOKEN_HEADER, HeaderValue::from_str(token).expect("header value"));
        let (ws, _) = connect_async(request).await.expect("connect to gateway");
        TestClient { ws }
    }

    /// Registers a valid token and connects with it, waiting for `init`.
    pub async fn authenticated(&self, token: Token, query: &str) -> TestClient {
        let id = token.token.as_str().to_string();
        self.tokens.insert(token);

        let separator = if query.is_empty() { "" } else { "&" };
        let mut client = self.connect(&format!("token={id}{separator}{query}")).await;
        client.expect_init().await;
        client
    }

    /// Stops the workers and waits for them.
    pub async fn shutdown(self) {
        self.pool.stop();
        self.pool.wait().await;
    }

    /// Signals shutdown without waiting.
    pub fn stop(&self) {
        self.pool.stop();
    }
}

// ============================================================================
// Test client
// ============================================================================

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn send(&mut self, request: ClientRequest) {
        let text = serde_json::to_string(&request).unwrap();
        self.send_raw(&text).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.expect("send frame");
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::binary(data.to_vec()))
            .await
            .expect("send frame");
    }

    /// Receives the next text frame as JSON, skipping control frames.
    pub async fn recv(&mut self) -> Value {
        self.recv_timeout(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for a frame")
    }

    pub async fn recv_timeout(&mut self, duration: Duration) -> Option<Value> {
        let result = timeout(duration, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(text.as_str()).expect("JSON frame");
                    }
                    Some(Ok(Message::Close(frame))) => panic!("unexpected close: {frame:?}"),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => panic!("connection error: {e}"),
                    None => panic!("connection ended"),
                }
            }
        })
        .await;
        result.ok()
    }

    /// Reads until the close frame, returning its code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|frame| u16::from(frame.code)),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .expect("timed out waiting for close")
    }

    pub async fn expect_init(&mut self) {
        let init = self.recv().await;
        assert_eq!(init["op"], "init", "{init}");
        assert_eq!(init["code"], 0, "{init}");
    }

    /// Sends `request` and returns the reply.
    pub async fn request(&mut self, request: ClientRequest) -> Value {
        self.send(request).await;
        self.recv().await
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
