//! Per-connection session state machine.
//!
//! ```text
//! CONNECTING ──▶ AUTHENTICATING ──▶ ACTIVE ──▶ CLOSING ──▶ CLOSED
//!                      │                          ▲
//!                      └──────── error ───────────┘
//! ```
//!
//! - AUTHENTICATING: the token comes from the upgrade request or, failing
//!   that, from a `token` message within `token_timeout`
//! - ACTIVE: `subscribe`, `start`, `token` and `ping` are served, bus
//!   events are filtered by tenant and ACL and written in broker order, the
//!   token is re-checked in the background. A token from another tenant
//!   moves every binding to a new queue scoped to that tenant
//! - CLOSING: the checker is cancelled and the bus queue deleted before the
//!   close frame goes out
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every error ends in a close frame carrying its code, never in a
//!   partial frame

mod error;
mod factory;
mod handshake;

pub use error::SessionError;
pub use factory::{SessionFactory, SessionSettings};
pub use handshake::{Handshake, TOKEN_HEADER};

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use websocketd_core::{AccessCheck, MasterTenantProxy, TenantUuid, Token, TokenId};
use websocketd_protocol::{
    ClientRequest, ProtocolError, ServerMessage, ServerOp, SessionProtocolDecoder, SessionProtocolEncoder,
};

use crate::auth::{AuthCheckError, Authenticator};
use crate::bus::{Binding, BusEvent, BusService, SessionSubscriptions, ALL_EVENTS};

/// How long to wait for the client to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

/// One WebSocket client.
pub struct Session<S> {
    id: u64,
    ws: WebSocketStream<S>,
    handshake: Handshake,
    state: SessionState,
    authenticator: Authenticator,
    bus: BusService,
    master_tenant: MasterTenantProxy,
    decoder: SessionProtocolDecoder,
    settings: SessionSettings,
    shutdown: CancellationToken,
}

/// Everything an authenticated session owns.
struct ActiveSession {
    token: Token,
    tenant: TenantUuid,
    access: AccessCheck,
    token_tx: watch::Sender<Token>,
    refreshes: watch::Receiver<Token>,
    encoder: SessionProtocolEncoder,
    started: bool,
    subscriptions: SessionSubscriptions,
    checker: JoinHandle<Result<(), AuthCheckError>>,
}

impl ActiveSession {
    fn set_token(&mut self, token: Token, tenant: TenantUuid) {
        self.access = AccessCheck::for_token(&token);
        self.tenant = tenant;
        self.token = token;
    }

    /// Returns true if some binding no longer fits the current token.
    fn has_stale_bindings(&self, previous_tenant: TenantUuid) -> bool {
        if previous_tenant != self.tenant {
            return true;
        }
        self.subscriptions
            .bindings()
            .any(|binding| !self.may_subscribe(&binding.event_name))
    }

    /// Returns true if the token may receive events named `event_name`.
    fn may_subscribe(&self, event_name: &str) -> bool {
        if event_name == ALL_EVENTS {
            return true;
        }
        if self.access.matches_required_access(&format!("events.{event_name}")) {
            return true;
        }
        self.token.user_uuid().is_some_and(|user| {
            self.access
                .matches_required_access(&format!("events.users.{user}.{event_name}"))
        })
    }

    /// Stops the checker, then removes every binding.
    async fn teardown(self) {
        self.checker.abort();
        self.subscriptions.close().await;
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        ws: WebSocketStream<S>,
        handshake: Handshake,
        authenticator: Authenticator,
        bus: BusService,
        master_tenant: MasterTenantProxy,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            ws,
            handshake,
            state: SessionState::Connecting,
            authenticator,
            bus,
            master_tenant,
            decoder: SessionProtocolDecoder::new(),
            settings,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    /// Runs the session to completion.
    pub async fn run(mut self) {
        let outcome = match self.activate().await {
            Ok(mut active) => {
                let result = self.event_loop(&mut active).await;
                self.transition(SessionState::Closing);
                active.teardown().await;
                result
            }
            Err(e) => {
                self.transition(SessionState::Closing);
                Err(e)
            }
        };

        self.finish(outcome).await;
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    async fn activate(&mut self) -> Result<ActiveSession, SessionError> {
        self.transition(SessionState::Authenticating);

        let version = self.handshake.version.clone()?;
        let raw_token = match self.handshake.token.take() {
            Some(token) => token,
            None => self.wait_for_token().await?,
        };
        let (token, tenant) = self.authenticate(&raw_token).await?;

        let subscriptions = self.bus.open_subscriptions().await?;
        let (token_tx, token_rx) = watch::channel(token.clone());
        let (refreshed_tx, refreshes) = watch::channel(token.clone());
        let checker = self.authenticator.spawn_checker(token_rx, refreshed_tx);

        info!(
            session_id = self.id,
            token = %token.token,
            tenant = %tenant,
            version = %version,
            "Session authenticated"
        );

        Ok(ActiveSession {
            access: AccessCheck::for_token(&token),
            token,
            tenant,
            token_tx,
            refreshes,
            encoder: SessionProtocolEncoder::new(version),
            started: !version.requires_start(),
            subscriptions,
            checker,
        })
    }

    /// Waits for the first frame, which must be a `token` request.
    async fn wait_for_token(&mut self) -> Result<String, SessionError> {
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),
            first = timeout(self.settings.token_timeout, next_text(&mut self.ws)) => first,
        };

        let Ok(text) = first else {
            debug!(session_id = self.id, "No token before timeout");
            return Err(SessionError::NoToken);
        };

        match self.decoder.decode(&text?)? {
            ClientRequest::Token { token } => Ok(token),
            other => {
                debug!(session_id = self.id, op = other.op(), "First request is not a token");
                Err(SessionError::NoToken)
            }
        }
    }

    async fn authenticate(&self, raw_token: &str) -> Result<(Token, TenantUuid), SessionError> {
        let id = TokenId::parse(raw_token)?;
        let token = self.authenticator.get_token(&id).await?;
        let tenant = token.tenant().copied().ok_or(SessionError::NoTenant)?;
        Ok((token, tenant))
    }

    // ========================================================================
    // Active session
    // ========================================================================

    async fn event_loop(&mut self, active: &mut ActiveSession) -> Result<(), SessionError> {
        self.transition(SessionState::Active);
        self.send(active.encoder.encode_init()?).await?;

        let lost = self.bus.connection_lost();
        let mut pings = self.settings.ping_interval.map(|period| {
            let mut pings = interval_at(Instant::now() + period, period);
            pings.set_missed_tick_behavior(MissedTickBehavior::Delay);
            pings
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SessionError::Shutdown),

                _ = lost.cancelled() => return Err(SessionError::BusConnectionLost),

                checked = &mut active.checker => return Err(checker_outcome(checked)),

                refreshed = active.refreshes.changed() => match refreshed {
                    Ok(()) => {
                        let token = active.refreshes.borrow_and_update().clone();
                        self.refresh_token(active, token).await?;
                    }
                    Err(_) => return Err(checker_outcome((&mut active.checker).await)),
                },

                event = active.subscriptions.recv() => match event {
                    Some(event) => self.deliver(active, event).await?,
                    None => return Err(SessionError::BusConnectionLost),
                },

                message = self.ws.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_request(active, text.as_str()).await?,
                    Some(Ok(Message::Binary(_))) => return Err(ProtocolError::BinaryFrame.into()),
                    Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(SessionError::Disconnected),
                },

                _ = tick(&mut pings) => {
                    self.ws.send(Message::Ping(Default::default())).await?;
                }
            }
        }
    }

    async fn handle_request(&mut self, active: &mut ActiveSession, text: &str) -> Result<(), SessionError> {
        let request = self.decoder.decode(text)?;
        debug!(session_id = self.id, op = request.op(), "Request received");

        match request {
            ClientRequest::Token { token } => {
                let (token, tenant) = self.authenticate(&token).await?;
                info!(session_id = self.id, token = %token.token, tenant = %tenant, "Session token replaced");
                self.apply_token(active, token.clone(), tenant).await?;
                active.token_tx.send_replace(token);
                self.send(active.encoder.encode_reply(ServerOp::Token)?).await
            }
            ClientRequest::Subscribe { event_name } => self.subscribe(active, &event_name).await,
            ClientRequest::Start => {
                active.started = true;
                self.send(active.encoder.encode_reply(ServerOp::Start)?).await
            }
            ClientRequest::Ping { payload } => self.send(active.encoder.encode_pong(payload)?).await,
        }
    }

    async fn subscribe(&mut self, active: &mut ActiveSession, event_name: &str) -> Result<(), SessionError> {
        if !active.may_subscribe(event_name) {
            info!(session_id = self.id, event = event_name, "Subscription refused");
            let msg = format!("token may not receive {event_name} events");
            let frame = active
                .encoder
                .encode_refusal(ServerOp::Subscribe, ServerMessage::CODE_FORBIDDEN, &msg)?;
            return self.send(frame).await;
        }

        let tenant = self.tenant_filter(active.tenant);
        active
            .subscriptions
            .subscribe(Binding::new(event_name, tenant))
            .await?;

        debug!(session_id = self.id, event = event_name, all_tenants = tenant.is_none(), "Subscribed");
        self.send(active.encoder.encode_reply(ServerOp::Subscribe)?).await
    }

    /// Tenant bindings are scoped to, `None` for the master tenant.
    fn tenant_filter(&self, tenant: TenantUuid) -> Option<TenantUuid> {
        (!self.master_tenant.is_master(&tenant)).then_some(tenant)
    }

    /// Switches the session to `token`, rebinding when its scope changed.
    async fn apply_token(
        &mut self,
        active: &mut ActiveSession,
        token: Token,
        tenant: TenantUuid,
    ) -> Result<(), SessionError> {
        let previous_tenant = active.tenant;
        active.set_token(token, tenant);
        if active.has_stale_bindings(previous_tenant) {
            self.rebind(active).await?;
        }
        Ok(())
    }

    /// Applies a token refetched by the checker.
    async fn refresh_token(&mut self, active: &mut ActiveSession, token: Token) -> Result<(), SessionError> {
        // Refresh of a token the client has since replaced
        if token.token != active.token.token {
            return Ok(());
        }
        let tenant = token.tenant().copied().ok_or(SessionError::NoTenant)?;
        debug!(session_id = self.id, "Session token refreshed");
        self.apply_token(active, token, tenant).await
    }

    /// Moves the bindings the token still allows to a new queue scoped to
    /// the current tenant. Events queued under the old scope are dropped.
    async fn rebind(&mut self, active: &mut ActiveSession) -> Result<(), SessionError> {
        let event_names: Vec<String> = active
            .subscriptions
            .bindings()
            .map(|binding| binding.event_name.clone())
            .filter(|name| active.may_subscribe(name))
            .collect();

        let fresh = self.bus.open_subscriptions().await?;
        let stale = std::mem::replace(&mut active.subscriptions, fresh);
        stale.close().await;

        let tenant = self.tenant_filter(active.tenant);
        for event_name in &event_names {
            active
                .subscriptions
                .subscribe(Binding::new(event_name.as_str(), tenant))
                .await?;
        }

        info!(session_id = self.id, bindings = event_names.len(), tenant = %active.tenant, "Subscriptions rebound");
        Ok(())
    }

    /// Writes one bus event if the session may see it.
    ///
    /// Undecodable events are dropped, they never close the session.
    async fn deliver(&mut self, active: &ActiveSession, event: BusEvent) -> Result<(), SessionError> {
        if !active.started {
            return Ok(());
        }

        if let Some(tenant) = self.tenant_filter(active.tenant) {
            let event_tenant = event.tenant_uuid().and_then(|t| t.parse::<TenantUuid>().ok());
            if event_tenant != Some(tenant) {
                debug!(session_id = self.id, "Event from another tenant dropped");
                return Ok(());
            }
        }

        let Some(required) = event.required_access() else {
            warn!(session_id = self.id, "Bus event without name dropped");
            return Ok(());
        };
        if !active.access.matches_required_access(&required) {
            debug!(session_id = self.id, required = %required, "Event filtered by ACL");
            return Ok(());
        }

        let body: serde_json::Value = match serde_json::from_slice(&event.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "Undecodable bus event dropped");
                return Ok(());
            }
        };

        match active.encoder.encode_event(&body) {
            Ok(frame) => self.send(frame).await,
            Err(e) if e.is_invalid_event() => {
                warn!(session_id = self.id, error = %e, "Invalid bus event dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), SessionError> {
        self.ws.send(Message::text(frame)).await?;
        Ok(())
    }

    // ========================================================================
    // Closing
    // ========================================================================

    async fn finish(mut self, outcome: Result<(), SessionError>) {
        match outcome {
            Ok(()) => {
                debug!(session_id = self.id, "Client closed the session");
                // Flushes the close reply queued by the protocol layer
                let _ = self.ws.close(None).await;
            }
            Err(e) => match e.close_reason() {
                Some(reason) => {
                    match &e {
                        SessionError::Shutdown => debug!(session_id = self.id, "Closing session for shutdown"),
                        _ => info!(session_id = self.id, code = reason.code, error = %e, "Closing session"),
                    }

                    let frame = CloseFrame {
                        code: CloseCode::from(reason.code),
                        reason: reason.reason.into(),
                    };
                    match self.ws.close(Some(frame)).await {
                        Ok(()) => {
                            let ws = &mut self.ws;
                            let _ = timeout(CLOSE_TIMEOUT, async { while let Some(Ok(_)) = ws.next().await {} }).await;
                        }
                        Err(e) => debug!(session_id = self.id, error = %e, "Failed to send close frame"),
                    }
                }
                None => debug!(session_id = self.id, error = %e, "Session ended"),
            },
        }

        self.transition(SessionState::Closed);
    }
}

/// Reads frames until a text frame arrives.
async fn next_text<S>(ws: &mut WebSocketStream<S>) -> Result<String, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
            Some(Ok(Message::Binary(_))) => return Err(ProtocolError::BinaryFrame.into()),
            Some(Ok(Message::Close(_))) | None => return Err(SessionError::Disconnected),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn tick(pings: &mut Option<Interval>) {
    match pings {
        Some(pings) => {
            pings.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn checker_outcome(checked: Result<Result<(), AuthCheckError>, JoinError>) -> SessionError {
    match checked {
        Ok(Err(AuthCheckError::Auth(e))) => SessionError::AuthenticationFailed(e),
        Ok(Err(AuthCheckError::Expired)) | Ok(Ok(())) => SessionError::AuthenticationExpired,
        Err(e) => {
            warn!(error = %e, "Token checker task failed");
            SessionError::AuthenticationExpired
        }
    }
}
