//! HTTP client for the auth service token API.
//!
//! Only the three calls the gateway needs are implemented:
//! - `GET  {base}/token/{id}?scope={acl}` fetches a token
//! - `HEAD {base}/token/{id}?scope={acl}` checks a token
//! - `POST {base}/token` creates the gateway's own token

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use websocketd_core::{Token, TokenId};

use crate::config::AuthConfig;

/// Errors returned by the auth service client.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The auth service refused the token or credentials
    #[error("Auth service denied the request (HTTP {status})")]
    Denied { status: u16 },

    /// The auth service could not be reached or answered with an error
    #[error("Auth service transport failure: {0}")]
    Transport(String),

    /// The auth service answered with something that is not a token
    #[error("Invalid auth service response: {0}")]
    InvalidResponse(String),

    /// Service credentials are not configured
    #[error("Service credentials are not configured")]
    MissingCredentials,
}

impl AuthError {
    /// Returns true if the auth service explicitly refused the request.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Token operations the gateway consumes from the auth service.
#[async_trait]
pub trait TokenService: Send + Sync + 'static {
    /// Fetches `token`, requiring it to grant `acl`.
    async fn get_token(&self, token: &TokenId, acl: &str) -> Result<Token, AuthError>;

    /// Returns false when the token is unknown, expired or lacks `acl`.
    ///
    /// Only transport failures are errors.
    async fn is_valid_token(&self, token: &TokenId, acl: &str) -> Result<bool, AuthError>;

    /// Creates the gateway's own token, valid for `expiration` seconds.
    async fn create_token(&self, expiration: u64) -> Result<Token, AuthError>;
}

/// Auth service response envelope.
#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    data: Token,
}

#[derive(Debug, Clone)]
struct ServiceCredentials {
    id: String,
    key: String,
}

/// `TokenService` backed by the auth service REST API.
#[derive(Debug, Clone)]
pub struct HttpAuthClient {
    client: Client,
    base_url: String,
    credentials: Option<ServiceCredentials>,
}

impl HttpAuthClient {
    /// Creates a client for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration, verify_certificate: bool) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!verify_certificate)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
        })
    }

    /// Creates a client from the `[auth]` section.
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let client = Self::new(config.base_url(), config.timeout(), config.verify_certificate)?;
        Ok(match (&config.service_id, &config.service_key) {
            (Some(id), Some(key)) => client.with_credentials(id, key),
            _ => client,
        })
    }

    /// Sets the credentials used to create the gateway's own token.
    #[must_use]
    pub fn with_credentials(mut self, id: impl Into<String>, key: impl Into<String>) -> Self {
        self.credentials = Some(ServiceCredentials {
            id: id.into(),
            key: key.into(),
        });
        self
    }

    fn token_url(&self, token: &TokenId) -> String {
        format!("{}/token/{}", self.base_url, token.as_str())
    }
}

fn is_denial(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
    )
}

async fn parse_token(response: reqwest::Response) -> Result<Token, AuthError> {
    let status = response.status();
    if is_denial(status) {
        return Err(AuthError::Denied {
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(AuthError::Transport(format!("unexpected status {status}")));
    }

    let body = response.bytes().await?;
    serde_json::from_slice::<TokenEnvelope>(&body)
        .map(|envelope| envelope.data)
        .map_err(|e| AuthError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl TokenService for HttpAuthClient {
    async fn get_token(&self, token: &TokenId, acl: &str) -> Result<Token, AuthError> {
        debug!(token = %token, acl, "Fetching token");
        let response = self
            .client
            .get(self.token_url(token))
            .query(&[("scope", acl)])
            .send()
            .await?;
        parse_token(response).await
    }

    async fn is_valid_token(&self, token: &TokenId, acl: &str) -> Result<bool, AuthError> {
        let response = self
            .client
            .head(self.token_url(token))
            .query(&[("scope", acl)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if is_denial(status) {
            debug!(token = %token, status = status.as_u16(), "Token no longer valid");
            Ok(false)
        } else {
            Err(AuthError::Transport(format!("unexpected status {status}")))
        }
    }

    async fn create_token(&self, expiration: u64) -> Result<Token, AuthError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(AuthError::MissingCredentials)?;

        let response = self
            .client
            .post(format!("{}/token", self.base_url))
            .basic_auth(&credentials.id, Some(&credentials.key))
            .json(&serde_json::json!({ "expiration": expiration }))
            .send()
            .await?;
        parse_token(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const TOKEN_BODY: &str = r#"{"data": {
        "token": "abcdef0123",
        "utc_expires_at": "2030-01-01T00:00:00.000000",
        "acl": ["websocketd", "events.#"],
        "metadata": {"uuid": "user-1", "tenant_uuid": "6b1c5e55-2f4e-4bb9-9a39-8f7e0c1d2a3b"}
    }}"#;

    fn client(server: &mockito::Server) -> HttpAuthClient {
        HttpAuthClient::new(format!("{}/0.1", server.url()), Duration::from_secs(2), true).unwrap()
    }

    fn token_id() -> TokenId {
        TokenId::parse("abcdef0123").unwrap()
    }

    #[tokio::test]
    async fn test_get_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/0.1/token/abcdef0123")
            .match_query(Matcher::UrlEncoded("scope".into(), "websocketd".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(TOKEN_BODY)
            .create_async()
            .await;

        let token = client(&server).get_token(&token_id(), "websocketd").await.unwrap();
        assert_eq!(token.token, token_id());
        assert_eq!(token.user_uuid(), Some("user-1"));
        assert!(token.tenant().is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_token_forbidden_is_denied() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/0.1/token/abcdef0123")
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let err = client(&server).get_token(&token_id(), "websocketd").await.unwrap_err();
        assert!(matches!(err, AuthError::Denied { status: 403 }));
    }

    #[tokio::test]
    async fn test_get_token_server_error_is_transport() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/0.1/token/abcdef0123")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let err = client(&server).get_token(&token_id(), "websocketd").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
    }

    #[tokio::test]
    async fn test_get_token_garbage_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/0.1/token/abcdef0123")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let err = client(&server).get_token(&token_id(), "websocketd").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_is_valid_token() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("HEAD", "/0.1/token/abcdef0123")
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("HEAD", "/0.1/token/revoked0")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let client = client(&server);
        assert!(client.is_valid_token(&token_id(), "websocketd").await.unwrap());
        let revoked = TokenId::parse("revoked0").unwrap();
        assert!(!client.is_valid_token(&revoked, "websocketd").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_token_uses_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/0.1/token")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::Json(serde_json::json!({"expiration": 3600})))
            .with_status(200)
            .with_body(TOKEN_BODY)
            .create_async()
            .await;

        let token = client(&server)
            .with_credentials("accent-websocketd", "secret")
            .create_token(3600)
            .await
            .unwrap();
        assert_eq!(token.token, token_id());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_token_without_credentials() {
        let server = mockito::Server::new_async().await;
        let err = client(&server).create_token(3600).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
    }
}
