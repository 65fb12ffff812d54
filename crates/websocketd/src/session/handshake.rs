use std::borrow::Cow;

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tracing::debug;

use websocketd_protocol::{ProtocolVersion, VersionError};

/// Header clients may carry their token in.
pub const TOKEN_HEADER: &str = "X-Auth-Token";

/// What the HTTP upgrade request told us about the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Requested protocol version, checked once the socket is open
    pub version: Result<ProtocolVersion, VersionError>,

    /// Token from the header or the query string
    pub token: Option<String>,
}

impl Handshake {
    /// Reads the version and token of an upgrade request.
    ///
    /// The header wins over the `token` query parameter.
    pub fn from_request(request: &Request) -> Self {
        let header_token = request
            .headers()
            .get(TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        Self::from_parts(request.uri().query(), header_token)
    }

    pub fn from_parts(query: Option<&str>, header_token: Option<&str>) -> Self {
        let mut version = None;
        let mut query_token = None;

        for pair in query.unwrap_or_default().split('&') {
            match pair.split_once('=') {
                Some(("version", value)) => version = Some(decode(value)),
                Some(("token", value)) => query_token = Some(decode(value)),
                _ => {}
            }
        }

        let token = match header_token {
            Some(token) => Some(token.to_string()),
            None => query_token.map(Cow::into_owned),
        }
        .filter(|token| !token.is_empty());

        Self {
            version: ProtocolVersion::from_query(version.as_deref()),
            token,
        }
    }
}

/// Percent-decodes a query value, keeping it raw if it is not UTF-8.
fn decode(value: &str) -> Cow<'_, str> {
    urlencoding::decode(value).unwrap_or_else(|e| {
        debug!(error = %e, "Query value is not valid UTF-8 once decoded");
        Cow::Borrowed(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let handshake = Handshake::from_parts(None, None);
        assert_eq!(handshake.version, Ok(ProtocolVersion::V1));
        assert_eq!(handshake.token, None);
    }

    #[test]
    fn test_query_parameters() {
        let handshake = Handshake::from_parts(Some("version=2&token=abc"), None);
        assert_eq!(handshake.version, Ok(ProtocolVersion::V2));
        assert_eq!(handshake.token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_query_values_are_percent_decoded() {
        let handshake = Handshake::from_parts(Some("token=abc%2Ddef&version=%32"), None);
        assert_eq!(handshake.version, Ok(ProtocolVersion::V2));
        assert_eq!(handshake.token.as_deref(), Some("abc-def"));
    }

    #[test]
    fn test_undecodable_value_kept_raw() {
        let handshake = Handshake::from_parts(Some("token=abc%FF"), None);
        assert_eq!(handshake.token.as_deref(), Some("abc%FF"));
    }

    #[test]
    fn test_empty_query_token_is_none() {
        let handshake = Handshake::from_parts(Some("token="), None);
        assert_eq!(handshake.token, None);
    }

    #[test]
    fn test_header_wins_over_query() {
        let handshake = Handshake::from_parts(Some("token=from-query"), Some("from-header"));
        assert_eq!(handshake.token.as_deref(), Some("from-header"));
    }

    #[test]
    fn test_unsupported_version() {
        let handshake = Handshake::from_parts(Some("version=9"), None);
        assert!(matches!(handshake.version, Err(VersionError::Unsupported(_))));
    }

    #[test]
    fn test_from_request() {
        let request = Request::builder()
            .uri("ws://localhost:9502/?version=2")
            .header(TOKEN_HEADER, "abc")
            .body(())
            .unwrap();

        let handshake = Handshake::from_request(&request);
        assert_eq!(handshake.version, Ok(ProtocolVersion::V2));
        assert_eq!(handshake.token.as_deref(), Some("abc"));
    }
}
