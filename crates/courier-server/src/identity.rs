//! Caller identity.
//!
//! Authentication happens upstream; the auth proxy forwards the resolved
//! user id in a configurable header and the server trusts it. Writes may
//! also name the live connection they were made from.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use courier_shared::constants::SESSION_HEADER;
use courier_shared::types::{ConnectionId, UserId};
use tracing::debug;

use crate::api::AppState;
use crate::error::ServerError;

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers, &state.config.identity_header)
            .map(AuthUser)
            .ok_or(ServerError::Unauthenticated)
    }
}

/// Live connection a write originated from, if the client named one.
/// An unreadable header is treated as absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOrigin(pub Option<ConnectionId>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SessionOrigin {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(SessionOrigin(session_from_headers(&parts.headers)))
    }
}

fn session_from_headers(headers: &HeaderMap) -> Option<ConnectionId> {
    let value = headers.get(SESSION_HEADER)?.to_str().ok()?;
    match ConnectionId::parse(value) {
        Ok(id) => Some(id),
        Err(e) => {
            debug!(error = %e, "Ignoring unreadable session header");
            None
        }
    }
}

pub fn identity_from_headers(headers: &HeaderMap, header: &str) -> Option<UserId> {
    let value = headers.get(header)?.to_str().ok()?;
    UserId::parse(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_identity_header_parsing() {
        let user = UserId::new();
        let mut headers = HeaderMap::new();
        assert_eq!(identity_from_headers(&headers, "x-user-id"), None);

        headers.insert("x-user-id", HeaderValue::from_static("not-a-uuid"));
        assert_eq!(identity_from_headers(&headers, "x-user-id"), None);

        headers.insert(
            "x-user-id",
            HeaderValue::from_str(&user.to_string()).unwrap(),
        );
        assert_eq!(identity_from_headers(&headers, "x-user-id"), Some(user));
        assert_eq!(identity_from_headers(&headers, "x-other"), None);
    }

    #[test]
    fn test_session_header_is_optional() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_from_headers(&headers), None);

        headers.insert(SESSION_HEADER, HeaderValue::from_static("garbage"));
        assert_eq!(session_from_headers(&headers), None);

        let conn = ConnectionId::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_str(&conn.to_string()).unwrap());
        assert_eq!(session_from_headers(&headers), Some(conn));
    }
}
