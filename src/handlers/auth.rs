//! HTTP Basic authentication shared by the JSON API and the WebDAV mount.

use crate::{errors::AppError, models::permission::Identity, services::engine::SpaceEngine};
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use base64::{Engine as _, engine::general_purpose};
use tracing::warn;

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

impl FromRequestParts<SpaceEngine> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, engine: &SpaceEngine) -> Result<Self, Self::Rejection> {
        authenticate(&parts.headers, engine).await.map(AuthUser)
    }
}

/// Resolve the `Authorization: Basic` header of a request to an identity.
pub async fn authenticate(headers: &HeaderMap, engine: &SpaceEngine) -> Result<Identity, AppError> {
    let (username, password) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic)
        .ok_or_else(|| AppError::unauthorized("authentication required"))?;

    match engine.accounts().authenticate(&username, &password).await? {
        Some(identity) => Ok(identity),
        None => {
            warn!(user = %username, "http authentication failed");
            Err(AppError::unauthorized("invalid credentials"))
        }
    }
}

/// Decode `Basic base64(user:password)`.
pub fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_credentials() {
        let header = format!("Basic {}", general_purpose::STANDARD.encode("alice:pa:ss"));
        assert_eq!(
            parse_basic(&header),
            Some(("alice".to_string(), "pa:ss".to_string()))
        );
        assert_eq!(parse_basic("Bearer abc"), None);
        assert_eq!(parse_basic("Basic !!!"), None);
    }
}
