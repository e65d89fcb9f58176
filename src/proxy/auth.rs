//! Edge API-key gate.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::server::AppState;
use crate::config::ApiKey;
use crate::error::Error;

const BEARER_PREFIX: &str = "Bearer ";

/// Validates caller credentials against the single configured secret.
#[derive(Debug, Clone)]
pub struct AuthGate {
    secret: ApiKey,
}

impl AuthGate {
    pub fn new(secret: ApiKey) -> Self {
        Self { secret }
    }

    /// Admit a raw `Authorization` header value.
    ///
    /// A case-sensitive `Bearer ` prefix is stripped if present; the rest must
    /// equal the secret exactly. Returns the presented credential on success.
    pub fn admit<'a>(&self, header: Option<&'a str>) -> Result<&'a str, Error> {
        let header = header.ok_or(Error::Unauthorized)?;
        let credential = header.strip_prefix(BEARER_PREFIX).unwrap_or(header);

        if credential == self.secret.expose_secret() {
            Ok(credential)
        } else {
            Err(Error::Unauthorized)
        }
    }
}

/// Extractor proving the request carried a valid credential.
///
/// Placed ahead of the body extractor so rejected requests never touch the
/// upstream.
#[derive(Debug, Clone, Copy)]
pub struct Authorized;

#[async_trait]
impl FromRequestParts<AppState> for Authorized {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Error> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match state.gate.admit(header) {
            Ok(_) => Ok(Authorized),
            Err(e) => {
                tracing::warn!(
                    header_present = header.is_some(),
                    "Rejected request with invalid API key"
                );
                Err(e)
            }
        }
    }
}
