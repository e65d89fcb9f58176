//! Error types for chat-relay.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for chat-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chat-relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to build upstream client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("Invalid API Key")]
    Unauthorized,

    #[error("Invalid request body: {message}")]
    InvalidBody { status: StatusCode, message: String },

    #[error("Upstream API error")]
    UpstreamStatus { status: StatusCode },

    #[error("Failed to reach upstream: {0}")]
    UpstreamUnreachable(#[source] reqwest::Error),

    #[error("Upstream stream failed: {0}")]
    Stream(#[source] reqwest::Error),

    #[error("Upstream client is closed")]
    ClientClosed,
}

impl Error {
    /// HTTP status this error maps to when it occurs before the first byte.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::ClientBuild(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::InvalidBody { status, .. } => *status,
            Error::UpstreamStatus { status } => *status,
            Error::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Error::Stream(_) => StatusCode::BAD_GATEWAY,
            Error::ClientClosed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized => "authentication_error",
            Error::InvalidBody { .. } => "invalid_request_error",
            Error::UpstreamStatus { .. } | Error::UpstreamUnreachable(_) | Error::Stream(_) => {
                "upstream_error"
            }
            Error::ClientBuild(_) | Error::ClientClosed => "relay_error",
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::InvalidBody {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // OpenAI-compatible error format
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16()
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unauthorized_response() {
        let response = Error::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let json = body_json(response).await;
        assert_eq!(json["error"]["message"], "Invalid API Key");
        assert_eq!(json["error"]["type"], "authentication_error");
        assert_eq!(json["error"]["code"], 401);
    }

    #[tokio::test]
    async fn test_upstream_status_is_passed_through() {
        let response = Error::UpstreamStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let json = body_json(response).await;
        assert_eq!(json["error"]["message"], "Upstream API error");
        assert_eq!(json["error"]["code"], 429);
    }

    #[tokio::test]
    async fn test_client_build_failure_is_internal() {
        // Any reqwest error will do; an unparsable URL is the easiest to make
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        let error = Error::ClientBuild(err);
        assert!(error.to_string().starts_with("Failed to build upstream client"));

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "relay_error");
        assert_eq!(json["error"]["code"], 500);
    }

    #[tokio::test]
    async fn test_invalid_body_keeps_rejection_status() {
        let response = Error::InvalidBody {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: "expected a map".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message"], "Invalid request body: expected a map");
    }

    #[test]
    fn test_client_closed_is_unavailable() {
        assert_eq!(Error::ClientClosed.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
