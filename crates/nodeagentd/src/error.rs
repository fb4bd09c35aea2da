//! Top-level agent error type. HTTP handlers map this to the status codes in
//! spec §7; `main` uses `anyhow::Result` at the outermost boundary, matching
//! the donor's `main.rs` style.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Auth(#[from] nc_transport::AuthError),
    #[error(transparent)]
    Trust(#[from] nc_trust::TrustStoreError),
    #[error(transparent)]
    Codec(#[from] nc_codec::CodecError),
    #[error("unknown application: {0}")]
    UnknownApp(String),
    #[error("bootstrap already completed")]
    BootstrapClosed,
    #[error("deploy busy")]
    Busy,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("operation timed out")]
    Timeout,
    #[error("agent unhealthy: {0}")]
    Unhealthy(String),
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        if let AgentError::Auth(auth_err) = self {
            return auth_err.into_response();
        }
        let status = match &self {
            AgentError::Trust(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AgentError::UnknownApp(_) => StatusCode::NOT_FOUND,
            AgentError::BootstrapClosed => StatusCode::FORBIDDEN,
            AgentError::Busy => StatusCode::CONFLICT,
            AgentError::BadRequest(_) | AgentError::Json(_) | AgentError::Codec(_) => {
                StatusCode::BAD_REQUEST
            }
            AgentError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AgentError::Timeout | AgentError::Unhealthy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::Auth(_) => unreachable!("handled above"),
        };
        (status, self.to_string()).into_response()
    }
}
