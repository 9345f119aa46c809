//! Error taxonomy for the gatekeeper service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use common::ErrorResponse;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[derive(Debug, Error)]
pub enum GatekeeperError {
    /// Malformed body or missing fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("instance not registered: {0}")]
    InstanceNotRegistered(String),

    #[error("instance already registered: {0}")]
    AlreadyRegistered(String),

    /// No contiguous window is free and growing the pool would pass the ceiling.
    #[error("pool exhausted: no {size} contiguous port(s) available in [{start}, {end})")]
    PoolExhausted { size: u32, start: u16, end: u16 },

    #[error("no binding matches {0}")]
    BindingNotFound(String),

    #[error("port {0} is not known to the pool")]
    PortNotFound(u16),

    #[error("{0} is not bound")]
    NotBound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatekeeperError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::NotBound(_) => StatusCode::BAD_REQUEST,
            Self::InstanceNotRegistered(_) | Self::BindingNotFound(_) | Self::PortNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::AlreadyRegistered(_) | Self::PoolExhausted { .. } => StatusCode::CONFLICT,
            Self::Config(_) | Self::Store(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable kind, used as the `error` field of responses.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InstanceNotRegistered(_) => "instance_not_registered",
            Self::AlreadyRegistered(_) => "already_registered",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::BindingNotFound(_) => "binding_not_found",
            Self::PortNotFound(_) => "port_not_found",
            Self::NotBound(_) => "not_bound",
            Self::Config(_) | Self::Store(_) | Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatekeeperError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
