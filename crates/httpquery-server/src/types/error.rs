//! Error types for the HTTP server.
//!
//! Query failures are not errors at this level: they travel inside a
//! [`httpquery::ResponseEnvelope`]. `ServerError` covers everything around
//! them (configuration, routing, body transport and relaying).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

/// All errors that can occur in the server.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate route: {method} {template}")]
    DuplicateRoute { method: String, template: String },

    #[error("Invalid route template '{template}': {reason}")]
    InvalidRoute { template: String, reason: String },

    #[error("Unknown route name: {0}")]
    UnknownRoute(String),

    #[error("Missing parameter '{param}' for route '{route}'")]
    MissingRouteParam { route: String, param: String },

    #[error("No route for {method} {path}")]
    NoRoute { method: String, path: String },

    #[error("Request body exceeds {max} bytes")]
    BodyTooLarge { max: usize },

    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("Invalid dataset size: {0}")]
    InvalidDatasetSize(String),

    /// No public URL is configured and the server is not bound to a listener.
    #[error("Cannot build an absolute URL: no public URL configured and no listener address")]
    MissingBaseUrl,

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Relay request failed: {0}")]
    Relay(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Query worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::Body(_) | ServerError::InvalidDatasetSize(_) => StatusCode::BAD_REQUEST,
            ServerError::NoRoute { .. } => StatusCode::NOT_FOUND,
            ServerError::Relay(_) => StatusCode::BAD_GATEWAY,
            ServerError::Config(_)
            | ServerError::DuplicateRoute { .. }
            | ServerError::InvalidRoute { .. }
            | ServerError::UnknownRoute(_)
            | ServerError::MissingRouteParam { .. }
            | ServerError::MissingBaseUrl
            | ServerError::Worker(_)
            | ServerError::Url(_)
            | ServerError::Io(_)
            | ServerError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable kind for the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::BodyTooLarge { .. }
            | ServerError::Body(_)
            | ServerError::InvalidDatasetSize(_)
            | ServerError::NoRoute { .. } => "transport",
            ServerError::Relay(_) => "relay",
            _ => "internal",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal failures are logged, not echoed.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("{self}");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (
            status,
            Json(serde_json::json!({
                "error": {
                    "kind": self.kind(),
                    "message": message,
                }
            })),
        )
            .into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
