//! Crate-wide error type and its HTTP mapping.
//!
//! Only the variants a client can observe map to a status code; the rest are
//! startup failures that never reach the router.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unknown source: {0}")]
    RouteNotFound(String),

    #[error("Failed to spawn worker '{program}': {source}")]
    WorkerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatewayError::RouteNotFound(_) => (StatusCode::NOT_FOUND, "404 Not Found\n"),
            GatewayError::WorkerSpawn { .. } => (StatusCode::BAD_GATEWAY, "502 Bad Gateway\n"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error\n"),
        };

        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}
