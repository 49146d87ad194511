//! ==============================================================================
//! error.rs - error taxonomy
//! ==============================================================================
//!
//! purpose:
//!     typed errors crossing component boundaries. internals use anyhow and
//!     convert here.
//!
//!     - ValidationError: bad device payload, recovered by defaulting
//!     - StorageError:    persistence failed, surfaced to the caller
//!     - TransportError:  one observer's channel failed, never propagated
//!
//! ==============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use crate::hub::ObserverId;

/// malformed ingestion payload. logged, never returned to the device.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("measurement `alcohol` is missing")]
    MissingMeasurement,
    #[error("measurement `alcohol` is not a number: {0}")]
    InvalidMeasurement(String),
    #[error("field `{field}` has the wrong type: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// persistence layer unavailable or write failure
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("failed to persist reading: {0}")]
    Write(String),
    #[error("failed to query readings: {0}")]
    Query(String),
}

/// a single observer's channel failed
#[derive(Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("observer {0} disconnected")]
    Closed(ObserverId),
    #[error("observer {0} is lagging")]
    Lagging(ObserverId),
}

/// http-facing wrapper for storage failures
#[derive(Debug)]
pub struct ApiError(pub StorageError);

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("[HTTP] {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}
