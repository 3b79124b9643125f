//! # Error Handling
//!
//! Error types for the three boundaries of the service:
//!
//! - **AppError**: what HTTP handlers return; converted to a JSON response
//! - **EngineError**: what the speech engine returns for a single inference or load
//! - **TransportError**: what the event sink returns when the client connection is gone
//!
//! ## Propagation rules:
//! - Startup code (config, model download) uses `anyhow::Result` and aborts the process.
//! - An `EngineError` during a session becomes an `error` event for that session only.
//! - A `TransportError` ends the result sender and starts the session teardown.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The speech engine is not loaded or the session limit is reached (503 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Unavailable("Speech engine is reloading".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "Speech engine is not loaded",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// When you use `?` with an anyhow::Error in a handler, it becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable => AppError::Unavailable(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

/// Failures at the speech engine boundary.
///
/// `Inference` is local to one chunk and never ends a session. `Load` comes
/// from (re)initialization, after which the engine stays `Unavailable` until
/// a later reload succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// No model instance is loaded
    Unavailable,
    /// A single transcription failed
    Inference(String),
    /// Loading or reloading the model failed
    Load(String),
    /// The inference task was abandoned before it produced a result
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unavailable => write!(f, "Speech engine is not loaded"),
            EngineError::Inference(msg) => write!(f, "Transcription failed: {}", msg),
            EngineError::Load(msg) => write!(f, "Failed to load speech engine: {}", msg),
            EngineError::Cancelled => write!(f, "Transcription was cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<candle_core::Error> for EngineError {
    fn from(err: candle_core::Error) -> Self {
        EngineError::Inference(err.to_string())
    }
}

/// Failure to deliver an event to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The peer or its connection actor is gone
    Closed,
    /// The event could not be encoded for the wire
    Encode(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "Connection is closed"),
            TransportError::Encode(msg) => write!(f, "Failed to encode event: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}
