//! Error types and JSON error responses for the spawn server

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Error codes reported to REST and gateway clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Pool already holds the maximum number of slots
    PoolExhausted,
    /// No port is free in the worker range
    RangeExhausted,
    /// SSR was requested but no GPU can be assigned
    NoGpuAvailable,
    /// The requested rendering mode is switched off
    RenderingModeDisabled,
    /// Malformed request parameters
    InvalidRequest,
    /// No slot with the given id
    UnknownSlot,
    /// Slot is shutting down and accepts no further contact
    SlotTerminating,
    /// The worker process could not be started
    SpawnLaunchFailed,
    /// Failed to connect to the worker
    ConnectionFailed,
    /// Timed out waiting for the worker
    RequestTimeout,
    /// Unknown route
    NotFound,
    /// Internal server error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RangeExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::NoGpuAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::RenderingModeDisabled => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::UnknownSlot => StatusCode::NOT_FOUND,
            ErrorCode::SlotTerminating => StatusCode::GONE,
            ErrorCode::SpawnLaunchFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Spawn-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::PoolExhausted => "POOL_EXHAUSTED",
            ErrorCode::RangeExhausted => "RANGE_EXHAUSTED",
            ErrorCode::NoGpuAvailable => "NO_GPU_AVAILABLE",
            ErrorCode::RenderingModeDisabled => "RENDERING_MODE_DISABLED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnknownSlot => "UNKNOWN_SLOT",
            ErrorCode::SlotTerminating => "SLOT_TERMINATING",
            ErrorCode::SpawnLaunchFailed => "SPAWN_LAUNCH_FAILED",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Failure to start a worker process
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("worker executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors returned by pool operations
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("spawn pool is full ({max} slots)")]
    PoolExhausted { max: usize },
    #[error("no free port in the worker range")]
    RangeExhausted,
    #[error("no GPU available for server-side rendering")]
    NoGpuAvailable,
    #[error("rendering mode '{0}' is disabled")]
    RenderingModeDisabled(&'static str),
    #[error("unknown slot: {0}")]
    UnknownSlot(String),
    #[error("slot {0} is terminating")]
    SlotTerminating(String),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl SpawnError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SpawnError::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            SpawnError::RangeExhausted => ErrorCode::RangeExhausted,
            SpawnError::NoGpuAvailable => ErrorCode::NoGpuAvailable,
            SpawnError::RenderingModeDisabled(_) => ErrorCode::RenderingModeDisabled,
            SpawnError::UnknownSlot(_) => ErrorCode::UnknownSlot,
            SpawnError::SlotTerminating(_) => ErrorCode::SlotTerminating,
            SpawnError::Launch(_) => ErrorCode::SpawnLaunchFailed,
        }
    }

    /// Render as a JSON error response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Spawn-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(
        Full::new(Bytes::from(error.to_json()))
            .map_err(|e| match e {})
            .boxed(),
    );
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "X-Spawn-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}
