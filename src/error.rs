//! Setup errors for the relay and JSON error responses for the control surface

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Fatal errors raised while setting up the relay
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The inbound socket could not be bound
    #[error("failed to bind proxy socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no target address configured")]
    MissingTarget,
    /// The backend target address could not be resolved
    #[error("failed to resolve target address '{target}': {source}")]
    Resolve {
        target: String,
        #[source]
        source: std::io::Error,
    },
    /// The backend target resolved to no usable address
    #[error("target address '{target}' did not resolve to any address")]
    NoAddress { target: String },
    /// The bound socket did not report a local address
    #[error("failed to read local address of proxy socket: {0}")]
    LocalAddr(#[source] std::io::Error),
}

impl RelayError {
    pub fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        RelayError::Bind {
            addr: addr.into(),
            source,
        }
    }
}

/// Error codes returned by the control surface
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// No such route
    NotFound,
    /// Container id is not part of the managed group
    UnknownContainer,
    /// No backend group is configured for this proxy
    BackendDisabled,
    /// The backend driver reported a failure
    BackendActionFailed,
    /// Internal error
    InternalError,
}

impl ApiErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::UnknownContainer => StatusCode::NOT_FOUND,
            ApiErrorCode::BackendDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::BackendActionFailed => StatusCode::BAD_GATEWAY,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Idlegate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ApiErrorCode::Unauthorized => "UNAUTHORIZED",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::UnknownContainer => "UNKNOWN_CONTAINER",
            ApiErrorCode::BackendDisabled => "BACKEND_DISABLED",
            ApiErrorCode::BackendActionFailed => "BACKEND_ACTION_FAILED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ApiErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Idlegate-Error header
pub fn json_error_response(code: ApiErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("X-Idlegate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}
