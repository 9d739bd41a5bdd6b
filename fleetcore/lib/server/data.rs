use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{registry::Resources, ErrorKind, FleetError};

//--------------------------------------------------------------------------------------------------
// Types: Requests
//--------------------------------------------------------------------------------------------------

/// Request body of `POST /vms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    /// The workshop the seat belongs to.
    pub workshop_id: String,

    /// The seat number.
    pub seat_id: u32,

    /// Number of vCPUs, host default if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u8>,

    /// Guest memory in MiB, host default if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
}

/// Query string of `GET /vms`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    /// Only list sandboxes of this workshop. Empty or absent lists all.
    #[serde(default)]
    pub workshop_id: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Types: Responses
//--------------------------------------------------------------------------------------------------

/// Response body of `GET /vms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    /// Number of entries.
    pub count: usize,

    /// The sandboxes.
    pub vms: Vec<T>,
}

/// Response type for operations without a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Human readable outcome.
    pub message: String,
}

/// Response body of `GET /proxy/{workshop_id}/{seat_id}/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestHealth {
    /// Whether every guest service answered.
    pub healthy: bool,

    /// Whether the terminal port accepted a connection.
    pub terminal: bool,

    /// Whether the file service answered its health check.
    pub files: bool,
}

//--------------------------------------------------------------------------------------------------
// Types: Error Response
//--------------------------------------------------------------------------------------------------

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code
    pub code: u16,

    /// Error message
    pub message: String,

    /// Error type for categorizing errors
    pub error_type: ErrorType,

    /// Optional additional details about the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Types of errors that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Invalid request parameters or body
    ValidationError,

    /// Missing or wrong bearer token
    AuthenticationError,

    /// Resource not found
    NotFound,

    /// The sandbox already exists
    Conflict,

    /// The host is full
    CapacityError,

    /// The sandbox could not be provisioned
    SandboxError,

    /// A guest service could not be reached through the proxy
    UpstreamError,

    /// Internal server errors
    InternalError,
}

/// An error returned by an agent route.
#[derive(Debug)]
pub enum ApiError {
    /// A failed registry operation.
    Fleet(FleetError),

    /// A guest service that could not be reached.
    Upstream(String),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CreateVmRequest {
    /// The requested resources.
    pub fn resources(&self) -> Resources {
        Resources {
            vcpus: self.vcpus,
            memory_mib: self.memory_mb,
        }
    }
}

impl StatusResponse {
    /// Creates a status response.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: u16, message: String, error_type: ErrorType) -> Self {
        Self {
            code,
            message,
            error_type,
            details: None,
        }
    }

    /// Add details to the error response, ignoring details for 500-level errors
    pub fn with_details(mut self, details: String) -> Self {
        if self.code < 500 {
            self.details = Some(details);
        }
        self
    }

    /// Maps a fleet error to its HTTP status and body.
    pub fn from_error(error: &FleetError) -> (StatusCode, Self) {
        let (status, error_type) = match error.kind() {
            ErrorKind::ResourceConflict => (StatusCode::CONFLICT, ErrorType::Conflict),
            ErrorKind::CapacityExceeded => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorType::CapacityError)
            }
            ErrorKind::NotFound | ErrorKind::NotReady => {
                (StatusCode::NOT_FOUND, ErrorType::NotFound)
            }
            ErrorKind::AuthFailure => (StatusCode::UNAUTHORIZED, ErrorType::AuthenticationError),
            ErrorKind::InvalidRequest => (StatusCode::BAD_REQUEST, ErrorType::ValidationError),
            ErrorKind::NetworkSetupFailure
            | ErrorKind::ProcessLaunchFailure
            | ErrorKind::HealthTimeout => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorType::SandboxError)
            }
            ErrorKind::Unreachable | ErrorKind::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorType::InternalError)
            }
        };

        let body = ErrorResponse::new(status.as_u16(), error.to_string(), error_type);
        let body = match error.kind() {
            ErrorKind::NotReady => body.with_details("sandbox is not running".to_string()),
            _ => body,
        };
        (status, body)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<FleetError> for ApiError {
    fn from(error: FleetError) -> Self {
        ApiError::Fleet(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Fleet(error) => {
                let (status, body) = ErrorResponse::from_error(&error);
                if status.is_server_error() {
                    tracing::error!(error = %error, "request failed");
                }
                (status, body)
            }
            ApiError::Upstream(message) => {
                tracing::warn!(%message, "guest service unreachable");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorResponse::new(502, message, ErrorType::UpstreamError),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
