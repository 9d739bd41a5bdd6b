use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};
use thiserror::Error;

use crate::registry::SandboxKey;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a fleet-related operation.
pub type FleetResult<T> = Result<T, FleetError>;

/// An error that occurred while provisioning, supervising or reaching a sandbox.
#[derive(Debug, Error)]
pub enum FleetError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error raised by one of the fleet utilities.
    #[error("utils error: {0}")]
    Utils(#[from] fleetutils::FleetutilsError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred while (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while parsing a TOML document.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred on an upstream WebSocket connection.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A sandbox with the same identity already exists on this host.
    #[error("sandbox {0} already exists")]
    SandboxExists(SandboxKey),

    /// The host already runs as many sandboxes as it is allowed to.
    #[error("host is at capacity ({capacity} sandboxes)")]
    CapacityExceeded {
        /// The configured capacity of the host.
        capacity: usize,
    },

    /// The requested sandbox does not exist.
    #[error("sandbox {0} not found")]
    SandboxNotFound(SandboxKey),

    /// The sandbox exists but is not serving yet (or anymore).
    #[error("sandbox {key} is not ready (status: {status})")]
    SandboxNotReady {
        /// The sandbox identity.
        key: SandboxKey,

        /// The sandbox's current status.
        status: String,
    },

    /// Creating or configuring host network devices failed.
    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    /// A network interface that should not exist yet is already present.
    #[error("network interface {0} already exists (stale resource from a previous run?)")]
    InterfaceExists(String),

    /// No free address is left in the sandbox subnet.
    #[error("no free address left in subnet {0}")]
    AddressPoolExhausted(String),

    /// A kernel or root filesystem image could not be found.
    #[error("boot image not found: {0}")]
    ImageMissing(PathBuf),

    /// The hypervisor process could not be started or died while starting.
    #[error("hypervisor launch failed: {0}")]
    ProcessLaunch(String),

    /// The hypervisor control socket never answered.
    #[error("hypervisor control socket {path} did not answer within {timeout_secs}s")]
    BootTimeout {
        /// The control socket path.
        path: PathBuf,

        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// A host never reported itself healthy.
    #[error("agent at {address} did not become healthy within {timeout_secs}s")]
    HealthTimeout {
        /// The agent base address.
        address: String,

        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// A bearer token was missing or did not match.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// An agent answered with an unexpected status.
    #[error("agent returned {status}: {message}")]
    Agent {
        /// The HTTP status code.
        status: u16,

        /// The error message returned by the agent.
        message: String,
    },

    /// A cloud provider operation failed.
    #[error("cloud provider error: {0}")]
    Cloud(String),

    /// No worker could take the requested sandbox.
    #[error("no worker available: {0}")]
    NoWorkerAvailable(String),

    /// An invalid argument was provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A lower-level error annotated with the sandbox it happened to.
    #[error("sandbox {key}: {source}")]
    WithSandbox {
        /// The sandbox identity.
        key: SandboxKey,

        /// The underlying error.
        #[source]
        source: Box<FleetError>,
    },
}

/// The error taxonomy used to decide how callers react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The sandbox already exists; reported, never retried.
    ResourceConflict,

    /// The host is full; retried on another host by placement.
    CapacityExceeded,

    /// Bridge/interface setup failed; fatal for the sandbox.
    NetworkSetupFailure,

    /// The hypervisor could not be started.
    ProcessLaunchFailure,

    /// A host or guest never became ready.
    HealthTimeout,

    /// A bearer token was rejected.
    AuthFailure,

    /// The target does not exist.
    NotFound,

    /// The target exists but is not serving.
    NotReady,

    /// The remote side could not be reached at all.
    Unreachable,

    /// The request itself was malformed.
    InvalidRequest,

    /// Anything else.
    Internal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> FleetError {
        FleetError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Annotates the error with the sandbox it belongs to.
    pub fn for_sandbox(self, key: &SandboxKey) -> FleetError {
        match self {
            FleetError::WithSandbox { .. } => self,
            other => FleetError::WithSandbox {
                key: key.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Classifies the error into the fleet error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::WithSandbox { source, .. } => source.kind(),
            FleetError::SandboxExists(_) => ErrorKind::ResourceConflict,
            FleetError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            FleetError::NetworkSetup(_)
            | FleetError::InterfaceExists(_)
            | FleetError::AddressPoolExhausted(_) => ErrorKind::NetworkSetupFailure,
            FleetError::ProcessLaunch(_) | FleetError::ImageMissing(_) => {
                ErrorKind::ProcessLaunchFailure
            }
            FleetError::BootTimeout { .. } | FleetError::HealthTimeout { .. } => {
                ErrorKind::HealthTimeout
            }
            FleetError::AuthFailure(_) => ErrorKind::AuthFailure,
            FleetError::SandboxNotFound(_) => ErrorKind::NotFound,
            FleetError::SandboxNotReady { .. } => ErrorKind::NotReady,
            FleetError::HttpRequest(e) if e.is_connect() || e.is_timeout() => {
                ErrorKind::Unreachable
            }
            FleetError::HttpMiddleware(reqwest_middleware::Error::Reqwest(e))
                if e.is_connect() || e.is_timeout() =>
            {
                ErrorKind::Unreachable
            }
            FleetError::HttpMiddleware(reqwest_middleware::Error::Middleware(_)) => {
                ErrorKind::Unreachable
            }
            FleetError::InvalidArgument(_) => ErrorKind::InvalidRequest,
            FleetError::Agent { status, .. } => match *status {
                400 | 422 => ErrorKind::InvalidRequest,
                401 | 403 => ErrorKind::AuthFailure,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::ResourceConflict,
                503 => ErrorKind::CapacityExceeded,
                _ => ErrorKind::Internal,
            },
            _ => ErrorKind::Internal,
        }
    }

    /// Whether another host may succeed where this one failed.
    pub fn is_retryable_elsewhere(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapacityExceeded | ErrorKind::Unreachable | ErrorKind::AuthFailure
        )
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `FleetResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> FleetResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_sees_through_sandbox_context() {
        let key = SandboxKey::new("ws-1", 3);
        let error = FleetError::InterfaceExists("fctap3".to_string()).for_sandbox(&key);

        assert_eq!(error.kind(), ErrorKind::NetworkSetupFailure);
        assert!(error.to_string().starts_with("sandbox ws-1/3:"));
    }

    #[test]
    fn test_for_sandbox_does_not_nest_twice() {
        let key = SandboxKey::new("ws-1", 3);
        let error = FleetError::CapacityExceeded { capacity: 2 }
            .for_sandbox(&key)
            .for_sandbox(&key);

        match error {
            FleetError::WithSandbox { source, .. } => {
                assert!(matches!(*source, FleetError::CapacityExceeded { .. }))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_agent_status_classification() {
        let capacity = FleetError::Agent {
            status: 503,
            message: "full".to_string(),
        };
        let conflict = FleetError::Agent {
            status: 409,
            message: "exists".to_string(),
        };
        let auth = FleetError::Agent {
            status: 401,
            message: "bad token".to_string(),
        };

        assert!(capacity.is_retryable_elsewhere());
        assert!(!conflict.is_retryable_elsewhere());
        assert_eq!(auth.kind(), ErrorKind::AuthFailure);
        assert!(auth.is_retryable_elsewhere());
    }
}
