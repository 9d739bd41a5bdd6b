//! `fleetutils::error` is a module containing error utilities for the workshop fleet project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a fleetutils-related operation.
pub type FleetutilsResult<T> = Result<T, FleetutilsError>;

/// An error that occurred in one of the fleet utilities.
#[derive(pretty_error_debug::Debug, Error)]
pub enum FleetutilsError {
    /// A required executable could not be located.
    #[error("binary `{name}` not found (set {env_var} to override): {reason}")]
    BinaryNotFound {
        /// The executable name that was searched for.
        name: String,

        /// The environment variable that overrides the lookup.
        env_var: String,

        /// Why the lookup failed.
        reason: String,
    },

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetutilsError {
    /// Wraps any error into a `FleetutilsError`.
    pub fn custom(error: impl Into<anyhow::Error>) -> FleetutilsError {
        FleetutilsError::Custom(AnyError {
            error: error.into(),
        })
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
