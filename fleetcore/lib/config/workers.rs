use std::path::Path;

use serde::Deserialize;

use crate::{FleetError, FleetResult};

use super::DEFAULT_CAPACITY;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Prefix marking a token that should be read from the environment.
const ENV_TOKEN_PREFIX: &str = "env:";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A statically configured worker host, as listed in the workers file.
///
/// ```toml
/// [[workers]]
/// name = "fleet-a"
/// address = "http://10.0.0.5:8080"
/// token = "env:FLEET_A_TOKEN"
/// capacity = 20
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerDescriptor {
    /// Human readable name; defaults to the address.
    #[serde(default)]
    pub name: Option<String>,

    /// Base URL of the worker's agent API.
    pub address: String,

    /// Bearer token of the worker, or `env:VAR` to read it from the environment.
    pub token: String,

    /// Maximum sandboxes the worker accepts.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// The top level of a workers file.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersFile {
    /// The configured workers.
    #[serde(default)]
    pub workers: Vec<WorkerDescriptor>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WorkerDescriptor {
    /// The worker's display name.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    /// Resolves the token, following `env:` indirections.
    pub fn resolve_token(&self) -> FleetResult<String> {
        match self.token.strip_prefix(ENV_TOKEN_PREFIX) {
            Some(var) => std::env::var(var).map_err(|_| {
                FleetError::InvalidConfig(format!(
                    "worker {} token variable {var} is not set",
                    self.display_name()
                ))
            }),
            None => Ok(self.token.clone()),
        }
    }
}

impl WorkersFile {
    /// Parses a workers file from its TOML text.
    pub fn parse(text: &str) -> FleetResult<Self> {
        let file: WorkersFile = toml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    /// Reads and parses a workers file.
    pub async fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::parse(&text)
    }

    fn validate(&self) -> FleetResult<()> {
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            if worker.address.trim().is_empty() {
                return Err(FleetError::InvalidConfig(
                    "worker address must not be empty".to_string(),
                ));
            }

            if worker.capacity == 0 {
                return Err(FleetError::InvalidConfig(format!(
                    "worker {} has zero capacity",
                    worker.display_name()
                )));
            }

            if !seen.insert(worker.address.trim_end_matches('/')) {
                return Err(FleetError::InvalidConfig(format!(
                    "worker {} is listed twice",
                    worker.address
                )));
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workers_file() -> anyhow::Result<()> {
        let file = WorkersFile::parse(
            r#"
            [[workers]]
            name = "fleet-a"
            address = "http://10.0.0.5:8080"
            token = "alpha"
            capacity = 20

            [[workers]]
            address = "http://10.0.0.6:8080"
            token = "beta"
            "#,
        )?;

        assert_eq!(file.workers.len(), 2);
        assert_eq!(file.workers[0].display_name(), "fleet-a");
        assert_eq!(file.workers[0].capacity, 20);
        assert_eq!(file.workers[1].display_name(), "http://10.0.0.6:8080");
        assert_eq!(file.workers[1].capacity, DEFAULT_CAPACITY);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_duplicate_workers() {
        let result = WorkersFile::parse(
            r#"
            [[workers]]
            address = "http://10.0.0.5:8080"
            token = "alpha"

            [[workers]]
            address = "http://10.0.0.5:8080/"
            token = "beta"
            "#,
        );

        assert!(matches!(result, Err(FleetError::InvalidConfig(_))));
    }

    #[test]
    fn test_resolve_token_from_environment() -> anyhow::Result<()> {
        unsafe {
            std::env::set_var("FLEET_TEST_WORKER_TOKEN", "from-env");
        }

        let worker = WorkerDescriptor {
            name: None,
            address: "http://10.0.0.5:8080".to_string(),
            token: "env:FLEET_TEST_WORKER_TOKEN".to_string(),
            capacity: 4,
        };
        assert_eq!(worker.resolve_token()?, "from-env");

        let missing = WorkerDescriptor {
            token: "env:FLEET_TEST_WORKER_TOKEN_MISSING".to_string(),
            ..worker
        };
        assert!(missing.resolve_token().is_err());
        Ok(())
    }
}
