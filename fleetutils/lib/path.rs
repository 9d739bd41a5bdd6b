//! `fleetutils::path` is a module containing path utilities for the workshop fleet project.

use std::{
    env,
    path::{Path, PathBuf},
};

use crate::{FleetutilsError, FleetutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The suffix for log files
pub const LOG_SUFFIX: &str = "log";

/// The filename for a sandbox's console log
pub const CONSOLE_LOG_FILENAME: &str = "console.log";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves the path to an executable.
///
/// The environment variable `env_var` takes precedence. When it is unset the `name` is looked up
/// on `PATH`. An override that points at a missing file is an error rather than a silent fallback.
pub fn resolve_binary(name: &str, env_var: &str) -> FleetutilsResult<PathBuf> {
    if let Ok(value) = env::var(env_var) {
        let path = PathBuf::from(&value);
        if path.is_file() {
            return Ok(path);
        }

        return Err(FleetutilsError::BinaryNotFound {
            name: name.to_string(),
            env_var: env_var.to_string(),
            reason: format!("{} does not exist", path.display()),
        });
    }

    which::which(name).map_err(|e| FleetutilsError::BinaryNotFound {
        name: name.to_string(),
        env_var: env_var.to_string(),
        reason: e.to_string(),
    })
}

/// Returns the rotated backup path for a log file, e.g. `console.log` -> `console.log.1`.
pub fn backup_log_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_log_path_appends_index() {
        let path = Path::new("/var/run/fleet/ws-1-3/console.log");
        assert_eq!(
            backup_log_path(path, 1),
            PathBuf::from("/var/run/fleet/ws-1-3/console.log.1")
        );
        assert_eq!(
            backup_log_path(path, 2),
            PathBuf::from("/var/run/fleet/ws-1-3/console.log.2")
        );
    }

    #[test]
    fn test_resolve_binary_rejects_missing_override() {
        let env_var = "FLEETUTILS_TEST_MISSING_BINARY";
        unsafe {
            env::set_var(env_var, "/definitely/not/here/firecracker");
        }

        let result = resolve_binary("firecracker", env_var);
        assert!(matches!(
            result,
            Err(FleetutilsError::BinaryNotFound { ref reason, .. }) if reason.contains("does not exist")
        ));

        unsafe {
            env::remove_var(env_var);
        }
    }

    #[test]
    fn test_resolve_binary_accepts_existing_override() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        let env_var = "FLEETUTILS_TEST_PRESENT_BINARY";
        unsafe {
            env::set_var(env_var, file.path());
        }

        let resolved = resolve_binary("firecracker", env_var)?;
        assert_eq!(resolved, file.path());

        unsafe {
            env::remove_var(env_var);
        }
        Ok(())
    }
}
