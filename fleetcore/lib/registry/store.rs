use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::FleetResult;

use super::Sandbox;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Persists the registry's sandboxes so a restarted agent can reclaim them.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the last saved snapshot. A store that has never been written returns nothing.
    async fn load(&self) -> FleetResult<Vec<Sandbox>>;

    /// Replaces the saved snapshot.
    async fn save(&self, sandboxes: &[Sandbox]) -> FleetResult<()>;
}

/// A [`StateStore`] that remembers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

/// A [`StateStore`] backed by a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    sandboxes: Vec<Sandbox>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl JsonFileStore {
    /// Uses the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StateStore for NoopStore {
    async fn load(&self) -> FleetResult<Vec<Sandbox>> {
        Ok(Vec::new())
    }

    async fn save(&self, _sandboxes: &[Sandbox]) -> FleetResult<()> {
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> FleetResult<Vec<Sandbox>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&contents)?;
        Ok(snapshot.sandboxes)
    }

    async fn save(&self, sandboxes: &[Sandbox]) -> FleetResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = Snapshot {
            sandboxes: sandboxes.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::Utc;

    use super::*;
    use crate::registry::SandboxStatus;

    fn sandbox(seat_id: u32) -> Sandbox {
        Sandbox {
            workshop_id: "ws-1".to_string(),
            seat_id,
            ip: Ipv4Addr::new(172, 16, 0, 10 + seat_id as u8),
            tap_name: format!("fctap{seat_id}"),
            slot: seat_id,
            pid: Some(4000 + seat_id),
            status: SandboxStatus::Running,
            created_at: Utc::now(),
            vcpus: 2,
            memory_mib: 1024,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_json_store_replaces_snapshot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonFileStore::new(dir.path().join("nested/state.json"));

        store.save(&[sandbox(1), sandbox(2)]).await?;
        store.save(&[sandbox(2)]).await?;

        let loaded = store.load().await?;
        assert_eq!(loaded, vec![sandbox_with_time(&loaded[0], 2)]);
        assert!(!dir.path().join("nested/state.json.tmp").exists());
        Ok(())
    }

    fn sandbox_with_time(reference: &Sandbox, seat_id: u32) -> Sandbox {
        Sandbox {
            created_at: reference.created_at,
            ..sandbox(seat_id)
        }
    }
}
