use std::{
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use fleetutils::resolve_binary;
use serde::Deserialize;
use tokio::process::Command;

use crate::{
    config::{
        CloudConfig, GCLOUD_BINARY, GCLOUD_EXE_ENV_VAR, METADATA_AUTH_TOKEN_KEY,
        METADATA_SEATS_KEY, METADATA_WORKSHOP_KEY,
    },
    FleetError, FleetResult,
};

use super::{CloudProvider, HostRecord, HostSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`CloudProvider`] driving Compute Engine through the `gcloud` CLI.
///
/// The agent token reaches the host through `--metadata-from-file`, so it never appears on a
/// command line.
#[derive(Debug, Clone)]
pub struct GcloudProvider {
    config: CloudConfig,
    binary: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: String,

    #[serde(default)]
    network_interfaces: Vec<InstanceInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,

    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GcloudProvider {
    /// Uses the `gcloud` binary at `binary`.
    pub fn new(config: CloudConfig, binary: impl Into<PathBuf>) -> Self {
        Self {
            config,
            binary: binary.into(),
        }
    }

    /// Finds `gcloud` through `FLEET_GCLOUD_EXE` or `PATH`.
    pub fn from_env(config: CloudConfig) -> FleetResult<Self> {
        let binary = resolve_binary(GCLOUD_BINARY, GCLOUD_EXE_ENV_VAR)?;
        Ok(Self::new(config, binary))
    }

    /// Arguments of `gcloud compute instances create`.
    fn create_args(&self, spec: &HostSpec, token_file: &Path) -> Vec<String> {
        let config = &self.config;
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            spec.name.clone(),
            format!("--project={}", config.get_project()),
            format!("--zone={}", config.get_zone()),
            format!("--machine-type={}", config.get_machine_type()),
            format!(
                "--create-disk=name={},boot=yes,auto-delete=yes,source-snapshot={}",
                spec.name,
                config.get_snapshot()
            ),
            "--enable-nested-virtualization".to_string(),
            format!(
                "--metadata={METADATA_WORKSHOP_KEY}={},{METADATA_SEATS_KEY}={}",
                spec.workshop_id, spec.seats
            ),
            format!(
                "--metadata-from-file={METADATA_AUTH_TOKEN_KEY}={}",
                token_file.display()
            ),
            "--format=json".to_string(),
        ];

        if *config.get_spot() {
            args.push("--provisioning-model=SPOT".to_string());
            args.push("--instance-termination-action=DELETE".to_string());
        }

        if let Some(network) = config.get_network() {
            args.push(format!("--network={network}"));
        }

        if !config.get_tags().is_empty() {
            args.push(format!("--tags={}", config.get_tags().join(",")));
        }

        args
    }

    fn location_args(&self) -> [String; 2] {
        [
            format!("--project={}", self.config.get_project()),
            format!("--zone={}", self.config.get_zone()),
        ]
    }

    async fn run(&self, args: &[String]) -> FleetResult<Output> {
        tracing::debug!(binary = %self.binary.display(), command = %args[..3.min(args.len())].join(" "), "running gcloud");
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| FleetError::Cloud(format!("failed to run gcloud: {e}")))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CloudProvider for GcloudProvider {
    async fn create_host(&self, spec: &HostSpec) -> FleetResult<HostRecord> {
        let token_file = tempfile::NamedTempFile::new()?;
        tokio::fs::write(token_file.path(), &spec.auth_token).await?;

        let output = self
            .run(&self.create_args(spec, token_file.path()))
            .await?;
        if !output.status.success() {
            return Err(FleetError::Cloud(format!(
                "creating host {} failed: {}",
                spec.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let instances: Vec<Instance> = serde_json::from_slice(&output.stdout)?;
        instances
            .into_iter()
            .next()
            .map(Instance::into_record)
            .ok_or_else(|| {
                FleetError::Cloud(format!("gcloud did not describe created host {}", spec.name))
            })
    }

    async fn delete_host(&self, name: &str) -> FleetResult<()> {
        let [project, zone] = self.location_args();
        let args = [
            "compute".to_string(),
            "instances".to_string(),
            "delete".to_string(),
            name.to_string(),
            project,
            zone,
            "--quiet".to_string(),
        ];

        let output = self.run(&args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || is_not_found(&stderr) {
            return Ok(());
        }

        Err(FleetError::Cloud(format!(
            "deleting host {name} failed: {}",
            stderr.trim()
        )))
    }

    async fn get_host(&self, name: &str) -> FleetResult<Option<HostRecord>> {
        let [project, zone] = self.location_args();
        let args = [
            "compute".to_string(),
            "instances".to_string(),
            "describe".to_string(),
            name.to_string(),
            project,
            zone,
            "--format=json".to_string(),
        ];

        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            return Err(FleetError::Cloud(format!(
                "describing host {name} failed: {}",
                stderr.trim()
            )));
        }

        let instance: Instance = serde_json::from_slice(&output.stdout)?;
        Ok(Some(instance.into_record()))
    }
}

impl Instance {
    fn into_record(self) -> HostRecord {
        let interface = self.network_interfaces.into_iter().next();
        let internal_ip = interface
            .as_ref()
            .and_then(|i| i.network_ip.as_deref())
            .and_then(|ip| ip.parse().ok());
        let external_ip = interface
            .iter()
            .flat_map(|i| i.access_configs.iter())
            .find_map(|config| config.nat_ip.as_deref()?.parse().ok());

        HostRecord {
            name: self.name,
            external_ip,
            internal_ip,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("was not found") || stderr.contains("notFound")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
