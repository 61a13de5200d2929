use async_trait::async_trait;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SupervisorError;
use crate::process::ProcessSpec;

/// Placeholder in profile arguments replaced by the core config path
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// What to do when a watched companion process disappears
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DependencyAction {
    /// Stop the managed process
    #[default]
    #[serde(rename = "stop-managed")]
    StopManaged,
    /// Shut the whole supervisor down
    #[serde(rename = "exit-all")]
    ExitSupervisor,
}

/// Policy for one companion process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyPolicy {
    /// Process name as it appears in the process table
    pub name: String,
    #[serde(default = "default_true")]
    pub monitor: bool,
    #[serde(default)]
    pub on_down: DependencyAction,
    /// Terminate the companion when the supervisor exits
    #[serde(default)]
    pub terminate_on_exit: bool,
}

impl DependencyPolicy {
    pub fn stop_managed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            monitor: true,
            on_down: DependencyAction::StopManaged,
            terminate_on_exit: false,
        }
    }

    pub fn exit_supervisor(name: impl Into<String>) -> Self {
        Self {
            on_down: DependencyAction::ExitSupervisor,
            ..Self::stop_managed(name)
        }
    }

    pub fn with_terminate_on_exit(mut self, terminate: bool) -> Self {
        self.terminate_on_exit = terminate;
        self
    }

    pub fn with_monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }
}

/// Supervisor settings, loaded once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase", default)]
#[builder(default, setter(into))]
pub struct SupervisorConfig {
    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// Core profile, re-read on every start
    pub profile: PathBuf,
    /// Loopback address of the control surface
    pub listen: String,
    /// Side-channel command file, polled when set
    #[builder(setter(into, strip_option))]
    pub command_file: Option<PathBuf>,
    /// Whether the control surface is served
    pub rpc: bool,
    pub grace_period_ms: u64,
    pub exit_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub command_poll_ms: u64,
    pub status_capacity: usize,
    /// Stop the managed process when the last status stream disconnects
    pub stop_on_stream_disconnect: bool,
    pub require_elevated: bool,
    #[builder(setter(custom))]
    pub dependencies: Vec<DependencyPolicy>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::new(),
            profile: PathBuf::from("config.obv"),
            listen: "127.0.0.1:50051".to_string(),
            command_file: Some(PathBuf::from("cmd.obv")),
            rpc: true,
            grace_period_ms: 2_000,
            exit_grace_ms: 2_000,
            poll_interval_ms: 3_000,
            command_poll_ms: 1_000,
            status_capacity: 100,
            stop_on_stream_disconnect: true,
            require_elevated: false,
            dependencies: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Read settings from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, SupervisorError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => return Err(read_error(path, e)),
        };
        serde_json::from_str(&content).map_err(|e| SupervisorError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.grace_period_ms == 0 {
            return Err(anyhow::anyhow!("gracePeriodMs must be greater than zero"));
        }

        if self.command_poll_ms == 0 || self.command_poll_ms > 1_000 {
            return Err(anyhow::anyhow!(
                "commandPollMs must be between 1 and 1000 milliseconds"
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("pollIntervalMs must be greater than zero"));
        }

        if self.status_capacity == 0 {
            return Err(anyhow::anyhow!("statusCapacity must be greater than zero"));
        }

        let mut seen = std::collections::HashSet::new();
        for dependency in &self.dependencies {
            if dependency.name.trim().is_empty() {
                return Err(anyhow::anyhow!("dependency name cannot be empty"));
            }
            if !seen.insert(dependency.name.as_str()) {
                return Err(anyhow::anyhow!(
                    "dependency {} is listed more than once",
                    dependency.name
                ));
            }
        }

        Ok(())
    }

    /// Resolve a configured path against `base_dir`
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn profile_path(&self) -> PathBuf {
        self.resolve_path(&self.profile)
    }

    pub fn command_file_path(&self) -> Option<PathBuf> {
        self.command_file.as_deref().map(|p| self.resolve_path(p))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_poll(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms)
    }

    /// Upper bound for the stop performed during shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        self.grace_period() + Duration::from_secs(5)
    }
}

impl SupervisorConfigBuilder {
    pub fn dependency(&mut self, policy: DependencyPolicy) -> &mut Self {
        self.dependencies
            .get_or_insert_with(Vec::new)
            .push(policy);
        self
    }

    pub fn dependencies<I: IntoIterator<Item = DependencyPolicy>>(&mut self, iter: I) -> &mut Self {
        self.dependencies
            .get_or_insert_with(Vec::new)
            .extend(iter);
        self
    }
}

/// Core profile: what to run for the managed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreProfile {
    #[serde(alias = "sbBin")]
    pub core_bin: PathBuf,
    #[serde(default, alias = "sbConfig")]
    pub core_config: Option<PathBuf>,
    #[serde(default = "default_core_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CoreProfile {
    /// Read the profile, distinguishing a missing file from an unparsable one
    pub async fn load(path: &Path) -> Result<Self, SupervisorError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| read_error(path, e))?;
        serde_json::from_str(&content).map_err(|e| SupervisorError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Turn the profile into a spawnable spec, checking referenced files exist
    pub async fn into_spec(self, base_dir: &Path) -> Result<ProcessSpec, SupervisorError> {
        let program = locate_binary(&base_dir.join(&self.core_bin)).await?;

        let config_path = match &self.core_config {
            Some(config) => {
                let config = base_dir.join(config);
                if !exists(&config).await {
                    return Err(SupervisorError::ConfigMissing(config));
                }
                Some(config)
            }
            None => None,
        };

        let args = self
            .args
            .iter()
            .map(|arg| match &config_path {
                Some(config) => arg.replace(CONFIG_PLACEHOLDER, &config.to_string_lossy()),
                None => arg.clone(),
            })
            .collect::<Vec<_>>();

        if config_path.is_none() && args.iter().any(|a| a.contains(CONFIG_PLACEHOLDER)) {
            return Err(SupervisorError::ConfigInvalid {
                path: self.core_bin.clone(),
                reason: format!("arguments use {CONFIG_PLACEHOLDER} but coreConfig is not set"),
            });
        }

        let working_dir = match self.working_dir {
            Some(dir) => base_dir.join(dir),
            None => base_dir.to_path_buf(),
        };

        let mut spec = ProcessSpec::new(program).args(args);
        if !working_dir.as_os_str().is_empty() {
            spec = spec.working_dir(working_dir);
        }
        spec.env = self.env;
        Ok(spec)
    }
}

/// Where the managed process spec comes from on each start attempt
#[async_trait]
pub trait SpecResolver: Send + Sync {
    async fn resolve(&self) -> Result<ProcessSpec, SupervisorError>;
}

/// Resolves the spec from a core profile file
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    profile: PathBuf,
    base_dir: PathBuf,
}

impl ProfileResolver {
    pub fn new(profile: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile: profile.into(),
            base_dir: base_dir.into(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(config.profile_path(), config.base_dir.clone())
    }
}

#[async_trait]
impl SpecResolver for ProfileResolver {
    async fn resolve(&self) -> Result<ProcessSpec, SupervisorError> {
        let profile = CoreProfile::load(&self.profile).await?;
        profile.into_spec(&self.base_dir).await
    }
}

/// A fixed spec still has its program checked on every start
#[async_trait]
impl SpecResolver for ProcessSpec {
    async fn resolve(&self) -> Result<ProcessSpec, SupervisorError> {
        let program = locate_binary(&self.program).await?;
        Ok(ProcessSpec {
            program,
            ..self.clone()
        })
    }
}

async fn locate_binary(path: &Path) -> Result<PathBuf, SupervisorError> {
    if exists(path).await {
        return Ok(path.to_path_buf());
    }

    #[cfg(windows)]
    if path.extension().is_none() {
        let exe = path.with_extension("exe");
        if exists(&exe).await {
            return Ok(exe);
        }
    }

    Err(SupervisorError::BinaryMissing(path.to_path_buf()))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn read_error(path: &Path, error: io::Error) -> SupervisorError {
    if error.kind() == io::ErrorKind::NotFound {
        SupervisorError::ConfigMissing(path.to_path_buf())
    } else {
        SupervisorError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: format!("unreadable: {error}"),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_core_args() -> Vec<String> {
    vec!["run".into(), "-c".into(), CONFIG_PLACEHOLDER.into()]
}
