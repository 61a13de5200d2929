use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use corevisor_core::SupervisorConfig;
use std::path::PathBuf;

use crate::logging::LogOptions;

/// Settings file looked up in the working directory when `--config` is absent
pub const DEFAULT_SETTINGS_FILE: &str = "corevisor.json";

#[derive(Parser, Debug)]
#[command(name = "corevisor")]
#[command(about = "Supervises a proxy core process and the companions it depends on")]
#[command(version)]
pub struct Cli {
    /// Settings file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory relative paths are resolved against [default: executable directory]
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Control surface address
    #[arg(long)]
    pub listen: Option<String>,

    /// Side-channel command file
    #[arg(long)]
    pub command_file: Option<PathBuf>,

    /// Do not serve the control surface
    #[arg(long)]
    pub no_rpc: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Print version and platform information
    Version,
}

impl Cli {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            level: self.log_level.clone(),
            file: self.log_file.clone(),
            json: self.json_logs,
        }
    }

    /// Load settings and apply command-line overrides.
    ///
    /// An explicit `--config` must exist; the default settings file is optional.
    pub fn load_config(&self) -> Result<SupervisorConfig> {
        let base_dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => executable_dir()?,
        };

        let mut config = match &self.config {
            Some(path) => SupervisorConfig::from_file(path)?,
            None => {
                let default = base_dir.join(DEFAULT_SETTINGS_FILE);
                if default.exists() {
                    SupervisorConfig::from_file(&default)?
                } else {
                    SupervisorConfig::default()
                }
            }
        };

        config.base_dir = base_dir;
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(command_file) = &self.command_file {
            config.command_file = Some(command_file.clone());
        }
        if self.no_rpc {
            config.rpc = false;
        }

        config.validate().context("Invalid settings")?;
        Ok(config)
    }
}

/// Directory holding the running executable
fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the corevisor executable")?;
    exe.parent()
        .map(PathBuf::from)
        .context("Executable path has no parent directory")
}

/// Version line followed by the build environment
pub fn version_text() -> String {
    format!(
        "corevisor {}\nplatform: {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Settings path actually used, for logging
pub fn settings_path(cli: &Cli, config: &SupervisorConfig) -> Option<PathBuf> {
    cli.config.clone().or_else(|| {
        let default = config.base_dir.join(DEFAULT_SETTINGS_FILE);
        default.exists().then_some(default)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_subcommand() {
        let cli = Cli::parse_from(["corevisor", "version"]);
        assert_eq!(cli.command, Some(Commands::Version));
        assert!(version_text().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        std::fs::write(&settings, r#"{ "gracePeriodMs": 1500, "listen": "127.0.0.1:6000" }"#)
            .unwrap();

        let cli = Cli::parse_from([
            "corevisor",
            "--config",
            settings.to_str().unwrap(),
            "--dir",
            dir.path().to_str().unwrap(),
            "--listen",
            "127.0.0.1:7000",
            "--no-rpc",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.grace_period_ms, 1500);
        assert_eq!(config.listen, "127.0.0.1:7000");
        assert!(!config.rpc);
        assert_eq!(config.base_dir, dir.path());
        assert_eq!(config.profile_path(), dir.path().join("config.obv"));
    }

    #[test]
    fn test_default_settings_file_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from(["corevisor", "--dir", dir.path().to_str().unwrap()]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.listen, "127.0.0.1:50051");
        assert!(settings_path(&cli, &config).is_none());

        std::fs::write(dir.path().join(DEFAULT_SETTINGS_FILE), r#"{ "rpc": false }"#).unwrap();
        let config = cli.load_config().unwrap();
        assert!(!config.rpc);
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let cli = Cli::parse_from(["corevisor", "--config", missing.to_str().unwrap()]);
        assert!(cli.load_config().is_err());
    }
}
