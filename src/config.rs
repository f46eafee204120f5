use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

const WORKSPACE_ROOT_ENV: &str = "LABRUNNER_WORKSPACE_ROOT";
const SESSION_ROOT_ENV: &str = "LABRUNNER_SESSION_ROOT";

#[derive(Parser)]
#[command(name = "labrunner", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;
        config.storage.apply_env_overrides();
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub toolchain: ToolchainConfig,
    pub retry: RetryConfig,
    pub installer: InstallerConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable per-owner, per-course projects live here
    pub workspace_root: Option<PathBuf>,
    /// Scratch space for per-invocation session copies
    pub session_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub ephemeral_owner_prefixes: Vec<String>,
    pub session_max_age_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            session_root: None,
            database_path: None,
            ephemeral_owner_prefixes: vec!["guest".to_string(), "anon".to_string()],
            session_max_age_secs: 600,
        }
    }
}

impl StorageConfig {
    /// Environment variables win over the file so deployments can bind the
    /// two roots to different volumes.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(WORKSPACE_ROOT_ENV) {
            self.workspace_root = Some(PathBuf::from(root));
        }
        if let Ok(root) = std::env::var(SESSION_ROOT_ENV) {
            self.session_root = Some(PathBuf::from(root));
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| project_dir(|d| d.data_local_dir().join("workspaces")))
    }

    pub fn session_root(&self) -> PathBuf {
        self.session_root
            .clone()
            .unwrap_or_else(|| project_dir(|d| d.cache_dir().join("sessions")))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| project_dir(|d| d.data_local_dir().join("labrunner.sqlite3")))
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}

fn project_dir(f: impl FnOnce(&directories::ProjectDirs) -> PathBuf) -> PathBuf {
    match directories::ProjectDirs::from("", "", "labrunner") {
        Some(dirs) => f(&dirs),
        None => std::env::temp_dir().join("labrunner"),
    }
}

/// Describes how to drive the external build/test binary
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ToolchainConfig {
    pub binary: String,
    pub build_args: Vec<String>,
    pub test_args: Vec<String>,
    pub force_flag: String,
    pub json_flag: Option<String>,
    pub version_flag: Option<String>,
    pub match_path_flag: String,
    pub test_file_suffix: String,
    pub manifest_name: String,
    pub default_version: Option<String>,
    pub optimizer: bool,
    pub optimizer_runs: u32,
    pub build_timeout_secs: u64,
    pub test_timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            binary: "forge".to_string(),
            build_args: vec!["build".to_string()],
            test_args: vec!["test".to_string(), "-vv".to_string()],
            force_flag: "--force".to_string(),
            json_flag: Some("--json".to_string()),
            version_flag: Some("--use".to_string()),
            match_path_flag: "--match-path".to_string(),
            test_file_suffix: ".t.sol".to_string(),
            manifest_name: "foundry.toml".to_string(),
            default_version: None,
            optimizer: true,
            optimizer_runs: 200,
            build_timeout_secs: 60,
            test_timeout_secs: 60,
        }
    }
}

impl ToolchainConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Delay before reconnect attempt `attempt` (0-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct InstallerConfig {
    pub git_binary: String,
    pub clone_timeout_secs: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            git_binary: "git".to_string(),
            clone_timeout_secs: 120,
        }
    }
}

impl InstallerConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }
}
