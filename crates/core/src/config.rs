use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "PDF2WORD_DATA_DIR";
pub const DEFAULT_MAX_FILE_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub environment: EnvironmentConfig,
    pub converter: ConverterConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Scratch directory holding one sub-directory per in-flight request.
    pub work_dir: PathBuf,
    /// Serve the client page from disk instead of the embedded copy.
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub interpreter: String,
    pub min_version: String,
    pub library: String,
    pub check_on_request: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConverterConfig {
    pub script: PathBuf,
    pub timeout_secs: u64,
    pub output_wait_secs: u64,
    pub output_poll_interval_ms: u64,
    /// 0 means one slot per available CPU.
    pub max_parallel_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_file_bytes: u64,
    pub max_files: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("data/work"),
            static_dir: None,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            min_version: "3.6".to_string(),
            library: "pdf2docx".to_string(),
            check_on_request: true,
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("scripts/convert.py"),
            timeout_secs: 120,
            output_wait_secs: 10,
            output_poll_interval_ms: 250,
            max_parallel_jobs: 0,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_files: 20,
        }
    }
}

impl ConverterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn output_wait(&self) -> Duration {
        Duration::from_secs(self.output_wait_secs)
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_interval_ms.max(10))
    }

    pub fn effective_parallelism(&self) -> usize {
        if self.max_parallel_jobs > 0 {
            return self.max_parallel_jobs;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl LimitsConfig {
    /// Upper bound for a whole multipart body: every file at its cap plus
    /// room for part headers.
    pub fn request_body_limit(&self) -> usize {
        let per_file = self.max_file_bytes.saturating_add(64 * 1024);
        let total = per_file.saturating_mul(self.max_files.max(1) as u64);
        usize::try_from(total).unwrap_or(usize::MAX)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Rewrites every relative path in the config against `base`, so jobs
    /// always hand absolute paths to the converter.
    pub fn with_paths_resolved(mut self, base: &Path) -> Self {
        self.paths.work_dir = resolve_relative_to(base, &self.paths.work_dir);
        self.paths.static_dir = self
            .paths
            .static_dir
            .map(|dir| resolve_relative_to(base, &dir));
        self.converter.script = resolve_relative_to(base, &self.converter.script);
        self
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. PDF2WORD_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml if none
/// exists yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Port precedence: CLI flag, then `PORT`, then the config file.
pub fn resolve_port(cli_port: Option<u16>, port_env: Option<&str>, config: &ServerConfig) -> u16 {
    cli_port
        .or_else(|| port_env.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config.port)
}
