use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for the auth handshake. Empty accepts any client.
    #[serde(default)]
    pub password: String,
}

fn default_host() -> String {
    common::DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    common::DEFAULT_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory tree to back up.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// Root of the directory-backed blob store.
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,
    /// Prefix joined onto each file's relative path to form the blob name.
    #[serde(default)]
    pub blob_prefix: String,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(common::DEFAULT_BACKUP_DIR)
}

fn default_target_dir() -> PathBuf {
    PathBuf::from(common::DEFAULT_BLOB_DIR)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            target_dir: default_target_dir(),
            blob_prefix: String::new(),
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(common::DEFAULT_DB_PATH)
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file in addition to stdout; stdout only when unset.
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}
