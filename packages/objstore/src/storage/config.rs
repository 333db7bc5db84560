// Object store configuration management
use crate::dataset::DirRole;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Environment variable pointing at a configuration file
pub const CONFIG_ENV_VAR: &str = "OBJSTORE_CONFIG";

/// Application configuration: the store tree plus where assignments live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// SQLite database recording distributed backend assignments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignments_db: Option<PathBuf>,

    pub object_store: BackendConfig,
}

/// One backend, selected by its `type` key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Disk(DiskConfig),
    S3(S3Config),
    AzureBlob(AzureBlobConfig),
    Cloud(CloudConfig),
    Pithos(PithosConfig),
    Hierarchical(CompositeConfig),
    Distributed(CompositeConfig),
}

impl BackendConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            BackendConfig::Disk(_) => "disk",
            BackendConfig::S3(_) => "s3",
            BackendConfig::AzureBlob(_) => "azure_blob",
            BackendConfig::Cloud(_) => "cloud",
            BackendConfig::Pithos(_) => "pithos",
            BackendConfig::Hierarchical(_) => "hierarchical",
            BackendConfig::Distributed(_) => "distributed",
        }
    }

    /// Parse a bare backend tree (no `[object_store]` wrapper)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse object store configuration")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtraDirConfig {
    #[serde(rename = "type")]
    pub role: DirRole,
    pub path: PathBuf,
}

/// Pairs suitable for `PathResolver::new`
pub fn extra_dir_pairs(dirs: &[ExtraDirConfig]) -> impl Iterator<Item = (DirRole, PathBuf)> + '_ {
    dirs.iter().map(|dir| (dir.role, dir.path.clone()))
}

/// Local directory tree
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskConfig {
    /// Main files path; required, checked when the store is built
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dirs: Vec<ExtraDirConfig>,
}

/// Staging cache in front of a remote backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Byte budget; unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("database/object_store_cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessKeyAuth {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketConfig {
    pub name: String,

    #[serde(default)]
    pub use_reduced_redundancy: bool,
}

/// Endpoint settings for S3-style services
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub is_secure: bool,

    #[serde(default = "default_conn_path")]
    pub conn_path: String,

    #[serde(default = "default_true")]
    pub multipart: bool,

    /// Uploads above this many bytes go through multipart upload
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
}

fn default_port() -> u16 {
    6000
}

fn default_true() -> bool {
    true
}

fn default_conn_path() -> String {
    "/".to_string()
}

fn default_multipart_threshold() -> u64 {
    100 * 1024 * 1024
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            is_secure: true,
            conn_path: default_conn_path(),
            multipart: true,
            multipart_threshold: default_multipart_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct S3Config {
    pub auth: AccessKeyAuth,
    pub bucket: BucketConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dirs: Vec<ExtraDirConfig>,
}

/// Provider-neutral cloud storage; S3-shaped settings plus a provider name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    pub auth: AccessKeyAuth,
    pub bucket: BucketConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dirs: Vec<ExtraDirConfig>,
}

fn default_provider() -> String {
    "aws".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzureAuth {
    pub account_name: String,
    pub account_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzureContainer {
    pub name: String,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
}

fn default_max_chunk_size() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzureBlobConfig {
    pub auth: AzureAuth,
    pub container: AzureContainer,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dirs: Vec<ExtraDirConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PithosAuth {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PithosContainer {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PithosConfig {
    pub auth: PithosAuth,
    pub container: PithosContainer,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dirs: Vec<ExtraDirConfig>,
}

/// Child backends of a hierarchical or distributed store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompositeConfig {
    /// Fill limit applied to children without their own `max_percent_full`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_max_percent_full: Option<f64>,

    pub backends: Vec<BackendEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendEntry {
    pub id: String,

    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Search position; the entry's list position when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_percent_full: Option<f64>,

    #[serde(flatten)]
    pub backend: BackendConfig,
}

fn default_weight() -> u32 {
    1
}

impl AppConfig {
    /// Load configuration with the following priority:
    /// 1. OBJSTORE_CONFIG environment variable (path to a config file)
    /// 2. config.toml file
    /// 3. Default: disk store under ~/.cache/objstore
    pub async fn load() -> Result<Self> {
        // Priority 1: Environment variable
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(Path::new(&env_path)).await;
        }

        // Priority 2: Config file
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                return Self::from_file(&config_path).await;
            }
        }

        // Priority 3: Default
        Ok(Self::default())
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid object store configuration")
    }

    /// Get the config file path (~/.config/objstore/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("objstore").join("config.toml"))
    }

    /// Save configuration to config file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path()
            .context("Failed to determine config directory")?;
        self.save_to(&config_path).await
    }

    pub async fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directory
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the assignment database path
    pub fn assignments_db_path(&self) -> PathBuf {
        self.assignments_db.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("objstore")
                .join("assignments.db")
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("objstore");

        Self {
            assignments_db: None,
            object_store: BackendConfig::Disk(DiskConfig {
                files_dir: Some(root.join("files")),
                extra_dirs: vec![
                    ExtraDirConfig {
                        role: DirRole::Temp,
                        path: root.join("tmp"),
                    },
                    ExtraDirConfig {
                        role: DirRole::JobWork,
                        path: root.join("job_working_directory"),
                    },
                ],
            }),
        }
    }
}
