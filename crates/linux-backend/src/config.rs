use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::Ipv4Subnet;

pub(crate) const DEFAULT_POOL_BASE: Ipv4Addr = Ipv4Addr::new(10, 254, 0, 0);
pub(crate) const DEFAULT_POOL_PREFIX: u8 = 22;
pub(crate) const DEFAULT_BRIDGE_PREFIX: &str = "w";
pub(crate) const DEFAULT_SPAWN_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_KILL_RETRIES: u32 = 10;
pub(crate) const DEFAULT_KILL_BACKOFF_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml_ng::Error,
    },

    #[error("serialize config: {0}")]
    Serialize(serde_yaml_ng::Error),

    #[error("write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Directory holding one subdirectory per container.
    pub depot_dir: PathBuf,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Range carved into /30s for dynamic allocation.
    pub pool: Ipv4Subnet,
    pub bridge_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            bridge_prefix: DEFAULT_BRIDGE_PREFIX.to_string(),
        }
    }
}

fn default_pool() -> Ipv4Subnet {
    Ipv4Subnet::new(DEFAULT_POOL_BASE, DEFAULT_POOL_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Remove parent image layers once their last child is gone.
    pub cleanup_images: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            cleanup_images: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub spawn_timeout_ms: u64,
    /// Attempts at reading a namespaced process's PID file.
    pub kill_retries: u32,
    pub kill_backoff_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: DEFAULT_SPAWN_TIMEOUT_MS,
            kill_retries: DEFAULT_KILL_RETRIES,
            kill_backoff_ms: DEFAULT_KILL_BACKOFF_MS,
        }
    }
}

impl ProcessConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn kill_backoff(&self) -> Duration {
        Duration::from_millis(self.kill_backoff_ms)
    }
}

/// Longest bridge prefix that still leaves room for a unique suffix.
const MAX_BRIDGE_PREFIX_LEN: usize = 7;
/// Smallest useful pool holds one /30.
const MAX_POOL_PREFIX: u8 = 30;
/// Every /30 of the pool is queued up front, so the range stays bounded.
const MIN_POOL_PREFIX: u8 = 8;

/// Load and validate a backend config from a YAML file.
///
/// A relative `depot_dir` is resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ConfigResult<BackendConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let mut config: BackendConfig =
        serde_yaml_ng::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Write `config` as YAML to `path`, creating parent directories.
pub async fn generate(config: &BackendConfig, path: &Path) -> ConfigResult<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
    }
    let content = serde_yaml_ng::to_string(config).map_err(ConfigError::Serialize)?;
    tokio::fs::write(path, content)
        .await
        .map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
}

impl BackendConfig {
    pub fn new(depot_dir: PathBuf) -> Self {
        Self {
            depot_dir,
            network: NetworkConfig::default(),
            graph: GraphConfig::default(),
            process: ProcessConfig::default(),
        }
    }

    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.depot_dir.is_relative() {
            self.depot_dir = config_dir.join(&self.depot_dir);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.network.pool.prefix() > MAX_POOL_PREFIX {
            return Err(ConfigError::Invalid(format!(
                "network.pool {} is smaller than a /{MAX_POOL_PREFIX}",
                self.network.pool
            )));
        }
        if self.network.pool.prefix() < MIN_POOL_PREFIX {
            return Err(ConfigError::Invalid(format!(
                "network.pool {} is larger than a /{MIN_POOL_PREFIX}",
                self.network.pool
            )));
        }
        let prefix_len = self.network.bridge_prefix.len();
        if prefix_len == 0 || prefix_len > MAX_BRIDGE_PREFIX_LEN {
            return Err(ConfigError::Invalid(format!(
                "network.bridge_prefix must be 1..={MAX_BRIDGE_PREFIX_LEN} characters"
            )));
        }
        if self.process.spawn_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "process.spawn_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        tokio::fs::write(&path, "depot_dir: depot\n").await.unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config.depot_dir, dir.path().join("depot"));
        assert_eq!(config.network.pool.to_string(), "10.254.0.0/22");
        assert_eq!(config.network.bridge_prefix, "w");
        assert!(config.graph.cleanup_images);
        assert_eq!(config.process.spawn_timeout(), Duration::from_secs(10));
        assert_eq!(config.process.kill_retries, 10);
        assert_eq!(config.process.kill_backoff(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        let yaml = "\
depot_dir: /var/lib/garden/depot
network:
  pool: 10.2.3.0/29
  bridge_prefix: gdn
graph:
  cleanup_images: false
process:
  spawn_timeout_ms: 500
  kill_retries: 3
  kill_backoff_ms: 20
";
        tokio::fs::write(&path, yaml).await.unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config.depot_dir, PathBuf::from("/var/lib/garden/depot"));
        assert_eq!(config.network.pool.to_string(), "10.2.3.0/29");
        assert_eq!(config.network.bridge_prefix, "gdn");
        assert!(!config.graph.cleanup_images);
        assert_eq!(config.process.spawn_timeout(), Duration::from_millis(500));
        assert_eq!(config.process.kill_retries, 3);
    }

    #[tokio::test]
    async fn load_rejects_bad_cidr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        tokio::fs::write(&path, "depot_dir: /d\nnetwork:\n  pool: 10.0.0.0\n")
            .await
            .unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
        assert!(err.to_string().contains("backend.yaml"), "{err}");
    }

    #[tokio::test]
    async fn load_rejects_tiny_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.yaml");
        tokio::fs::write(&path, "depot_dir: /d\nnetwork:\n  pool: 10.0.0.0/31\n")
            .await
            .unwrap();

        assert!(matches!(
            load(&path).await.unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.yaml")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn validate_pool_size_bounds() {
        let mut config = BackendConfig::new(PathBuf::from("/d"));
        config.network.pool = "10.0.0.0/31".parse().unwrap();
        assert!(config.validate().is_err());
        config.network.pool = "0.0.0.0/0".parse().unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("larger than a /8"), "{err}");
        config.network.pool = "10.0.0.0/8".parse().unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn validate_bridge_prefix_length() {
        let mut config = BackendConfig::new(PathBuf::from("/d"));
        config.network.bridge_prefix = String::new();
        assert!(config.validate().is_err());
        config.network.bridge_prefix = "toolongpfx".into();
        assert!(config.validate().is_err());
        config.network.bridge_prefix = "garden".into();
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn generate_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/backend.yaml");
        let mut config = BackendConfig::new(dir.path().join("depot"));
        config.process.kill_retries = 4;

        generate(&config, &path).await.unwrap();
        assert_eq!(load(&path).await.unwrap(), config);
    }
}
