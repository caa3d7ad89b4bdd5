//! Configuration loader for the runbox YAML file
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working local-only setup. Relative storage paths are resolved against the
//! directory holding the configuration file.

use crate::errors::ConfigError;
use crate::sandbox::ContainerOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunboxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub invocation: InvocationConfig,
    #[serde(default = "default_converters")]
    pub converters: Vec<String>,
}

impl Default for RunboxConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            sandbox: SandboxConfig::default(),
            invocation: InvocationConfig::default(),
            converters: default_converters(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Per-algorithm installed files live in `<uploads_dir>/<algorithm id>`.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Parent of every per-invocation temporary directory.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// YAML list of algorithm specs.
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            temp_dir: default_temp_dir(),
            catalog: default_catalog(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_user")]
    pub user: Option<String>,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: Option<u64>,
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub binds: Vec<String>,
    /// URL workers POST their address to once listening.
    #[serde(default)]
    pub register_url: Option<String>,
    #[serde(default = "default_labels")]
    pub labels: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: default_pool_size(),
            image: default_image(),
            user: default_user(),
            memory_limit_mb: default_memory_limit_mb(),
            worker_port: default_worker_port(),
            network: None,
            binds: Vec::new(),
            register_url: None,
            labels: default_labels(),
        }
    }
}

impl SandboxConfig {
    pub fn container_options(&self) -> ContainerOptions {
        ContainerOptions {
            image: self.image.clone(),
            user: self.user.clone(),
            memory_limit_mb: self.memory_limit_mb,
            worker_port: self.worker_port,
            network: self.network.clone(),
            binds: self.binds.clone(),
            register_url: self.register_url.clone(),
            labels: self.labels.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl InvocationConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_catalog() -> PathBuf {
    PathBuf::from("algorithms.yaml")
}

fn default_pool_size() -> usize {
    1
}

fn default_image() -> String {
    "runbox-worker".to_string()
}

fn default_user() -> Option<String> {
    Some("sandboxuser".to_string())
}

fn default_memory_limit_mb() -> Option<u64> {
    Some(100)
}

fn default_worker_port() -> u16 {
    3000
}

fn default_labels() -> HashMap<String, String> {
    HashMap::from([("__runbox_sandbox".to_string(), "1".to_string())])
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_converters() -> Vec<String> {
    ["json", "rr", "csv", "xml"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<RunboxConfig, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_str(&content, path.parent())
    }

    pub fn from_str(content: &str, base_dir: Option<&Path>) -> Result<RunboxConfig, ConfigError> {
        let mut config: RunboxConfig = if content.trim().is_empty() {
            RunboxConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        if let Some(base) = base_dir {
            for path in [
                &mut config.storage.uploads_dir,
                &mut config.storage.temp_dir,
                &mut config.storage.catalog,
            ] {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &RunboxConfig) -> Result<(), ConfigError> {
        if config.sandbox.enabled && config.sandbox.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.pool_size must be at least 1".to_string(),
            ));
        }
        if config.invocation.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "invocation.default_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConfigLoader::from_str("", None).unwrap();
        assert_eq!(config, RunboxConfig::default());
        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.invocation.default_timeout(), Duration::from_secs(10));
        assert!(!config.sandbox.enabled);
        assert_eq!(config.converters, vec!["json", "rr", "csv", "xml"]);
    }

    #[test]
    fn test_partial_config_and_relative_paths() {
        let yaml = r#"
storage:
  uploads_dir: data/uploads
  temp_dir: /var/tmp/runbox
sandbox:
  enabled: true
  pool_size: 3
  network: runbox
converters: [json]
"#;
        let config = ConfigLoader::from_str(yaml, Some(Path::new("/etc/runbox"))).unwrap();

        assert_eq!(config.storage.uploads_dir, PathBuf::from("/etc/runbox/data/uploads"));
        assert_eq!(config.storage.temp_dir, PathBuf::from("/var/tmp/runbox"));
        assert_eq!(config.storage.catalog, PathBuf::from("/etc/runbox/algorithms.yaml"));
        assert_eq!(config.sandbox.pool_size, 3);
        assert_eq!(config.sandbox.image, "runbox-worker");
        assert_eq!(config.converters, vec!["json".to_string()]);

        let options = config.sandbox.container_options();
        assert_eq!(options.network.as_deref(), Some("runbox"));
        assert_eq!(options.worker_port, 3000);
    }

    #[test]
    fn test_rejects_empty_pool() {
        let yaml = "sandbox:\n  enabled: true\n  pool_size: 0\n";
        assert!(matches!(
            ConfigLoader::from_str(yaml, None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        assert!(matches!(
            ConfigLoader::from_str("server: [", None),
            Err(ConfigError::Parse(_))
        ));
    }
}
