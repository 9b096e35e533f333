//! Configuration loading

use anyhow::{Context, Result, bail};
use filecache_core::{EvictionPolicy, TypeDefinition, validate_type_name};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Types defined at startup when missing
    #[serde(default)]
    pub types: Vec<TypeDefinition>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_total_cache_space")]
    pub total_cache_space: u64,
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
    #[serde(default = "default_download_dir")]
    pub default_download_dir: PathBuf,
    #[serde(default = "default_copy_timeout_secs")]
    pub copy_timeout_secs: u64,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            total_cache_space: default_total_cache_space(),
            eviction_policy: EvictionPolicy::default(),
            default_download_dir: default_download_dir(),
            copy_timeout_secs: default_copy_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Settings handed to the cache manager
    pub fn manager_config(&self) -> filecache_core::CacheConfig {
        filecache_core::CacheConfig {
            total_cache_space: self.total_cache_space,
            eviction_policy: self.eviction_policy,
            default_download_dir: self.default_download_dir.clone(),
            copy_timeout: Duration::from_secs(self.copy_timeout_secs),
        }
    }
}

/// Bus identity of the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5151
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data/filecache")
}

fn default_total_cache_space() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GB
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./data/downloads")
}

fn default_copy_timeout_secs() -> u64 {
    300
}

fn default_maintenance_interval_secs() -> u64 {
    15
}

fn default_service_name() -> String {
    "com.palm.filecache".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from file, falling back to defaults if it is missing
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        // Check if config file exists
        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        config.validate()?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Reject settings the service cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() {
            bail!("service.name must not be empty");
        }

        if self.cache.copy_timeout_secs == 0 {
            bail!("cache.copy_timeout_secs must be positive");
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            bail!(
                "logging.format must be \"pretty\" or \"json\", got \"{}\"",
                self.logging.format
            );
        }

        let mut claimed = 0u64;
        for definition in &self.types {
            validate_type_name(&definition.name)
                .with_context(|| format!("Invalid type in config: {}", definition.name))?;
            if definition.lo_watermark > definition.hi_watermark {
                bail!(
                    "type {}: lo_watermark {} exceeds hi_watermark {}",
                    definition.name,
                    definition.lo_watermark,
                    definition.hi_watermark
                );
            }
            claimed = claimed.saturating_add(definition.lo_watermark);
        }
        if claimed > self.cache.total_cache_space {
            bail!(
                "configured types claim {} bytes, more than total_cache_space {}",
                claimed,
                self.cache.total_cache_space
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            types: Vec::new(),
        }
    }
}
