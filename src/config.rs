// ABOUTME: TOML configuration for the sync engine with defaults for every field
// ABOUTME: Covers batching, retries, health thresholds, webhooks, caches and admin

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};

pub const MAX_BATCH_SIZE: usize = 1000;

fn state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".subscriber-sync"))
        .unwrap_or_else(|| PathBuf::from(".subscriber-sync"))
}

/// Default location of the config file, `~/.subscriber-sync/config.toml`.
pub fn default_config_path() -> PathBuf {
    state_dir().join("config.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub batch_size: usize,
    pub poll_interval_secs: u64,
    pub max_attempts: u32,
    /// 1 keeps a run sequential; more partitions a batch by entity id.
    /// Lanes share the run's task and store calls block it, so lanes only
    /// overlap while a lane awaits webhook delivery.
    pub worker_lanes: usize,
    pub healthy_max_unprocessed: u64,
    pub healthy_max_lag_secs: u64,
    pub stuck_after_secs: u64,
    pub mirror_path: Option<PathBuf>,
    pub webhooks: Vec<WebhookEndpoint>,
    pub caches: Vec<CacheTarget>,
    pub admin: AdminConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: state_dir().join("sync.db"),
            batch_size: 100,
            poll_interval_secs: 30,
            max_attempts: 5,
            worker_lanes: 1,
            healthy_max_unprocessed: 1000,
            healthy_max_lag_secs: 300,
            stuck_after_secs: 600,
            mirror_path: None,
            webhooks: Vec::new(),
            caches: vec![CacheTarget::default()],
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEndpoint {
    pub url: String,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

fn default_webhook_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl WebhookEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: default_webhook_timeout_ms(),
            max_retries: default_webhook_retries(),
            enabled: true,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    /// MSISDN of the record, falling back to its entity id.
    #[default]
    Msisdn,
    EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheTarget {
    pub name: String,
    #[serde(default)]
    pub key_by: CacheKey,
}

impl Default for CacheTarget {
    fn default() -> Self {
        Self {
            name: "subscriptions".to_string(),
            key_by: CacheKey::Msisdn,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    pub listen: String,
    pub token_file: PathBuf,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:50061".to_string(),
            token_file: state_dir().join("admin-token"),
        }
    }
}

impl AdminConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|_| SyncError::Config(format!("invalid admin listen address {}", self.listen)))
    }
}

impl SyncConfig {
    /// Load and validate a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_batch_size(self.batch_size)
            .map_err(|_| SyncError::Config(format!("batch_size {} is outside 1..=1000", self.batch_size)))?;
        if self.poll_interval_secs == 0 {
            return Err(SyncError::Config("poll_interval_secs must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be at least 1".into()));
        }
        if self.worker_lanes == 0 {
            return Err(SyncError::Config("worker_lanes must be at least 1".into()));
        }
        for hook in &self.webhooks {
            let url = Url::parse(&hook.url)
                .map_err(|e| SyncError::Config(format!("invalid webhook url {}: {}", hook.url, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::Config(format!(
                    "webhook url {} must use http or https",
                    hook.url
                )));
            }
            if hook.timeout_ms == 0 {
                return Err(SyncError::Config(format!(
                    "webhook {} needs a positive timeout_ms",
                    hook.url
                )));
            }
        }
        for cache in &self.caches {
            if cache.name.trim().is_empty() {
                return Err(SyncError::Config("cache name must not be empty".into()));
            }
        }
        self.admin.listen_addr()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_secs)
    }
}

/// Batch sizes accepted by a sync run.
pub fn validate_batch_size(batch_size: usize) -> Result<()> {
    if (1..=MAX_BATCH_SIZE).contains(&batch_size) {
        Ok(())
    } else {
        Err(SyncError::InvalidBatchSize(batch_size))
    }
}
