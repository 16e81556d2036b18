//! Runtime configuration loaded from `config.toml`.
//!
//! Every field has a default, so an absent file or an empty table yields a
//! working setup. Intervals are expressed in milliseconds to match the
//! timing constants of the browser host.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Path this config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
    pub storage: StorageConfig,
    pub presence: PresenceConfig,
    pub limits: LimitsConfig,
    pub encryption: EncryptionConfig,
    pub logging: LoggingConfig,
}

// ── Sections ────────────────────────────────────────────────────

/// Durable storage location and budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database (default: platform data dir).
    pub data_dir: Option<PathBuf>,
    /// Database file name inside `data_dir`.
    pub database_file: String,
    /// Byte budget for in-memory stores.
    pub quota_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            database_file: "gartenplaner.db".into(),
            quota_bytes: crate::storage::DEFAULT_QUOTA_BYTES,
        }
    }
}

/// Presence heartbeat timing and transport selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// A peer silent for longer than this is dropped from the roster.
    pub peer_timeout_ms: u64,
    /// Name of the same-origin broadcast channel.
    pub channel_name: String,
    /// Use the broadcast channel when one is available. When false the
    /// storage transport is used directly.
    pub prefer_channel: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            cleanup_interval_ms: 10_000,
            peer_timeout_ms: 15_000,
            channel_name: "gartenplaner_sync".into(),
            prefer_channel: true,
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// One sliding-window quota.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl QuotaConfig {
    pub const fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }
}

/// Admission control quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// How often expired events and blocks are pruned.
    pub cleanup_interval_ms: u64,
    /// Quota per category name. Entries here are merged over the defaults.
    #[serde(deserialize_with = "merge_with_default_quotas")]
    pub categories: BTreeMap<String, QuotaConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 30_000,
            categories: default_quotas(),
        }
    }
}

impl LimitsConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Built-in quotas for the planner's categories.
pub fn default_quotas() -> BTreeMap<String, QuotaConfig> {
    [
        ("storage", QuotaConfig::new(60, 60_000)),
        ("taskCreate", QuotaConfig::new(10, 60_000)),
        ("taskEdit", QuotaConfig::new(30, 60_000)),
        ("taskDelete", QuotaConfig::new(20, 60_000)),
        ("search", QuotaConfig::new(100, 60_000)),
        ("filter", QuotaConfig::new(100, 60_000)),
        ("export", QuotaConfig::new(5, 300_000)),
        ("api", QuotaConfig::new(30, 60_000)),
    ]
    .into_iter()
    .map(|(name, quota)| (name.to_string(), quota))
    .collect()
}

fn merge_with_default_quotas<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, QuotaConfig>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = BTreeMap::<String, QuotaConfig>::deserialize(deserializer)?;
    let mut merged = default_quotas();
    merged.extend(overrides);
    Ok(merged)
}

/// Encryption at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// When false every seal falls back to plaintext.
    pub enabled: bool,
    /// PBKDF2-HMAC-SHA256 rounds for passphrase-wrapped exports.
    pub pbkdf2_iterations: u32,
    pub min_passphrase_len: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pbkdf2_iterations: 100_000,
            min_passphrase_len: 8,
        }
    }
}

/// Console and persisted logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub ansi: bool,
    /// Persist events into `_gartenplaner_logs`.
    pub persist: bool,
    /// Minimum level written to storage.
    pub persist_level: String,
    pub max_entries: usize,
    /// Non-error entries older than this are dropped by cleanup.
    pub retention_hours: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            ansi: true,
            persist: true,
            persist_level: "warn".into(),
            max_entries: 500,
            retention_hours: 24,
            cleanup_interval_secs: 300,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────

impl Config {
    /// Platform config file location (`<config dir>/gartenplaner/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "gartenplaner")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from [`Config::default_path`] when `None`.
    /// A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => {
                    tracing::debug!("No config directory available, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Self::default()
        };
        config.config_path = path;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Directory for the database and other local state.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("", "", "gartenplaner")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not determine a data directory"))
    }

    /// Full path of the SQLite database.
    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(&self.storage.database_file))
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        let presence = &self.presence;
        if presence.heartbeat_interval_ms == 0 || presence.cleanup_interval_ms == 0 {
            anyhow::bail!("presence intervals must be greater than zero");
        }
        if presence.peer_timeout_ms <= presence.heartbeat_interval_ms {
            anyhow::bail!(
                "presence.peer_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                presence.peer_timeout_ms,
                presence.heartbeat_interval_ms
            );
        }
        if presence.channel_name.trim().is_empty() {
            anyhow::bail!("presence.channel_name must not be empty");
        }

        if self.limits.cleanup_interval_ms == 0 {
            anyhow::bail!("limits.cleanup_interval_ms must be greater than zero");
        }
        for (name, quota) in &self.limits.categories {
            if quota.max_requests == 0 || quota.window_ms == 0 {
                anyhow::bail!("limits.categories.{name}: max_requests and window_ms must be greater than zero");
            }
        }

        if self.encryption.pbkdf2_iterations == 0 {
            anyhow::bail!("encryption.pbkdf2_iterations must be greater than zero");
        }
        if self.logging.max_entries == 0 {
            anyhow::bail!("logging.max_entries must be greater than zero");
        }
        if self.storage.quota_bytes == 0 {
            anyhow::bail!("storage.quota_bytes must be greater than zero");
        }
        Ok(())
    }
}
