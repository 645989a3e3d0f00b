use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LEDGERVIEW_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectorConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Defaults applied to every handler.
    #[serde(default)]
    pub handlers: HandlerConfig,
    /// Per-projection overrides keyed by projection name.
    #[serde(default)]
    pub projections: BTreeMap<String, HandlerOverrides>,
}

impl ProjectorConfig {
    /// Effective handler settings for one projection.
    #[must_use]
    pub fn handler(&self, projection: &str) -> HandlerConfig {
        self.projections
            .get(projection)
            .map_or_else(|| self.handlers.clone(), |o| o.apply(&self.handlers))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_projections_path")]
    pub projections_path: PathBuf,
    #[serde(default = "default_eventstore_path")]
    pub eventstore_path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            projections_path: default_projections_path(),
            eventstore_path: default_eventstore_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Tuning of one projection handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Maximum events fetched and applied per batch.
    #[serde(default = "default_bulk_limit")]
    pub bulk_limit: usize,
    /// Poll interval once caught up.
    #[serde(default = "default_requeue_every_ms")]
    pub requeue_every_ms: u64,
    /// First backoff step after a retryable failure.
    #[serde(default = "default_retry_failed_after_ms")]
    pub retry_failed_after_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Upper bound for one batch transaction.
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    /// How long a `(projection, instance)` lock stays valid without renewal.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// How long to wait for another worker's lock before giving up the batch.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Failures of one event before it is skipped. `0` never skips.
    #[serde(default = "default_max_failure_count")]
    pub max_failure_count: u32,
    /// Only consider tenants with events in this window.
    #[serde(default)]
    pub instance_lookback_ms: Option<u64>,
}

impl HandlerConfig {
    #[must_use]
    pub const fn requeue_every(&self) -> Duration {
        Duration::from_millis(self.requeue_every_ms)
    }

    #[must_use]
    pub const fn retry_failed_after(&self) -> Duration {
        Duration::from_millis(self.retry_failed_after_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub const fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    #[must_use]
    pub const fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    #[must_use]
    pub fn instance_lookback(&self) -> Option<Duration> {
        self.instance_lookback_ms.map(Duration::from_millis)
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            bulk_limit: default_bulk_limit(),
            requeue_every_ms: default_requeue_every_ms(),
            retry_failed_after_ms: default_retry_failed_after_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            max_failure_count: default_max_failure_count(),
            instance_lookback_ms: None,
        }
    }
}

/// Partial [`HandlerConfig`]; unset fields fall back to `[handlers]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOverrides {
    pub bulk_limit: Option<usize>,
    pub requeue_every_ms: Option<u64>,
    pub retry_failed_after_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub transaction_timeout_ms: Option<u64>,
    pub lock_ttl_ms: Option<u64>,
    pub lock_wait_ms: Option<u64>,
    pub max_failure_count: Option<u32>,
    pub instance_lookback_ms: Option<u64>,
}

impl HandlerOverrides {
    #[must_use]
    pub fn apply(&self, base: &HandlerConfig) -> HandlerConfig {
        HandlerConfig {
            bulk_limit: self.bulk_limit.unwrap_or(base.bulk_limit),
            requeue_every_ms: self.requeue_every_ms.unwrap_or(base.requeue_every_ms),
            retry_failed_after_ms: self
                .retry_failed_after_ms
                .unwrap_or(base.retry_failed_after_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(base.max_backoff_ms),
            transaction_timeout_ms: self
                .transaction_timeout_ms
                .unwrap_or(base.transaction_timeout_ms),
            lock_ttl_ms: self.lock_ttl_ms.unwrap_or(base.lock_ttl_ms),
            lock_wait_ms: self.lock_wait_ms.unwrap_or(base.lock_wait_ms),
            max_failure_count: self.max_failure_count.unwrap_or(base.max_failure_count),
            instance_lookback_ms: self.instance_lookback_ms.or(base.instance_lookback_ms),
        }
    }
}

/// Pick the config file: explicit path, then `$LEDGERVIEW_CONFIG`, then
/// `<config dir>/ledgerview/config.toml` if it exists.
#[must_use]
pub fn resolve_config_path(
    explicit: Option<&Path>,
    env_value: Option<String>,
    config_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return Some(PathBuf::from(value));
    }
    config_dir
        .map(|dir| dir.join("ledgerview/config.toml"))
        .filter(|path| path.exists())
}

/// Load the projector config, falling back to defaults when no file is found.
///
/// # Errors
///
/// Returns an error if a selected file cannot be read or parsed.
pub fn load_config(explicit: Option<&Path>) -> Result<ProjectorConfig> {
    let Some(path) = resolve_config_path(
        explicit,
        std::env::var(CONFIG_ENV).ok(),
        dirs::config_dir(),
    ) else {
        return Ok(ProjectorConfig::default());
    };
    load_config_file(&path)
}

/// Parse one config file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML.
pub fn load_config_file(path: &Path) -> Result<ProjectorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ProjectorConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn default_projections_path() -> PathBuf {
    PathBuf::from("ledgerview/projections.sqlite3")
}

fn default_eventstore_path() -> PathBuf {
    PathBuf::from("ledgerview/events.sqlite3")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_bulk_limit() -> usize {
    200
}

const fn default_requeue_every_ms() -> u64 {
    1_000
}

const fn default_retry_failed_after_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_transaction_timeout_ms() -> u64 {
    30_000
}

const fn default_lock_ttl_ms() -> u64 {
    60_000
}

const fn default_lock_wait_ms() -> u64 {
    5_000
}

const fn default_max_failure_count() -> u32 {
    5
}
