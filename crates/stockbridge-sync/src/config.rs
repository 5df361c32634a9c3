//! # Bridge Configuration
//!
//! Configuration management for the bridge daemon.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STOCKBRIDGE_PRIORITY=warehouse                                     │
//! │     STOCKBRIDGE_STOREFRONT_TOKEN=shpat_...                             │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config <path> / STOCKBRIDGE_CONFIG                               │
//! │     ~/.config/stockbridge/bridge.toml (Linux)                          │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     conflict.priority has NO default and must be set                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/stockbridge/bridge.db"
//!
//! [storefront]
//! base_url = "https://shop.example.com/admin/api/2024-01"
//! access_token = "shpat_..."
//! webhook_secret = "whsec_..."
//! rate_limit = { capacity = 40, refill_per_sec = 2.0 }
//!
//! [warehouse]
//! base_url = "https://api.warehouse.example.com/api/remap/1.2"
//! access_token = "..."
//! webhook_secret = "..."
//!
//! [conflict]
//! priority = "warehouse"
//!
//! [retry]
//! base_delay_ms = 500
//! max_delay_secs = 300
//! max_attempts = 8
//! jitter = 0.2
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use stockbridge_core::{ConflictPolicy, EntityKind, FieldOverride, Platform};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file holding bindings, the outbox and dead letters.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("stockbridge.db")
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
        }
    }
}

// =============================================================================
// Platform Settings
// =============================================================================

/// Token bucket sizing for one platform's API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Burst size.
    #[serde(default = "default_bucket_capacity")]
    pub capacity: u32,

    /// Sustained calls per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

fn default_bucket_capacity() -> u32 {
    40
}

fn default_refill_per_sec() -> f64 {
    2.0
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            capacity: default_bucket_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

/// Connection settings for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// API root, e.g. `https://shop.example.com/admin/api/2024-01`.
    #[serde(default)]
    pub base_url: String,

    /// Bearer token for API calls.
    #[serde(default)]
    pub access_token: String,

    /// Shared secret for webhook HMAC verification.
    #[serde(default)]
    pub webhook_secret: String,

    /// Records requested per list call.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Concurrent apply calls to this platform.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Renamed native columns, applied on top of the built-in tables.
    #[serde(default)]
    pub field_overrides: Vec<FieldOverride>,
}

fn default_page_size() -> u32 {
    50
}

fn default_workers() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for PlatformSettings {
    fn default() -> Self {
        PlatformSettings {
            base_url: String::new(),
            access_token: String::new(),
            webhook_secret: String::new(),
            page_size: default_page_size(),
            workers: default_workers(),
            request_timeout_secs: default_request_timeout(),
            rate_limit: RateLimitSettings::default(),
            field_overrides: Vec::new(),
        }
    }
}

impl PlatformSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self, platform: Platform) -> SyncResult<()> {
        let url = url::Url::parse(&self.base_url).map_err(|e| {
            SyncError::InvalidUrl(format!("{platform}.base_url {:?}: {e}", self.base_url))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "{platform}.base_url must be http(s), got: {}",
                self.base_url
            )));
        }

        if self.webhook_secret.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "{platform}.webhook_secret is required"
            )));
        }

        if self.page_size == 0 || self.workers == 0 {
            return Err(SyncError::InvalidConfig(format!(
                "{platform}.page_size and {platform}.workers must be greater than 0"
            )));
        }

        if self.rate_limit.capacity == 0 || self.rate_limit.refill_per_sec <= 0.0 {
            return Err(SyncError::InvalidConfig(format!(
                "{platform}.rate_limit needs capacity > 0 and refill_per_sec > 0"
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Conflict, Retry, Webhook, Sync Settings
// =============================================================================

/// Precedence for field conflicts.
///
/// `priority` is deliberately optional at the serde level so a missing value
/// produces a clear validation error instead of a silent default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictSettings {
    #[serde(default)]
    pub priority: Option<Platform>,
}

/// Retry/backoff tuning for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Delay after the first failure (milliseconds).
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound for computed delays (seconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Failed deliveries before an operation is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Randomization factor in `[0, 1)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    8
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            base_delay_ms: default_base_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

/// Inbound HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_webhook_port")]
    pub port: u16,

    /// Pending inbox rows above which deliveries get 429.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: u32,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_webhook_port() -> u16 {
    8787
}

fn default_inbox_capacity() -> u32 {
    10_000
}

impl Default for WebhookSettings {
    fn default() -> Self {
        WebhookSettings {
            bind_address: default_bind_address(),
            port: default_webhook_port(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl WebhookSettings {
    /// Returns the full bind address.
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Engine cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between polling passes (seconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Interval between scheduler sweeps (milliseconds).
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_ms: u64,

    /// Outbox rows claimed per platform per sweep, and inbox rows per drain.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Entity kinds to poll.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<EntityKind>,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_scheduler_interval() -> u64 {
    500
}
fn default_batch_size() -> u32 {
    100
}
fn default_kinds() -> Vec<EntityKind> {
    EntityKind::ALL.to_vec()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            poll_interval_secs: default_poll_interval(),
            scheduler_interval_ms: default_scheduler_interval(),
            batch_size: default_batch_size(),
            kinds: default_kinds(),
        }
    }
}

// =============================================================================
// Main Bridge Configuration
// =============================================================================

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub storefront: PlatformSettings,

    #[serde(default)]
    pub warehouse: PlatformSettings,

    #[serde(default)]
    pub conflict: ConflictSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub webhook: WebhookSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl BridgeConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`path`, else `STOCKBRIDGE_CONFIG`, else the project dir)
    /// 3. Environment variables
    /// 4. `validate()`
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        let path = config_path
            .or_else(|| std::env::var_os("STOCKBRIDGE_CONFIG").map(PathBuf::from))
            .or_else(Self::default_config_path);

        if let Some(path) = path {
            if path.exists() {
                info!(?path, "Loading bridge config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parses and validates a TOML document without consulting the environment.
    pub fn from_toml_str(contents: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.conflict.priority.is_none() {
            return Err(SyncError::InvalidConfig(
                "conflict.priority is required (storefront | warehouse)".into(),
            ));
        }

        self.storefront.validate(Platform::Storefront)?;
        self.warehouse.validate(Platform::Warehouse)?;

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }

        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(SyncError::InvalidConfig(format!(
                "retry.jitter must be in [0, 1), got {}",
                self.retry.jitter
            )));
        }

        if self.retry.base_delay_ms == 0 || self.retry.max_delay_secs * 1000 < self.retry.base_delay_ms {
            return Err(SyncError::InvalidConfig(
                "retry.base_delay_ms must be > 0 and not exceed retry.max_delay_secs".into(),
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.batch_size must be greater than 0".into(),
            ));
        }

        if self.webhook.inbox_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "webhook.inbox_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies `STOCKBRIDGE_*` overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("STOCKBRIDGE_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(token) = lookup("STOCKBRIDGE_STOREFRONT_TOKEN") {
            self.storefront.access_token = token;
        }

        if let Some(token) = lookup("STOCKBRIDGE_WAREHOUSE_TOKEN") {
            self.warehouse.access_token = token;
        }

        if let Some(secret) = lookup("STOCKBRIDGE_STOREFRONT_WEBHOOK_SECRET") {
            self.storefront.webhook_secret = secret;
        }

        if let Some(secret) = lookup("STOCKBRIDGE_WAREHOUSE_WEBHOOK_SECRET") {
            self.warehouse.webhook_secret = secret;
        }

        if let Some(priority) = lookup("STOCKBRIDGE_PRIORITY") {
            match priority.parse::<Platform>() {
                Ok(p) => {
                    debug!(priority = %p, "Overriding conflict priority from environment");
                    self.conflict.priority = Some(p);
                }
                Err(_) => warn!(priority = %priority, "Unknown priority platform in environment"),
            }
        }

        if let Some(port) = lookup("STOCKBRIDGE_WEBHOOK_PORT") {
            match port.parse::<u16>() {
                Ok(p) => self.webhook.port = p,
                Err(_) => warn!(port = %port, "Invalid webhook port in environment"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "stockbridge", "stockbridge")
            .map(|dirs| dirs.config_dir().join("bridge.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Settings for one platform.
    pub fn platform(&self, platform: Platform) -> &PlatformSettings {
        match platform {
            Platform::Storefront => &self.storefront,
            Platform::Warehouse => &self.warehouse,
        }
    }

    /// Conflict policy built from the configured priority.
    pub fn conflict_policy(&self) -> SyncResult<ConflictPolicy> {
        self.conflict
            .priority
            .map(|priority| ConflictPolicy { priority })
            .ok_or_else(|| SyncError::InvalidConfig("conflict.priority is required".into()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval_secs)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.sync.scheduler_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [storefront]
        base_url = "https://shop.example.com/admin/api/2024-01"
        access_token = "shpat_test"
        webhook_secret = "shop-secret"

        [warehouse]
        base_url = "https://wh.example.com/api/remap/1.2"
        access_token = "wh-token"
        webhook_secret = "wh-secret"

        [conflict]
        priority = "warehouse"
    "#;

    #[test]
    fn test_minimal_config() {
        let config = BridgeConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.conflict.priority, Some(Platform::Warehouse));
        assert_eq!(config.storefront.page_size, 50);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.sync.kinds.len(), 4);
        assert_eq!(config.webhook.socket_address(), "0.0.0.0:8787");
        assert_eq!(
            config.conflict_policy().unwrap(),
            ConflictPolicy { priority: Platform::Warehouse }
        );
    }

    #[test]
    fn test_priority_is_required() {
        let without = MINIMAL.replace("priority = \"warehouse\"", "");
        let err = BridgeConfig::from_toml_str(&without).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("conflict.priority"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = BridgeConfig::from_toml_str(MINIMAL).unwrap();

        config.storefront.base_url = "ftp://shop".into();
        assert!(config.validate().is_err());
        config.storefront.base_url = "https://shop.example.com".into();

        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());
        config.retry.jitter = 0.1;

        config.warehouse.webhook_secret.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::from_toml_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("STOCKBRIDGE_PRIORITY", "storefront"),
            ("STOCKBRIDGE_WEBHOOK_PORT", "9000"),
            ("STOCKBRIDGE_STOREFRONT_TOKEN", "from-env"),
            ("STOCKBRIDGE_DATABASE_PATH", "/tmp/bridge.db"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.conflict.priority, Some(Platform::Storefront));
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(config.storefront.access_token, "from-env");
        assert_eq!(config.database.path, PathBuf::from("/tmp/bridge.db"));
    }

    #[test]
    fn test_field_overrides_parse() {
        let toml = format!(
            "{MINIMAL}\n[[warehouse.field_overrides]]\nkind = \"product\"\ncanonical = \"vendor\"\nnative = \"manufacturer\"\n"
        );
        let config = BridgeConfig::from_toml_str(&toml).unwrap();
        assert_eq!(config.warehouse.field_overrides.len(), 1);
        assert_eq!(config.warehouse.field_overrides[0].kind, EntityKind::Product);
    }
}
