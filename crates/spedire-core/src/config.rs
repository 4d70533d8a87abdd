//! Spedire configuration system.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SpedireError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpedireConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Remote handlers, one per automation slug.
    #[serde(default)]
    pub webhooks: Vec<WebhookHandlerConfig>,
}

impl SpedireConfig {
    /// Load config from the default path (~/.spedire/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SpedireError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SpedireError::Toml(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SpedireError::Toml(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Spedire home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".spedire")
    }

    /// Apply process environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (env in production, a map in tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("SPEDIRE_DB_PATH") {
            self.database.path = path;
        }
        if let Some(url) = get("REDIS_URL") {
            self.lock.redis_url = url;
        }
        if let Some(mode) = get("AUTOMATION_LOCK_FAIL_MODE") {
            self.lock.fail_mode = mode.parse()?;
        }
        if let Some(ttl) = get("AUTOMATION_LOCK_TTL_SECS") {
            self.lock.ttl_secs = ttl.trim().parse().map_err(|_| {
                SpedireError::Config(format!("AUTOMATION_LOCK_TTL_SECS must be an integer, got '{ttl}'"))
            })?;
        }
        if let Some(secret) = get("CRON_SECRET") {
            self.gateway.cron_secret = secret;
        }
        if let Some(token) = get("SPEDIRE_ADMIN_TOKEN") {
            self.gateway.admin_token = token;
        }
        self.validate()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.lock.ttl_secs == 0 {
            return Err(SpedireError::Config("lock.ttl_secs must be > 0".into()));
        }
        if self.lock.key_prefix.trim().is_empty() {
            return Err(SpedireError::Config("lock.key_prefix must not be empty".into()));
        }
        for hook in &self.webhooks {
            if hook.slug.trim().is_empty() || hook.url.trim().is_empty() {
                return Err(SpedireError::Config(
                    "every [[webhooks]] entry needs a slug and a url".into(),
                ));
            }
            if hook.timeout_secs == 0 {
                return Err(SpedireError::Config(format!(
                    "webhooks.timeout_secs must be > 0 (slug '{}')",
                    hook.slug
                )));
            }
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.spedire/automations.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// What the lock does when its store is unreachable or unconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Grant the lock anyway (availability first).
    #[default]
    Open,
    /// Deny the lock (mutual exclusion first).
    Closed,
}

impl FromStr for FailMode {
    type Err = SpedireError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(SpedireError::Config(format!(
                "invalid lock fail mode '{other}' (expected 'open' or 'closed')"
            ))),
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Redis URL; empty means no store is configured.
    #[serde(default)]
    pub redis_url: String,
    #[serde(default)]
    pub fail_mode: FailMode,
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Degraded-coordination warnings: first of a streak, then every Nth.
    #[serde(default = "default_repeat_warn_every")]
    pub repeat_warn_every: u64,
}

fn default_lock_ttl() -> u64 { 300 }
fn default_key_prefix() -> String { "automation:lock".into() }
fn default_repeat_warn_every() -> u64 { 10 }

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            fail_mode: FailMode::default(),
            ttl_secs: default_lock_ttl(),
            key_prefix: default_key_prefix(),
            repeat_warn_every: default_repeat_warn_every(),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance_minutes: u32,
    /// Internal ticker period; 0 disables it.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
}

fn default_tolerance() -> u32 { 5 }
fn default_tick_interval() -> u64 { 300 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tolerance_minutes: default_tolerance(),
            tick_interval_secs: default_tick_interval(),
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer secret for the cron endpoint; the endpoint refuses to run while empty.
    #[serde(default)]
    pub cron_secret: String,
    /// Optional `X-Admin-Token` for the admin API.
    #[serde(default)]
    pub admin_token: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cron_secret: String::new(),
            admin_token: String::new(),
        }
    }
}

/// A remote worker that executes one automation over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookHandlerConfig {
    pub slug: String,
    pub url: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 { 120 }
