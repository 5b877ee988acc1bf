//! Configuration snapshots and providers.
//!
//! Sessions never read live configuration. They capture one
//! [`ConfigSnapshot`] when they start and keep it for their whole lifetime;
//! updating a [`ReloadableConfig`] publishes a fresh snapshot instead of
//! mutating the one in use.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FetchError, FetchResult};

pub const DEFAULT_BASE_URL: &str = "https://winbu.tv";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                                      AppleWebKit/537.36 (KHTML, like Gecko) \
                                      Chrome/115.0.0.0 Safari/537.36";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RATE_LIMIT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Immutable per-session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub base_url: String,
    pub user_agent: String,
    /// Budget for one primary fetch attempt.
    pub fetch_timeout: Duration,
    /// Extra wait before each retry of one primary fetch.
    pub rate_limit_delay: Duration,
    /// Retries after the first primary fetch attempt.
    pub max_retries: u32,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            rate_limit_delay: DEFAULT_RATE_LIMIT,
            max_retries: DEFAULT_MAX_RETRIES,
            cache_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// On-disk configuration. Every key is optional; keys match the names the
/// dashboard persists.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    base_url: Option<String>,
    user_agent: Option<String>,
    timeout: Option<String>,
    rate_limit: Option<String>,
    max_retries: Option<u32>,
    cache_enabled: Option<bool>,
    cache_ttl: Option<String>,
}

impl ConfigSnapshot {
    /// Defaults overlaid with `WINBU_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Load a JSON config file, then overlay environment variables.
    pub fn from_file(path: &Path) -> FetchResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .map_err(|e| FetchError::Config(format!("{}: {e}", path.display())))?;

        let mut cfg = Self::default();
        cfg.apply_file(file);
        cfg.apply_env();
        tracing::info!("configuration loaded from {}", path.display());
        Ok(cfg)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.base_url.filter(|v| !v.trim().is_empty()) {
            self.base_url = v;
        }
        if let Some(v) = file.user_agent.filter(|v| !v.trim().is_empty()) {
            self.user_agent = v;
        }
        if let Some(v) = file.timeout {
            self.fetch_timeout = parse_duration_or("timeout", &v, self.fetch_timeout);
        }
        if let Some(v) = file.rate_limit {
            self.rate_limit_delay = parse_duration_or("rate_limit", &v, self.rate_limit_delay);
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.cache_enabled {
            self.cache_enabled = v;
        }
        if let Some(v) = file.cache_ttl {
            self.cache_ttl = parse_duration_or("cache_ttl", &v, self.cache_ttl);
        }
    }

    fn apply_env(&mut self) {
        if let Some(v) = read_env_string("WINBU_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = read_env_string("WINBU_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = read_env_string("WINBU_FETCH_TIMEOUT") {
            self.fetch_timeout = parse_duration_or("WINBU_FETCH_TIMEOUT", &v, self.fetch_timeout);
        }
        if let Some(v) = read_env_string("WINBU_RATE_LIMIT") {
            self.rate_limit_delay = parse_duration_or("WINBU_RATE_LIMIT", &v, self.rate_limit_delay);
        }
        self.max_retries = read_env_u32("WINBU_MAX_RETRIES", self.max_retries);
        if let Some(v) = read_env_string("WINBU_CACHE_ENABLED") {
            self.cache_enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = read_env_string("WINBU_CACHE_TTL") {
            self.cache_ttl = parse_duration_or("WINBU_CACHE_TTL", &v, self.cache_ttl);
        }
    }
}

/// Supplies the snapshot a new session captures.
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Arc<ConfigSnapshot>;
}

/// A provider that always hands out the same snapshot.
#[derive(Debug, Clone)]
pub struct StaticConfig(Arc<ConfigSnapshot>);

impl StaticConfig {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self(Arc::new(snapshot))
    }
}

impl ConfigProvider for StaticConfig {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.0)
    }
}

/// A hot-reloadable provider. Updates swap in a new `Arc`; readers holding
/// the previous snapshot keep it unchanged.
#[derive(Debug)]
pub struct ReloadableConfig {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ReloadableConfig {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Publish a replacement snapshot.
    pub fn replace(&self, snapshot: ConfigSnapshot) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
        tracing::info!("configuration updated: base_url={}", guard.base_url);
    }

    /// Derive a new snapshot from the current one and publish it.
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut ConfigSnapshot),
    {
        let mut draft = (*self.snapshot()).clone();
        edit(&mut draft);
        self.replace(draft);
    }
}

impl ConfigProvider for ReloadableConfig {
    fn snapshot(&self) -> Arc<ConfigSnapshot> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }
}

/// Start-up tuning. Fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Admission capacity K: concurrent primary fetches.
    pub max_concurrent_fetches: usize,
    /// Resolver width M: concurrent secondary resolutions per session.
    pub max_concurrent_resolutions: usize,
    /// Individually recorded warnings per session.
    pub warning_cap: usize,
    pub sweep_interval: Duration,
    /// Deadline applied by `fetch` when the caller gives none.
    pub default_deadline: Duration,
    /// Backoff step; retry `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    pub pool: PoolSettings,
    pub side_channel: SideChannelSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 100,
            max_concurrent_resolutions: 20,
            warning_cap: 5,
            sweep_interval: Duration::from_secs(30 * 60),
            default_deadline: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(1),
            pool: PoolSettings::default(),
            side_channel: SideChannelSettings::default(),
        }
    }
}

/// Connection reuse and per-phase timeouts for the transport pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_idle_per_host: usize,
    pub max_idle_total: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub response_header_timeout: Duration,
    pub request_timeout: Duration,
    pub tcp_keepalive: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 50,
            max_idle_total: 200,
            idle_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(20),
            tcp_keepalive: Duration::from_secs(30),
        }
    }
}

/// Where and how secondary resolutions are posted.
#[derive(Debug, Clone)]
pub struct SideChannelSettings {
    /// Path joined onto the session's base URL.
    pub path: String,
    /// Form fields sent with every request, before the slot's own tokens.
    pub fixed_fields: Vec<(String, String)>,
}

impl Default for SideChannelSettings {
    fn default() -> Self {
        Self {
            path: "/wp-admin/admin-ajax.php".to_string(),
            fixed_fields: vec![("action".to_string(), "player_ajax".to_string())],
        }
    }
}

fn parse_duration_or(name: &str, raw: &str, fallback: Duration) -> Duration {
    match humantime::parse_duration(raw.trim()) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(
                "invalid {name} value '{raw}' ({e}), using {}",
                humantime::format_duration(fallback)
            );
            fallback
        }
    }
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ConfigSnapshot::default();
        assert_eq!(cfg.base_url, "https://winbu.tv");
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_retries, 3);
        assert!(cfg.cache_enabled);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(900));
    }

    #[test]
    fn test_file_overrides_and_bad_durations_fall_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "base_url": "https://mirror.example",
                "timeout": "5s",
                "rate_limit": "soon",
                "cache_ttl": "2m",
                "cache_enabled": false
            }}"#
        )
        .unwrap();

        let cfg = ConfigSnapshot::from_file(file.path()).unwrap();
        assert_eq!(cfg.base_url, "https://mirror.example");
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(5));
        assert_eq!(cfg.rate_limit_delay, DEFAULT_RATE_LIMIT);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(120));
        assert!(!cfg.cache_enabled);
        assert_eq!(cfg.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = ConfigSnapshot::from_file(file.path()).unwrap_err();
        assert!(matches!(err, FetchError::Config(_)));
    }

    #[test]
    fn test_reload_publishes_new_snapshot() {
        let provider = ReloadableConfig::new(ConfigSnapshot::default());
        let before = provider.snapshot();

        provider.update(|draft| {
            draft.base_url = "https://winbu.net".into();
            draft.max_retries = 0;
        });

        let after = provider.snapshot();
        assert_eq!(before.base_url, "https://winbu.tv");
        assert_eq!(before.max_retries, 3);
        assert_eq!(after.base_url, "https://winbu.net");
        assert_eq!(after.max_retries, 0);
    }

    #[test]
    fn test_static_config_shares_snapshot() {
        let provider = StaticConfig::new(ConfigSnapshot::default());
        assert!(Arc::ptr_eq(&provider.snapshot(), &provider.snapshot()));
    }
}
