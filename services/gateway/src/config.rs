//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Every section is optional; an empty file yields a gateway on
//! 127.0.0.1:8080 backed by `gateway-store.json`. Credentials never live in
//! this file, only in the store.

use provider::{HeaderInjection, ProviderProfile};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usage::{PricingEntry, PricingTable, WriterConfig};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,
    #[serde(default)]
    pub pricing: Vec<PricingEntry>,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Total timeout for non-streaming upstream requests
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Profile used when a request does not name one
    #[serde(default = "default_provider")]
    pub default_provider: String,
}

#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// How often per-request account counters are written out
    #[serde(default = "default_store_flush_interval")]
    pub flush_interval_secs: u64,
}

/// TTL and capacity per cache namespace
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_account_ttl")]
    pub account_ttl_secs: u64,
    #[serde(default = "default_account_entries")]
    pub account_max_entries: usize,
    #[serde(default = "default_api_key_ttl")]
    pub api_key_ttl_secs: u64,
    #[serde(default = "default_api_key_entries")]
    pub api_key_max_entries: usize,
    #[serde(default = "default_usage_ttl")]
    pub usage_ttl_secs: u64,
    #[serde(default = "default_usage_entries")]
    pub usage_max_entries: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Background token refresh and health recovery
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Refresh tokens expiring within this window
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub recheck_unhealthy: bool,
}

/// Usage write queue
#[derive(Debug, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_provider() -> String {
    provider::DEFAULT_PROVIDER.to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("gateway-store.json")
}

fn default_store_flush_interval() -> u64 {
    5
}

fn default_account_ttl() -> u64 {
    60
}

fn default_account_entries() -> usize {
    1000
}

fn default_api_key_ttl() -> u64 {
    300
}

fn default_api_key_entries() -> usize {
    10_000
}

fn default_usage_ttl() -> u64 {
    300
}

fn default_usage_entries() -> usize {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

fn default_health_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    usage::BATCH_SIZE
}

fn default_flush_interval() -> u64 {
    500
}

macro_rules! section_default {
    ($ty:ty { $($field:ident: $default:path),* $(,)? }) => {
        impl Default for $ty {
            fn default() -> Self {
                Self { $($field: $default()),* }
            }
        }
    };
}

section_default!(ServerConfig {
    listen_addr: default_listen_addr,
    timeout_secs: default_timeout,
    connect_timeout_secs: default_connect_timeout,
    max_connections: default_max_connections,
    max_body_bytes: default_max_body_bytes,
    default_provider: default_provider,
});
section_default!(StoreConfig {
    path: default_store_path,
    flush_interval_secs: default_store_flush_interval,
});
section_default!(CacheConfig {
    account_ttl_secs: default_account_ttl,
    account_max_entries: default_account_entries,
    api_key_ttl_secs: default_api_key_ttl,
    api_key_max_entries: default_api_key_entries,
    usage_ttl_secs: default_usage_ttl,
    usage_max_entries: default_usage_entries,
    sweep_interval_secs: default_sweep_interval,
});
section_default!(OAuthConfig {
    refresh_interval_secs: default_refresh_interval,
    refresh_threshold_secs: default_refresh_threshold,
    health_timeout_secs: default_health_timeout,
    recheck_unhealthy: default_true,
});
section_default!(UsageConfig {
    queue_capacity: default_queue_capacity,
    batch_size: default_batch_size,
    flush_interval_ms: default_flush_interval,
});

impl UsageConfig {
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            capacity: self.queue_capacity,
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, overlay environment variables,
    /// then validate.
    ///
    /// Env overrides: `GATEWAY_LISTEN_ADDR`, `GATEWAY_STORE_PATH`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(addr) = std::env::var("GATEWAY_LISTEN_ADDR") {
            self.server.listen_addr = addr.parse().map_err(|e| {
                common::Error::Config(format!("GATEWAY_LISTEN_ADDR is not a socket address: {e}"))
            })?;
        }
        if let Ok(path) = std::env::var("GATEWAY_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        let non_zero = [
            ("server.timeout_secs", self.server.timeout_secs),
            ("server.connect_timeout_secs", self.server.connect_timeout_secs),
            ("server.max_connections", self.server.max_connections as u64),
            ("server.max_body_bytes", self.server.max_body_bytes as u64),
            ("store.flush_interval_secs", self.store.flush_interval_secs),
            ("cache.account_ttl_secs", self.cache.account_ttl_secs),
            ("cache.api_key_ttl_secs", self.cache.api_key_ttl_secs),
            ("cache.usage_ttl_secs", self.cache.usage_ttl_secs),
            ("cache.sweep_interval_secs", self.cache.sweep_interval_secs),
            ("oauth.refresh_interval_secs", self.oauth.refresh_interval_secs),
            ("oauth.health_timeout_secs", self.oauth.health_timeout_secs),
            ("usage.queue_capacity", self.usage.queue_capacity as u64),
            ("usage.batch_size", self.usage.batch_size as u64),
            ("usage.flush_interval_ms", self.usage.flush_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(common::Error::Config(format!(
                "{name} must be greater than 0"
            )));
        }

        for profile in &self.providers {
            for (field, url) in [
                ("api_base", &profile.api_base),
                ("token_endpoint", &profile.token_endpoint),
            ] {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(common::Error::Config(format!(
                        "providers.{field} must start with http:// or https://, got: {url} (provider {})",
                        profile.name
                    )));
                }
            }
        }

        let known = self
            .providers
            .iter()
            .any(|p| p.name == self.server.default_provider);
        if !known && self.server.default_provider != provider::DEFAULT_PROVIDER {
            return Err(common::Error::Config(format!(
                "server.default_provider {:?} is not a configured provider",
                self.server.default_provider
            )));
        }

        PricingTable::with_overrides(&self.pricing)
            .map_err(|e| common::Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("upstream-gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that read or mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overrides() {
        unsafe {
            remove_env("GATEWAY_LISTEN_ADDR");
            remove_env("GATEWAY_STORE_PATH");
        }
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn full_toml() -> &'static str {
        r#"
[server]
listen_addr = "0.0.0.0:9000"
max_connections = 64

[store]
path = "/var/lib/gateway/store.json"
flush_interval_secs = 2

[cache]
account_ttl_secs = 30

[oauth]
refresh_threshold_secs = 600
recheck_unhealthy = false

[usage]
queue_capacity = 500
flush_interval_ms = 250

[[providers]]
name = "anthropic-staging"
api_base = "https://staging.example.com"

[[pricing]]
model = "claude-sonnet-4"
input_per_mtok = 2.0
output_per_mtok = 10.0

[[headers]]
name = "x-team"
value = "platform"
"#
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, full_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.timeout_secs, 300);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/gateway/store.json"));
        assert_eq!(config.store.flush_interval_secs, 2);
        assert_eq!(config.cache.account_ttl_secs, 30);
        assert_eq!(config.cache.api_key_ttl_secs, 300);
        assert_eq!(config.oauth.refresh_threshold_secs, 600);
        assert!(!config.oauth.recheck_unhealthy);
        assert_eq!(config.usage.writer_config().capacity, 500);
        assert_eq!(
            config.usage.writer_config().flush_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.providers[0].name, "anthropic-staging");
        assert_eq!(config.providers[0].api_version, "2023-06-01");
        assert_eq!(config.pricing.len(), 1);
        assert_eq!(config.headers[0].name, "x-team");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.server.default_provider, "anthropic");
        assert_eq!(config.store.path, PathBuf::from("gateway-store.json"));
        assert_eq!(config.store.flush_interval_secs, 5);
        assert_eq!(config.usage.batch_size, 100);
        assert!(config.oauth.recheck_unhealthy);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, full_toml());

        unsafe {
            set_env("GATEWAY_LISTEN_ADDR", "127.0.0.1:7777");
            set_env("GATEWAY_STORE_PATH", "/tmp/override.json");
        }
        let config = Config::load(&path);
        clear_overrides();

        let config = config.unwrap();
        assert_eq!(config.server.listen_addr.port(), 7777);
        assert_eq!(config.store.path, PathBuf::from("/tmp/override.json"));
    }

    #[test]
    fn test_invalid_listen_addr_env_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "");

        unsafe { set_env("GATEWAY_LISTEN_ADDR", "not-an-addr") };
        let result = Config::load(&path);
        clear_overrides();

        let err = result.unwrap_err().to_string();
        assert!(err.contains("GATEWAY_LISTEN_ADDR"), "got: {err}");
    }

    #[test]
    fn test_zero_limits_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();

        for (toml, field) in [
            ("[server]\nmax_connections = 0", "server.max_connections"),
            ("[server]\ntimeout_secs = 0", "server.timeout_secs"),
            ("[usage]\nbatch_size = 0", "usage.batch_size"),
            ("[cache]\nsweep_interval_secs = 0", "cache.sweep_interval_secs"),
            ("[store]\nflush_interval_secs = 0", "store.flush_interval_secs"),
        ] {
            let path = write_config(&dir, toml);
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(err.contains(field), "expected {field} in: {err}");
        }
    }

    #[test]
    fn test_provider_url_without_scheme_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[[providers]]
name = "broken"
api_base = "api.example.com"
"#,
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("api_base must start with http"), "got: {err}");
    }

    #[test]
    fn test_unknown_default_provider_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[server]\ndefault_provider = \"nowhere\"");

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_negative_pricing_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[[pricing]]
model = "m"
input_per_mtok = -1.0
output_per_mtok = 1.0
"#,
        );

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("upstream-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
