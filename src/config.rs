//! Configuration management for Turnstile.
//!
//! Settings come from an optional YAML file, then `TURNSTILE_*` environment
//! variables, then command-line flags. The merged result is validated once
//! and stays immutable for the life of the server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{PolicyTable, Quota, DEFAULT_API_KEY_HEADER};

/// Prefix of environment variables read by [`TurnstileConfig::load`].
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Longest wait for a bucket lock before answering 503
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Time allowed for in-flight requests to finish on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            lock_timeout_ms: default_lock_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_lock_timeout_ms() -> u64 {
    250
}

fn default_shutdown_grace() -> u64 {
    5
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Quota for identities with no specific entry
    #[serde(default)]
    pub default: Quota,

    /// Quota for IP identities; `default` applies when unset
    #[serde(default)]
    pub ip_default: Option<Quota>,

    /// Per-token quotas
    #[serde(default)]
    pub tokens: HashMap<String, Quota>,

    /// Peers whose forwarding headers are trusted
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,

    /// Bucket count above which idle buckets are swept
    #[serde(default = "default_max_buckets")]
    pub max_buckets: usize,

    /// Idle time before a full bucket may be evicted
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            api_key_header: default_api_key_header(),
            default: Quota::default(),
            ip_default: None,
            tokens: HashMap::new(),
            trusted_proxies: Vec::new(),
            max_buckets: default_max_buckets(),
            idle_ttl_secs: default_idle_ttl(),
        }
    }
}

impl RateLimitingConfig {
    /// Build the validated policy table.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        PolicyTable::from_parts(self.default, self.ip_default, self.tokens.clone())
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_string()
}

fn default_max_buckets() -> usize {
    100_000
}

fn default_idle_ttl() -> u64 {
    300
}

/// Flat settings that may be overridden from the environment.
///
/// Token tables are not read from here; they go through the YAML file or
/// the `TOKEN_LIMITS` JSON flag so token names keep their exact case.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    http_addr: Option<SocketAddr>,
    lock_timeout_ms: Option<u64>,
    shutdown_grace_secs: Option<u64>,
    api_key_header: Option<String>,
    default_capacity: Option<u32>,
    default_refill_per_sec: Option<f64>,
    default_block_secs: Option<u64>,
    ip_capacity: Option<u32>,
    ip_refill_per_sec: Option<f64>,
    max_buckets: Option<usize>,
    idle_ttl_secs: Option<u64>,
}

/// Whole-second limits keyed by identity kind, set from the command line or
/// `IP_RATE_LIMIT`, `IP_BLOCK_DURATION`, `TOKEN_RATE_LIMIT` and
/// `TOKEN_BLOCK_DURATION`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct LimitOverrides {
    /// Requests per second for IP identities
    #[arg(long, env = "IP_RATE_LIMIT")]
    pub ip_rate_limit: Option<u32>,

    /// Seconds an IP identity stays blocked after exceeding its limit
    #[arg(long, env = "IP_BLOCK_DURATION")]
    pub ip_block_duration: Option<u64>,

    /// Requests per second for tokens without their own entry
    #[arg(long, env = "TOKEN_RATE_LIMIT")]
    pub token_rate_limit: Option<u32>,

    /// Seconds a token stays blocked after exceeding its limit
    #[arg(long, env = "TOKEN_BLOCK_DURATION")]
    pub token_block_duration: Option<u64>,
}

impl LimitOverrides {
    /// Apply to `limits`.
    ///
    /// IP and token defaults are split as soon as either kind is set, so a
    /// token setting never leaks into IP identities.
    pub fn apply(&self, limits: &mut RateLimitingConfig) {
        let ip_set = self.ip_rate_limit.is_some() || self.ip_block_duration.is_some();
        let token_set = self.token_rate_limit.is_some() || self.token_block_duration.is_some();
        if !ip_set && !token_set {
            return;
        }

        let mut ip = limits.ip_default.unwrap_or(limits.default);
        if let Some(requests) = self.ip_rate_limit {
            ip = Quota::per_second(requests).with_block(ip.block_secs);
        }
        if let Some(secs) = self.ip_block_duration {
            ip.block_secs = secs;
        }
        limits.ip_default = Some(ip);

        if let Some(requests) = self.token_rate_limit {
            limits.default = Quota::per_second(requests).with_block(limits.default.block_secs);
        }
        if let Some(secs) = self.token_block_duration {
            limits.default.block_secs = secs;
        }
    }
}

impl TurnstileConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load the optional file, then apply `TURNSTILE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(::config::Environment::with_prefix(ENV_PREFIX))?;
        Ok(config)
    }

    fn apply_env(&mut self, env: ::config::Environment) -> Result<()> {
        let overrides: EnvOverrides = ::config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;

        if let Some(addr) = overrides.http_addr {
            self.server.http_addr = addr;
        }
        if let Some(ms) = overrides.lock_timeout_ms {
            self.server.lock_timeout_ms = ms;
        }
        if let Some(secs) = overrides.shutdown_grace_secs {
            self.server.shutdown_grace_secs = secs;
        }

        let limits = &mut self.rate_limiting;
        if let Some(header) = overrides.api_key_header {
            limits.api_key_header = header;
        }
        if let Some(capacity) = overrides.default_capacity {
            limits.default.capacity = capacity;
        }
        if let Some(rate) = overrides.default_refill_per_sec {
            limits.default.refill_per_sec = rate;
        }
        if let Some(secs) = overrides.default_block_secs {
            limits.default.block_secs = secs;
        }
        if overrides.ip_capacity.is_some() || overrides.ip_refill_per_sec.is_some() {
            let mut ip = limits.ip_default.unwrap_or(limits.default);
            if let Some(capacity) = overrides.ip_capacity {
                ip.capacity = capacity;
            }
            if let Some(rate) = overrides.ip_refill_per_sec {
                ip.refill_per_sec = rate;
            }
            limits.ip_default = Some(ip);
        }
        if let Some(max) = overrides.max_buckets {
            limits.max_buckets = max;
        }
        if let Some(secs) = overrides.idle_ttl_secs {
            limits.idle_ttl_secs = secs;
        }
        Ok(())
    }

    /// Check everything that is otherwise only discovered at request time.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.policy_table()?;
        if axum::http::HeaderName::try_from(self.rate_limiting.api_key_header.as_str()).is_err() {
            return Err(TurnstileError::Config(format!(
                "invalid API key header name '{}'",
                self.rate_limiting.api_key_header
            )));
        }
        if self.server.lock_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
