//! Configuration management for Creditgate.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then environment variables prefixed with `CREDITGATE` using `__` as the
//! section separator (for example `CREDITGATE__SYNC__FLUSH_INTERVAL_SECS=30`).

use config::{Config, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::ratelimit::TimeWindow;

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "CREDITGATE";

/// Main configuration for the Creditgate service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Entitlement cache configuration
    #[serde(default)]
    pub entitlements: EntitlementConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Billing backend / source of truth configuration
    #[serde(default)]
    pub billing: BillingConfig,

    /// Batch usage sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Per-route credit costs
    #[serde(default)]
    pub costs: CostConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Upstream API that admitted requests are proxied to
    #[serde(default)]
    pub upstream_url: Option<String>,

    /// Upstream request timeout in milliseconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,

    /// Use the first `X-Forwarded-For` hop as the client IP
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Largest request body forwarded upstream
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            upstream_url: None,
            upstream_timeout_ms: default_upstream_timeout(),
            trust_forwarded_for: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_upstream_timeout() -> u64 {
    30_000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Entitlement cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EntitlementConfig {
    /// TTL for cache entries and the bulk refresh watermark, in seconds
    #[serde(default = "default_entitlement_ttl")]
    pub ttl_secs: u64,

    /// Timeout for a bulk load, in milliseconds
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_ms: u64,

    /// Minimum spacing between non-forced refresh attempts, in seconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_entitlement_ttl(),
            refresh_timeout_ms: default_refresh_timeout(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl EntitlementConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

fn default_entitlement_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_refresh_timeout() -> u64 {
    10_000
}

fn default_retry_backoff() -> u64 {
    5
}

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeWindow,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitingConfig {
    /// Limit for requests without a usable token, keyed by client IP
    #[serde(default = "default_unauthenticated_rule")]
    pub unauthenticated: RateLimitRule,

    /// Limit for metered tokens, keyed by token
    #[serde(default = "default_metered_rule")]
    pub metered: RateLimitRule,

    /// How often expired windows are pruned, in seconds
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            unauthenticated: default_unauthenticated_rule(),
            metered: default_metered_rule(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

fn default_unauthenticated_rule() -> RateLimitRule {
    RateLimitRule {
        requests_per_unit: 30,
        unit: TimeWindow::Minute,
    }
}

fn default_metered_rule() -> RateLimitRule {
    RateLimitRule {
        requests_per_unit: 10_000,
        unit: TimeWindow::Minute,
    }
}

fn default_prune_interval() -> u64 {
    60
}

/// Billing backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Base URL of the billing / source-of-truth API
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Service credential, distinct from end-user tokens
    #[serde(default)]
    pub service_token: Option<SecretString>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_billing_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_token: None,
            request_timeout_ms: default_billing_timeout(),
        }
    }
}

impl BillingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_billing_timeout() -> u64 {
    10_000
}

/// Batch usage sync configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Debounce interval between the first usage record and its flush, in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Optional fixed schedule that also calls the flush path, in seconds
    #[serde(default)]
    pub periodic_interval_secs: Option<u64>,

    /// Merge a failed batch back into the live buffer instead of dropping it
    #[serde(default)]
    pub requeue_failed: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            periodic_interval_secs: None,
            requeue_failed: false,
        }
    }
}

impl SyncConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_flush_interval() -> u64 {
    60
}

/// Per-route credit cost configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    /// Cost charged when no route prefix matches
    #[serde(default = "default_cost")]
    pub default_cost: u64,

    /// Path prefix to cost
    #[serde(default)]
    pub routes: HashMap<String, u64>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            default_cost: default_cost(),
            routes: HashMap::new(),
        }
    }
}

fn default_cost() -> u64 {
    1
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }
        let config: GatewayConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a safety mechanism outright.
    pub fn validate(&self) -> Result<()> {
        for (tier, rule) in [
            ("unauthenticated", &self.rate_limiting.unauthenticated),
            ("metered", &self.rate_limiting.metered),
        ] {
            if rule.requests_per_unit == 0 {
                return Err(GatewayError::Config(format!(
                    "rate_limiting.{}.requests_per_unit must be greater than zero",
                    tier
                )));
            }
        }
        if self.rate_limiting.prune_interval_secs == 0 {
            return Err(GatewayError::Config(
                "rate_limiting.prune_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.flush_interval_secs == 0 {
            return Err(GatewayError::Config(
                "sync.flush_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.sync.periodic_interval_secs == Some(0) {
            return Err(GatewayError::Config(
                "sync.periodic_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.entitlements.ttl_secs == 0 {
            return Err(GatewayError::Config(
                "entitlements.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.server.upstream_url.is_some() && self.billing.endpoint.is_none() {
            return Err(GatewayError::Config(
                "billing.endpoint is required when server.upstream_url is set".to_string(),
            ));
        }
        Ok(())
    }
}
