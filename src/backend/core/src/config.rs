//! Configuration management.
//!
//! Layered: an optional TOML file (`CONFLUENCE_CONFIG`, else
//! `config/confluence.toml`) overridden by `CONFLUENCE__SECTION__KEY`
//! environment variables. Every section has working defaults, so an empty
//! environment starts an in-memory core.

use serde::Deserialize;
use std::time::Duration;

use crate::conflict::ConflictConfig;
use crate::error::{ConfluenceError, Result};
use crate::events::BusConfig;
use crate::reconciliation::ReconciliationConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};
use crate::saga::SagaConfig;
use crate::strangler::RouteConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub collaborators: CollaboratorsConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub conflict: ConflictConfig,

    #[serde(default)]
    pub saga: SagaConfig,

    #[serde(default)]
    pub strangler: StranglerConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory event store is used when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// OpenTelemetry OTLP endpoint
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorsConfig {
    /// Base URL of the legacy system's adapter endpoints
    #[serde(default)]
    pub legacy_url: Option<String>,

    /// Base URL of the modern backend's adapter endpoints
    #[serde(default)]
    pub modern_url: Option<String>,

    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            legacy_url: None,
            modern_url: None,
            poll_interval: default_poll_interval(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-producer admission limit on ingest
    #[serde(default)]
    pub ingress_rate_limit: RateLimitConfig,

    /// Outbound call limit protecting the legacy system
    #[serde(default = "default_legacy_rate_limit")]
    pub legacy_rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// How often expired limiter buckets and idle entity locks are dropped
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            ingress_rate_limit: RateLimitConfig::default(),
            legacy_rate_limit: default_legacy_rate_limit(),
            retry: RetryPolicy::default(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StranglerConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> u32 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_json_logging() -> bool {
    true
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_legacy_rate_limit() -> RateLimitConfig {
    RateLimitConfig::new(50, Duration::from_secs(1))
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    /// Load configuration from the optional file and the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFLUENCE_CONFIG").unwrap_or_else(|_| "config/confluence".to_string());
        Self::from_sources(config::File::with_name(&path).required(false))
    }

    /// Load configuration from a specific file, still overridden by the environment.
    pub fn load_from(path: &str) -> Result<Self> {
        Self::from_sources(config::File::with_name(path))
    }

    fn from_sources(file: config::File<config::FileSourceFile, config::FileFormat>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("CONFLUENCE").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        let breaker = &self.resilience.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return Err(ConfluenceError::configuration(
                "circuit breaker thresholds must be at least 1",
            ));
        }

        for (name, limit) in [
            ("ingress_rate_limit", &self.resilience.ingress_rate_limit),
            ("legacy_rate_limit", &self.resilience.legacy_rate_limit),
        ] {
            if limit.max_requests == 0 || limit.window.is_zero() {
                return Err(ConfluenceError::configuration(format!(
                    "{}: max_requests and window must be non-zero",
                    name
                )));
            }
        }

        if self.resilience.retry.max_attempts == 0 {
            return Err(ConfluenceError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.bus.handler_max_attempts == 0 {
            return Err(ConfluenceError::configuration("bus.handler_max_attempts must be at least 1"));
        }

        for route in &self.strangler.routes {
            route.validate()?;
        }

        if self.saga.step_timeout.is_zero() || self.saga.monitor_interval.is_zero() {
            return Err(ConfluenceError::configuration(
                "saga.step_timeout and saga.monitor_interval must be non-zero",
            ));
        }
        if self.reconciliation.enabled && self.reconciliation.interval.is_zero() {
            return Err(ConfluenceError::configuration("reconciliation.interval must be non-zero"));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
