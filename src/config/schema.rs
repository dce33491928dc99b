//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::CancellationPolicy;
use crate::group::SelectionPolicy;
use crate::health::HealthPolicy;
use crate::query::DEFAULT_MAX_POINTS;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Addresses the query API listens on.
    pub listeners: Vec<ListenerConfig>,

    /// Fan-out behaviour shared by all groups.
    pub dispatch: DispatchConfig,

    /// Backend health thresholds.
    pub health: HealthConfig,

    /// Single-flight result cache.
    pub cache: CacheConfig,

    /// Backend hostname resolution.
    pub resolver: ResolverConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Debug/status endpoints.
    pub debug: DebugConfig,

    /// Backend groups.
    pub groups: Vec<GroupConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig::default()],
            dispatch: DispatchConfig::default(),
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            resolver: ResolverConfig::default(),
            observability: ObservabilityConfig::default(),
            debug: DebugConfig::default(),
            groups: Vec::new(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Fan-out configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Query deadline when the caller does not supply one.
    pub default_timeout_ms: u64,

    /// Upper bound on caller-supplied deadlines.
    pub max_timeout_ms: u64,

    /// What a client disconnect does to in-flight work.
    pub cancellation: CancellationPolicy,

    /// Largest backend response body accepted.
    pub max_response_bytes: usize,

    /// Most slots one render series may hold, in requests and in backend answers.
    pub max_points: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            max_timeout_ms: 60_000,
            cancellation: CancellationPolicy::default(),
            max_response_bytes: 16 * 1024 * 1024,
            max_points: DEFAULT_MAX_POINTS,
        }
    }
}

impl DispatchConfig {
    /// Deadline budget for a query asking for `requested_ms`.
    pub fn query_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_timeout_ms)
            .min(self.max_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// Health tracking thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures per degradation step.
    pub failure_threshold: u32,

    /// Cool-down before an unhealthy backend is probed, in milliseconds.
    pub cooldown_ms: u64,

    /// Weight of the newest latency sample (0 < alpha <= 1).
    pub ewma_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
            ewma_alpha: 0.3,
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            ewma_alpha: self.ewma_alpha,
        }
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of complete results. Zero disables retention (single-flight remains).
    pub ttl_ms: u64,

    /// Lifetime of partial results. Zero means partial results are never stored.
    pub partial_ttl_ms: u64,

    /// Render ranges are truncated to this many seconds when building keys.
    pub resolution_secs: u32,

    /// Interval of the background sweep of expired entries. Zero disables it.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            partial_ttl_ms: 0,
            resolution_secs: 60,
            sweep_interval_ms: 30_000,
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Keep resolved addresses and refresh them in the background.
    pub caching: bool,

    /// Refresh interval in milliseconds.
    pub refresh_interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            caching: true,
            refresh_interval_ms: 60_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Debug endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Serve `/debug/*`.
    pub enabled: bool,

    /// Separate bind address; empty serves them on the main listeners.
    pub listen: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: String::new(),
        }
    }
}

/// Backend group configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    /// Unique group name.
    pub name: String,

    /// Selection policy.
    #[serde(default)]
    pub policy: SelectionPolicy,

    /// Per-backend call timeout in milliseconds.
    #[serde(default = "default_group_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum in-flight calls for the whole group.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Backend addresses (`host:port`).
    pub backends: Vec<String>,
}

fn default_group_timeout_ms() -> u64 {
    5_000
}

fn default_max_concurrent() -> usize {
    32
}
