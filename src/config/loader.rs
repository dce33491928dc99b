//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::{GatewayConfig, ListenerConfig};
use crate::config::validation::{validate_config, ValidationError};
use crate::dispatch::CancellationPolicy;

/// Default prefix of environment overrides.
pub const DEFAULT_ENV_PREFIX: &str = "GATEWAY";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment override {key}={value}")]
    Env { key: String, value: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, override and validate configuration from a TOML file.
pub fn load_config(path: &Path, env_prefix: &str) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut config: GatewayConfig = toml::from_str(&content)?;

    apply_env_overrides(&mut config, env_prefix, |key| std::env::var(key).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply `<PREFIX>_*` overrides on top of the file configuration.
///
/// `lookup` abstracts the environment so overrides can be tested without
/// touching process state.
pub fn apply_env_overrides<F>(
    config: &mut GatewayConfig,
    prefix: &str,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", prefix, name)
        }
    };

    if let Some(level) = lookup(&key("LOG_LEVEL")) {
        config.observability.log_level = level;
    }

    if let Some(address) = lookup(&key("LISTEN")) {
        config.listeners = vec![ListenerConfig { address }];
    }

    if let Some(value) = lookup(&key("CANCELLATION")) {
        config.dispatch.cancellation = match value.as_str() {
            "cancel_on_disconnect" => CancellationPolicy::CancelOnDisconnect,
            "ignore_client_timeout" => CancellationPolicy::IgnoreClientTimeout,
            _ => {
                return Err(ConfigError::Env {
                    key: key("CANCELLATION"),
                    value,
                })
            }
        };
    }

    if let Some(value) = lookup(&key("CACHE_TTL_MS")) {
        config.cache.ttl_ms = parse_number(&key("CACHE_TTL_MS"), value)?;
    }

    if let Some(value) = lookup(&key("DEFAULT_TIMEOUT_MS")) {
        config.dispatch.default_timeout_ms = parse_number(&key("DEFAULT_TIMEOUT_MS"), value)?;
    }

    Ok(())
}

fn parse_number(key: &str, value: String) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value,
    })
}
