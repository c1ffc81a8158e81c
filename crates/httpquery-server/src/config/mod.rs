//! Configuration loading and resolution.
//!
//! Every setting resolves in the same order: an explicit value (CLI flag),
//! then an `HTTPQUERY_*` environment variable, then the default.

use crate::types::{ServerError, ServerResult};
use httpquery::Dataset;
use std::str::FromStr;
use url::Url;

pub const DEFAULT_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_DATASET_SIZE: usize = 10_000;

pub const ENV_ADDR: &str = "HTTPQUERY_ADDR";
pub const ENV_DATASET_SIZE: &str = "HTTPQUERY_DATASET_SIZE";
pub const ENV_MAX_DATASET_SIZE: &str = "HTTPQUERY_MAX_DATASET_SIZE";
pub const ENV_MAX_BODY_BYTES: &str = "HTTPQUERY_MAX_BODY_BYTES";
pub const ENV_CACHE_CAPACITY: &str = "HTTPQUERY_CACHE_CAPACITY";
pub const ENV_DIAGNOSTICS: &str = "HTTPQUERY_DIAGNOSTICS";
pub const ENV_PUBLIC_URL: &str = "HTTPQUERY_PUBLIC_URL";

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    pub addr: String,
    /// Records generated per request.
    pub dataset_size: usize,
    /// Upper bound for a per-request size override.
    pub max_dataset_size: usize,
    pub max_body_bytes: usize,
    /// Compiled-query cache entries; 0 disables the cache.
    pub cache_capacity: usize,
    /// Include full error detail in failure envelopes.
    pub diagnostics: bool,
    /// Base for absolute URLs; falls back to the request `Host` when unset.
    pub public_url: Option<Url>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            dataset_size: Dataset::DEFAULT_SIZE,
            max_dataset_size: DEFAULT_MAX_DATASET_SIZE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cache_capacity: 0,
            diagnostics: false,
            public_url: None,
        }
    }
}

/// Explicit values, usually from the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub addr: Option<String>,
    pub dataset_size: Option<usize>,
    pub max_dataset_size: Option<usize>,
    pub max_body_bytes: Option<usize>,
    pub cache_capacity: Option<usize>,
    pub diagnostics: Option<bool>,
    pub public_url: Option<String>,
}

impl ServerConfig {
    /// Resolve against the process environment.
    pub fn resolve(overrides: ConfigOverrides) -> ServerResult<Self> {
        Self::resolve_with(overrides, |key| std::env::var(key).ok())
    }

    /// Resolve with a custom environment lookup.
    pub fn resolve_with<F>(overrides: ConfigOverrides, env: F) -> ServerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let addr = overrides
            .addr
            .or_else(|| env(ENV_ADDR))
            .unwrap_or(defaults.addr);
        let dataset_size = resolve_parsed(
            overrides.dataset_size,
            ENV_DATASET_SIZE,
            &env,
            defaults.dataset_size,
        )?;
        let max_dataset_size = resolve_parsed(
            overrides.max_dataset_size,
            ENV_MAX_DATASET_SIZE,
            &env,
            defaults.max_dataset_size,
        )?;
        let max_body_bytes = resolve_parsed(
            overrides.max_body_bytes,
            ENV_MAX_BODY_BYTES,
            &env,
            defaults.max_body_bytes,
        )?;
        let cache_capacity = resolve_parsed(
            overrides.cache_capacity,
            ENV_CACHE_CAPACITY,
            &env,
            defaults.cache_capacity,
        )?;
        let diagnostics = match overrides.diagnostics {
            Some(flag) => flag,
            None => match env(ENV_DIAGNOSTICS) {
                Some(raw) => parse_flag(ENV_DIAGNOSTICS, &raw)?,
                None => defaults.diagnostics,
            },
        };
        let public_url = overrides
            .public_url
            .or_else(|| env(ENV_PUBLIC_URL))
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| Url::parse(raw.trim()))
            .transpose()?;

        if dataset_size > max_dataset_size {
            return Err(ServerError::Config(format!(
                "dataset size {dataset_size} exceeds the maximum of {max_dataset_size}"
            )));
        }
        if max_body_bytes == 0 {
            return Err(ServerError::Config(
                "max body bytes must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            addr,
            dataset_size,
            max_dataset_size,
            max_body_bytes,
            cache_capacity,
            diagnostics,
            public_url,
        })
    }
}

fn resolve_parsed<T, F>(explicit: Option<T>, var: &str, env: &F, default: T) -> ServerResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = explicit {
        return Ok(value);
    }
    match env(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ServerError::Config(format!("{var}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_flag(var: &str, raw: &str) -> ServerResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ServerError::Config(format!(
            "{var}={other:?}: expected true or false"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::resolve_with(ConfigOverrides::default(), env_of(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.dataset_size, 100);
        assert_eq!(config.max_body_bytes, 64 * 1024);
        assert!(!config.diagnostics);
    }

    #[test]
    fn test_env_applies() {
        let env = env_of(&[
            (ENV_ADDR, "0.0.0.0:8080"),
            (ENV_DATASET_SIZE, "25"),
            (ENV_CACHE_CAPACITY, "64"),
            (ENV_DIAGNOSTICS, "yes"),
            (ENV_PUBLIC_URL, "https://example.test/"),
        ]);
        let config = ServerConfig::resolve_with(ConfigOverrides::default(), env).unwrap();
        assert_eq!(config.addr, "0.0.0.0:8080");
        assert_eq!(config.dataset_size, 25);
        assert_eq!(config.cache_capacity, 64);
        assert!(config.diagnostics);
        assert_eq!(
            config.public_url.map(|u| u.to_string()),
            Some("https://example.test/".to_string())
        );
    }

    #[test]
    fn test_explicit_beats_env() {
        let overrides = ConfigOverrides {
            dataset_size: Some(7),
            diagnostics: Some(false),
            ..Default::default()
        };
        let env = env_of(&[(ENV_DATASET_SIZE, "25"), (ENV_DIAGNOSTICS, "true")]);
        let config = ServerConfig::resolve_with(overrides, env).unwrap();
        assert_eq!(config.dataset_size, 7);
        assert!(!config.diagnostics);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let bad = [
            (ENV_DATASET_SIZE, "lots"),
            (ENV_DIAGNOSTICS, "maybe"),
            (ENV_PUBLIC_URL, "not a url"),
            (ENV_MAX_BODY_BYTES, "0"),
        ];
        for pair in bad {
            let result = ServerConfig::resolve_with(ConfigOverrides::default(), env_of(&[pair]));
            assert!(result.is_err(), "{pair:?}");
        }
    }

    #[test]
    fn test_dataset_size_bounded() {
        let overrides = ConfigOverrides {
            dataset_size: Some(50),
            max_dataset_size: Some(10),
            ..Default::default()
        };
        assert!(ServerConfig::resolve_with(overrides, env_of(&[])).is_err());
    }
}
