//! Configuration loading and representation.
//!
//! Everything comes from `FOLIO_*` environment variables with defaults for
//! anything unset. Values that are set but unparsable are errors rather than
//! silently falling back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projections::EngineConfig;

pub const DATABASE_URL: &str = "FOLIO_DATABASE_URL";
pub const PROJECTION_BATCH_SIZE: &str = "FOLIO_PROJECTION_BATCH_SIZE";
pub const PROJECTION_POLL_INTERVAL_MS: &str = "FOLIO_PROJECTION_POLL_INTERVAL_MS";
pub const PROJECTION_MAX_FOLD_RETRIES: &str = "FOLIO_PROJECTION_MAX_FOLD_RETRIES";
pub const PROJECTION_RETRY_BACKOFF_MS: &str = "FOLIO_PROJECTION_RETRY_BACKOFF_MS";
pub const WAIT_TIMEOUT_MS: &str = "FOLIO_WAIT_TIMEOUT_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    /// Postgres connection string; in-memory stores when unset.
    pub database_url: Option<String>,
    pub projection: EngineConfig,
    /// How long a write waits for its projection before answering with a timeout.
    pub default_wait_timeout_ms: u64,
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            projection: EngineConfig::default(),
            default_wait_timeout_ms: 5_000,
        }
    }
}

impl FolioConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(DATABASE_URL).filter(|v| !v.trim().is_empty()) {
            config.database_url = Some(url);
        }
        if let Some(v) = parse(&lookup, PROJECTION_BATCH_SIZE)? {
            if v == 0 {
                return Err(invalid(PROJECTION_BATCH_SIZE, "0", "must be positive"));
            }
            config.projection.batch_size = v;
        }
        if let Some(v) = parse(&lookup, PROJECTION_POLL_INTERVAL_MS)? {
            config.projection.poll_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, PROJECTION_MAX_FOLD_RETRIES)? {
            config.projection.max_fold_retries = v;
        }
        if let Some(v) = parse(&lookup, PROJECTION_RETRY_BACKOFF_MS)? {
            config.projection.retry_backoff_ms = v;
        }
        if let Some(v) = parse(&lookup, WAIT_TIMEOUT_MS)? {
            config.default_wait_timeout_ms = v;
        }

        Ok(config)
    }

    pub fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = FolioConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, FolioConfig::default());
        assert!(config.database_url.is_none());
        assert_eq!(config.default_wait_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = FolioConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://localhost/folio"),
            (PROJECTION_BATCH_SIZE, "64"),
            (PROJECTION_POLL_INTERVAL_MS, " 20 "),
            (PROJECTION_MAX_FOLD_RETRIES, "0"),
            (WAIT_TIMEOUT_MS, "750"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/folio"));
        assert_eq!(config.projection.batch_size, 64);
        assert_eq!(config.projection.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.projection.max_fold_retries, 0);
        assert_eq!(config.default_wait_timeout_ms, 750);
    }

    #[test]
    fn unparsable_values_are_reported() {
        let err = FolioConfig::from_lookup(lookup(&[(PROJECTION_RETRY_BACKOFF_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: PROJECTION_RETRY_BACKOFF_MS, .. }
        ));
        assert!(FolioConfig::from_lookup(lookup(&[(PROJECTION_BATCH_SIZE, "0")])).is_err());
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: FolioConfig =
            serde_json::from_str(r#"{"projection":{"batch_size":8}}"#).unwrap();
        assert_eq!(config.projection.batch_size, 8);
        assert_eq!(config.projection.max_fold_retries, 3);
        assert_eq!(config.default_wait_timeout_ms, 5_000);
    }
}
