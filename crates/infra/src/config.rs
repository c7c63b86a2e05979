//! Environment configuration for the orchestrator and its infrastructure.
//!
//! Unset variables fall back to defaults; set-but-invalid values are errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::materializer::DEFAULT_MAX_ASSET_BYTES;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Tuning for the submitter, poller, materializer and notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub poll_concurrency: usize,
    pub poll_batch_size: usize,
    pub max_poll_attempts: u32,
    pub provider_call_timeout: Duration,
    pub claim_lease: Duration,
    pub download_timeout: Duration,
    /// Largest provider asset the materializer will copy.
    pub max_asset_bytes: u64,
    pub notify_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            poll_concurrency: 8,
            poll_batch_size: 100,
            max_poll_attempts: 90,
            provider_call_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(300),
            download_timeout: Duration::from_secs(120),
            max_asset_bytes: DEFAULT_MAX_ASSET_BYTES,
            notify_queue_capacity: 1024,
        }
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(var).filter(|v| !v.trim().is_empty()) else {
        return Ok(default);
    };
    let value = raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    positive(lookup, var, default.as_secs()).map(Duration::from_secs)
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            poll_interval: secs(&lookup, "POLL_INTERVAL_SECS", d.poll_interval)?,
            poll_concurrency: positive(&lookup, "POLL_CONCURRENCY", d.poll_concurrency)?,
            poll_batch_size: positive(&lookup, "POLL_BATCH_SIZE", d.poll_batch_size)?,
            max_poll_attempts: positive(&lookup, "MAX_POLL_ATTEMPTS", d.max_poll_attempts)?,
            provider_call_timeout: secs(&lookup, "PROVIDER_CALL_TIMEOUT_SECS", d.provider_call_timeout)?,
            claim_lease: secs(&lookup, "CLAIM_LEASE_SECS", d.claim_lease)?,
            download_timeout: secs(&lookup, "DOWNLOAD_TIMEOUT_SECS", d.download_timeout)?,
            max_asset_bytes: positive(&lookup, "MAX_ASSET_BYTES", d.max_asset_bytes)?,
            notify_queue_capacity: positive(&lookup, "NOTIFY_QUEUE_CAPACITY", d.notify_queue_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// A claim must outlive one provider call plus one asset download, or
    /// another sweep can reclaim a job its holder is still working on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let slowest_step = self.provider_call_timeout + self.download_timeout;
        if self.claim_lease <= slowest_step {
            return Err(ConfigError::Invalid {
                var: "CLAIM_LEASE_SECS",
                value: self.claim_lease.as_secs().to_string(),
                reason: format!(
                    "must exceed provider call timeout plus download timeout ({}s)",
                    slowest_step.as_secs()
                ),
            });
        }
        Ok(())
    }
}

/// Which backends to wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraSettings {
    /// `Some(url)` when `USE_PERSISTENT_STORES=true`.
    pub database_url: Option<String>,
    pub storage_root: PathBuf,
    pub storage_public_base_url: String,
    pub notify_webhook_url: Option<String>,
}

impl InfraSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent = match non_empty("USE_PERSISTENT_STORES") {
            None => false,
            Some(raw) => raw.trim().parse::<bool>().map_err(|e| ConfigError::Invalid {
                var: "USE_PERSISTENT_STORES",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
        };
        let database_url = if use_persistent {
            Some(non_empty("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?)
        } else {
            None
        };

        Ok(Self {
            database_url,
            storage_root: non_empty("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/media")),
            storage_public_base_url: non_empty("STORAGE_PUBLIC_BASE_URL")
                .unwrap_or_else(|| "/media".to_string()),
            notify_webhook_url: non_empty("NOTIFY_WEBHOOK_URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |k: &str| map.get(k).map(|v| v.to_string())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.poll_interval, Duration::from_secs(20));
    }

    #[test]
    fn values_are_parsed() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("POLL_INTERVAL_SECS", "5"),
            ("MAX_POLL_ATTEMPTS", " 12 "),
            ("POLL_CONCURRENCY", "2"),
            ("MAX_ASSET_BYTES", "1048576"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_asset_bytes, 1_048_576);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.max_poll_attempts, 12);
        assert_eq!(cfg.poll_concurrency, 2);
    }

    #[test]
    fn garbage_and_zero_are_rejected() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("POLL_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "POLL_BATCH_SIZE", .. }));

        let err = OrchestratorConfig::from_lookup(lookup(&[("CLAIM_LEASE_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CLAIM_LEASE_SECS", .. }));
    }

    #[test]
    fn lease_must_outlive_provider_call_and_download() {
        let err = OrchestratorConfig::from_lookup(lookup(&[
            ("CLAIM_LEASE_SECS", "1"),
            ("PROVIDER_CALL_TIMEOUT_SECS", "60"),
            ("DOWNLOAD_TIMEOUT_SECS", "120"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CLAIM_LEASE_SECS", .. }));

        // equal is still too short
        let err = OrchestratorConfig::from_lookup(lookup(&[
            ("CLAIM_LEASE_SECS", "180"),
            ("PROVIDER_CALL_TIMEOUT_SECS", "60"),
            ("DOWNLOAD_TIMEOUT_SECS", "120"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "CLAIM_LEASE_SECS", .. }));

        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("CLAIM_LEASE_SECS", "181"),
            ("PROVIDER_CALL_TIMEOUT_SECS", "60"),
            ("DOWNLOAD_TIMEOUT_SECS", "120"),
        ]))
        .unwrap();
        assert_eq!(cfg.claim_lease, Duration::from_secs(181));
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn persistent_stores_require_database_url() {
        let err = InfraSettings::from_lookup(lookup(&[("USE_PERSISTENT_STORES", "true")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let s = InfraSettings::from_lookup(lookup(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/genforge"),
        ]))
        .unwrap();
        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/genforge"));
        assert_eq!(s.storage_public_base_url, "/media");
    }

    #[test]
    fn in_memory_by_default() {
        let s = InfraSettings::from_lookup(lookup(&[("DATABASE_URL", "postgres://ignored")])).unwrap();
        assert!(s.database_url.is_none());
        assert_eq!(s.storage_root, PathBuf::from("./data/media"));
    }
}
