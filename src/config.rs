//! Environment-driven configuration
//!
//! `main` loads `.env` through dotenv before calling [`Config::from_env`].

use std::time::Duration;
use thiserror::Error;

use crate::services::request_service::SignPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set in environment")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Object storage endpoint settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_url: String,
    pub api_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Acting administrator for the console
    pub admin_id: Option<i64>,
    pub storage: Option<StorageConfig>,
    /// Reject submissions whose proof could not be stored
    pub proof_required: bool,
    /// Post the ledger entry as part of `verify`
    pub auto_post_on_verify: bool,
    pub sign_policy: SignPolicy,
    /// How often the change log is polled
    pub feed_poll_interval: Duration,
    /// Age after which change log rows are deleted
    pub feed_retention: Duration,
    pub feed_backoff_min: Duration,
    pub feed_backoff_max: Duration,
    /// Age after which a cached query is re-fetched on next read
    pub cache_stale_after: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any name -> value lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let admin_id = match lookup("ADMIN_ID") {
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
                name: "ADMIN_ID",
                value: raw.clone(),
            })?),
            None => None,
        };

        let storage = match (lookup("STORAGE_URL"), lookup("STORAGE_KEY")) {
            (Some(base_url), Some(api_key)) => Some(StorageConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
                bucket: lookup("STORAGE_BUCKET")
                    .unwrap_or_else(|| "transaction-proofs".to_string()),
            }),
            _ => None,
        };

        let repayment_credits = parse_bool(&lookup, "REPAYMENT_CREDITS", false)?;

        Ok(Config {
            database_url,
            admin_id,
            storage,
            proof_required: parse_bool(&lookup, "PROOF_REQUIRED", true)?,
            auto_post_on_verify: parse_bool(&lookup, "AUTO_POST_ON_VERIFY", false)?,
            sign_policy: SignPolicy {
                repayment_credits,
                ..SignPolicy::default()
            },
            feed_poll_interval: millis(&lookup, "FEED_POLL_MS", 500)?,
            feed_retention: Duration::from_secs(parse_u64(&lookup, "FEED_RETENTION_SECS", 86_400)?),
            feed_backoff_min: millis(&lookup, "FEED_BACKOFF_MIN_MS", 500)?,
            feed_backoff_max: millis(&lookup, "FEED_BACKOFF_MAX_MS", 30_000)?,
            cache_stale_after: Duration::from_secs(parse_u64(&lookup, "CACHE_STALE_SECS", 30)?),
        })
    }
}

fn parse_bool<F>(lookup: &F, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
    }
}

fn parse_u64<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn millis<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_u64(lookup, name, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_millis(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_apply_when_only_database_url_is_set() {
        let config =
            Config::from_lookup(lookup_from(&[("DATABASE_URL", "mysql://localhost/sacco")]))
                .expect("config should load");

        assert!(config.proof_required);
        assert!(!config.auto_post_on_verify);
        assert!(config.storage.is_none());
        assert!(!config.sign_policy.repayment_credits);
        assert_eq!(config.feed_backoff_min, Duration::from_millis(500));
        assert_eq!(config.cache_stale_after, Duration::from_secs(30));
        assert_eq!(config.feed_poll_interval, Duration::from_millis(500));
        assert_eq!(config.feed_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "mysql://localhost/sacco"),
            ("FEED_POLL_MS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "FEED_POLL_MS", .. }));
    }

    #[test]
    fn test_missing_database_url_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn test_storage_and_flags_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "mysql://localhost/sacco"),
            ("ADMIN_ID", "7"),
            ("STORAGE_URL", "https://files.example.org/"),
            ("STORAGE_KEY", "service-key"),
            ("AUTO_POST_ON_VERIFY", "yes"),
            ("REPAYMENT_CREDITS", "true"),
        ]))
        .expect("config should load");

        let storage = config.storage.expect("storage configured");
        assert_eq!(storage.base_url, "https://files.example.org");
        assert_eq!(storage.bucket, "transaction-proofs");
        assert_eq!(config.admin_id, Some(7));
        assert!(config.auto_post_on_verify);
        assert!(config.sign_policy.repayment_credits);
    }

    #[test]
    fn test_bad_flag_value_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "mysql://localhost/sacco"),
            ("PROOF_REQUIRED", "sometimes"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PROOF_REQUIRED", .. }));
    }
}
