//! Process configuration, read from `LEADAI_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::campaigns::RateLimit;
use crate::error::ConfigError;
use crate::pipeline::orchestrator::DEFAULT_WORKERS;
use crate::pipeline::retry::RetryPolicy;
use crate::transport::{TransportProfile, load_profiles};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Concurrent dispatch tasks per campaign run.
    pub workers: usize,
    /// Scheduler tick interval.
    pub tick_interval: Duration,
    /// Public base URL for open/click tracking; tracking is off when unset.
    pub tracking_base_url: Option<String>,
    pub retry: RetryPolicy,
    /// Applied to profiles without their own limit.
    pub rate_limit: Option<RateLimit>,
    /// Directory for daily-rolling log files.
    pub log_dir: Option<PathBuf>,
    /// Tenant used when a request names none.
    pub default_tenant: String,
    pub profiles_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/leadai.db"),
            http_port: 8080,
            workers: DEFAULT_WORKERS,
            tick_interval: Duration::from_secs(30),
            tracking_base_url: None,
            retry: RetryPolicy::default(),
            rate_limit: None,
            log_dir: None,
            default_tenant: "default".to_string(),
            profiles_path: None,
        }
    }
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let workers: usize = parse_or(&var, "LEADAI_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(invalid("LEADAI_WORKERS", "must be at least 1"));
        }

        let tick_secs: u64 = parse_or(&var, "LEADAI_TICK_SECS", defaults.tick_interval.as_secs())?;
        if tick_secs == 0 {
            return Err(invalid("LEADAI_TICK_SECS", "must be at least 1"));
        }

        let retry = RetryPolicy {
            max_attempts: parse_or(&var, "LEADAI_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: Duration::from_secs(parse_or(
                &var,
                "LEADAI_RETRY_BASE_SECS",
                defaults.retry.base_delay.as_secs(),
            )?),
            max_delay: Duration::from_secs(parse_or(
                &var,
                "LEADAI_RETRY_MAX_SECS",
                defaults.retry.max_delay.as_secs(),
            )?),
            ..defaults.retry
        };
        if retry.max_attempts == 0 {
            return Err(invalid("LEADAI_RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        if retry.max_delay < retry.base_delay {
            return Err(invalid(
                "LEADAI_RETRY_MAX_SECS",
                "must not be below LEADAI_RETRY_BASE_SECS",
            ));
        }

        let per_minute: u32 = parse_or(&var, "LEADAI_RATE_LIMIT_PER_MIN", 0)?;
        let rate_limit = (per_minute > 0).then(|| RateLimit::per_minute(per_minute));

        let tracking_base_url = match var("LEADAI_TRACKING_BASE_URL") {
            Some(url) => match reqwest::Url::parse(&url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                    Some(url.trim_end_matches('/').to_string())
                }
                _ => {
                    return Err(invalid(
                        "LEADAI_TRACKING_BASE_URL",
                        format!("not an http(s) URL: {url}"),
                    ));
                }
            },
            None => None,
        };

        Ok(Self {
            db_path: var("LEADAI_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            http_port: parse_or(&var, "LEADAI_HTTP_PORT", defaults.http_port)?,
            workers,
            tick_interval: Duration::from_secs(tick_secs),
            tracking_base_url,
            retry,
            rate_limit,
            log_dir: var("LEADAI_LOG_DIR").map(PathBuf::from),
            default_tenant: var("LEADAI_TENANT").unwrap_or(defaults.default_tenant),
            profiles_path: var("LEADAI_PROFILES_PATH").map(PathBuf::from),
        })
    }

    /// Transport profiles: the JSON file when configured, otherwise a single
    /// profile from `SMTP_*` variables. Empty means simulate everything.
    pub fn load_profiles(&self) -> Result<Vec<TransportProfile>, ConfigError> {
        if let Some(path) = &self.profiles_path {
            return load_profiles(path);
        }
        Ok(TransportProfile::from_env()?.into_iter().collect())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_or<T, V>(var: &V, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(key, format!("{raw}: {e}"))),
        None => Ok(default),
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
    fn defaults_when_unset() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./data/leadai.db"));
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.workers, 4);
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.rate_limit.is_none());
        assert!(config.tracking_base_url.is_none());
        assert_eq!(config.default_tenant, "default");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = AppConfig::from_lookup(lookup(&[
            ("LEADAI_HTTP_PORT", "9090"),
            ("LEADAI_WORKERS", "8"),
            ("LEADAI_RETRY_MAX_ATTEMPTS", "3"),
            ("LEADAI_RETRY_BASE_SECS", "2"),
            ("LEADAI_RETRY_MAX_SECS", "60"),
            ("LEADAI_RATE_LIMIT_PER_MIN", "30"),
            ("LEADAI_TRACKING_BASE_URL", "https://t.example.com/"),
            ("LEADAI_TENANT", "acme"),
        ]))
        .unwrap();
        assert_eq!(config.http_port, 9090);
        assert_eq!(config.workers, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert_eq!(config.rate_limit, Some(RateLimit::per_minute(30)));
        assert_eq!(config.tracking_base_url.as_deref(), Some("https://t.example.com"));
        assert_eq!(config.default_tenant, "acme");
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("LEADAI_HTTP_PORT", "  ")])).unwrap();
        assert_eq!(config.http_port, 8080);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for pairs in [
            [("LEADAI_HTTP_PORT", "eighty")],
            [("LEADAI_WORKERS", "0")],
            [("LEADAI_TICK_SECS", "-1")],
            [("LEADAI_RETRY_MAX_ATTEMPTS", "0")],
            [("LEADAI_TRACKING_BASE_URL", "ftp://x.example.com")],
        ] {
            let err = AppConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key, .. } if key == pairs[0].0),
                "unexpected error for {:?}: {err}",
                pairs[0]
            );
        }
    }

    #[test]
    fn retry_cap_below_base_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("LEADAI_RETRY_BASE_SECS", "30"),
            ("LEADAI_RETRY_MAX_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
