//! Configuration management following 12-factor app principles
//!
//! All configuration is loaded from environment variables to ensure
//! clean separation between code and config. Every setting has a default
//! suitable for local development; malformed values are rejected rather
//! than silently replaced.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(anyhow!(
                "Unknown backoff '{}'. Valid values: fixed, exponential",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,

    /// Worker pool
    pub worker_count: usize,
    pub queue_capacity: usize,

    /// Stage executor backend
    pub stage_provider: String,
    pub mock_step_delay_ms: u64,

    /// Retry policy
    pub retry_max_retries: u32,
    pub retry_backoff: BackoffKind,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Deadlines (unset means no deadline)
    pub stage_timeout_secs: Option<u64>,
    pub job_timeout_secs: Option<u64>,

    /// Result retention
    pub result_ttl_secs: u64,
    pub result_capacity: usize,
    pub result_purge_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            worker_count: 4,
            queue_capacity: 256,
            stage_provider: "mock".to_string(),
            mock_step_delay_ms: 250,
            retry_max_retries: 1,
            retry_backoff: BackoffKind::Exponential,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            stage_timeout_secs: None,
            job_timeout_secs: None,
            result_ttl_secs: 3600,
            result_capacity: 1000,
            result_purge_interval_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            port: parse_or(&lookup, "PORT", defaults.port)?,
            worker_count: parse_or(&lookup, "WORKER_COUNT", defaults.worker_count)?,
            queue_capacity: parse_or(&lookup, "QUEUE_CAPACITY", defaults.queue_capacity)?,
            stage_provider: lookup("STAGE_PROVIDER").unwrap_or(defaults.stage_provider),
            mock_step_delay_ms: parse_or(
                &lookup,
                "MOCK_STEP_DELAY_MS",
                defaults.mock_step_delay_ms,
            )?,
            retry_max_retries: parse_or(&lookup, "RETRY_MAX_RETRIES", defaults.retry_max_retries)?,
            retry_backoff: parse_or(&lookup, "RETRY_BACKOFF", defaults.retry_backoff)?,
            retry_base_delay_ms: parse_or(
                &lookup,
                "RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: parse_or(
                &lookup,
                "RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            )?,
            stage_timeout_secs: parse_optional(&lookup, "STAGE_TIMEOUT_SECS")?,
            job_timeout_secs: parse_optional(&lookup, "JOB_TIMEOUT_SECS")?,
            result_ttl_secs: parse_or(&lookup, "RESULT_TTL_SECS", defaults.result_ttl_secs)?,
            result_capacity: parse_or(&lookup, "RESULT_CAPACITY", defaults.result_capacity)?,
            result_purge_interval_secs: parse_or(
                &lookup,
                "RESULT_PURGE_INTERVAL_SECS",
                defaults.result_purge_interval_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave the worker pool unusable
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow!("WORKER_COUNT must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("QUEUE_CAPACITY must be greater than zero"));
        }
        if self.result_capacity == 0 {
            return Err(anyhow!("RESULT_CAPACITY must be greater than zero"));
        }
        if self.result_ttl_secs == 0 {
            return Err(anyhow!("RESULT_TTL_SECS must be greater than zero"));
        }
        if self.result_purge_interval_secs == 0 {
            return Err(anyhow!(
                "RESULT_PURGE_INTERVAL_SECS must be greater than zero"
            ));
        }
        if self.stage_timeout_secs == Some(0) {
            return Err(anyhow!("STAGE_TIMEOUT_SECS must be greater than zero when set"));
        }
        if self.job_timeout_secs == Some(0) {
            return Err(anyhow!("JOB_TIMEOUT_SECS must be greater than zero when set"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(anyhow!(
                "RETRY_MAX_DELAY_MS must not be lower than RETRY_BASE_DELAY_MS"
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(lookup, key)?.unwrap_or(default))
}

fn parse_optional<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{} has an invalid value '{}': {}", key, raw, e)),
        _ => Ok(None),
    }
}
