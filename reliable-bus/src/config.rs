//! Retry and publish policy configuration

use crate::{Error, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Policy knobs shared by the publish pipeline and the consumer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessageOptions {
    /// Retries allowed before a failed message is dead-lettered
    pub max_retry_count: u32,

    /// Delay before a failed message is republished (0 disables it)
    pub retry_delay_ms: u64,

    /// Max unconfirmed publishes in flight per call
    pub max_outstanding_confirms: usize,

    /// Publishes per confirm synchronization point
    pub batch_size: usize,
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            retry_delay_ms: 5000,
            max_outstanding_confirms: 1000,
            batch_size: 20,
        }
    }
}

impl MessageOptions {
    /// Load options from the environment (and `.env` when present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load options through an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let options = Self {
            max_retry_count: parse_var(&lookup, "MESSAGE_MAX_RETRY_COUNT", defaults.max_retry_count)?,
            retry_delay_ms: parse_var(&lookup, "MESSAGE_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            max_outstanding_confirms: parse_var(
                &lookup,
                "MESSAGE_MAX_OUTSTANDING_CONFIRMS",
                defaults.max_outstanding_confirms,
            )?,
            batch_size: parse_var(&lookup, "MESSAGE_BATCH_SIZE", defaults.batch_size)?,
        };

        options.validate()?;
        Ok(options)
    }

    /// Parse options from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let options: Self = toml::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reject settings the pipelines cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".to_string()));
        }
        if self.max_outstanding_confirms == 0 {
            return Err(Error::Config(
                "max_outstanding_confirms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}
