//! Environment-backed runtime configuration for the feed engine.

use std::{env, time::Duration};

use feed_core::{DEFAULT_BOTTOM_THRESHOLD_PX, DEFAULT_TOP_THRESHOLD_PX, RetryPolicy};
use thiserror::Error;

use crate::loader::{MAX_PAGE_SIZE, bounded_page_size};

const DEFAULT_PAGE_SIZE: u16 = 50;
const DEFAULT_ECHO_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_COMMAND_BUFFER: usize = 128;
const DEFAULT_STATE_BUFFER: usize = 512;

/// Tuning for one feed runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Page size for history and backfill fetches.
    pub page_size: u16,
    /// How long a confirmed write waits for its live echo.
    pub echo_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Optional cap on retained messages while at the bottom.
    pub max_retained: Option<usize>,
    pub top_threshold_px: f32,
    pub bottom_threshold_px: f32,
    /// Local sender handle excluded from unread counting.
    pub local_author: Option<String>,
    pub command_buffer: usize,
    pub state_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            echo_timeout_ms: DEFAULT_ECHO_TIMEOUT_MS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            max_retained: None,
            top_threshold_px: DEFAULT_TOP_THRESHOLD_PX,
            bottom_threshold_px: DEFAULT_BOTTOM_THRESHOLD_PX,
            local_author: None,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            state_buffer: DEFAULT_STATE_BUFFER,
        }
    }
}

impl FeedConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let page_size = parse_with_default("FEED_PAGE_SIZE", DEFAULT_PAGE_SIZE, &mut lookup)?;
        let echo_timeout_ms = parse_with_default(
            "FEED_ECHO_TIMEOUT_MS",
            DEFAULT_ECHO_TIMEOUT_MS,
            &mut lookup,
        )?;
        let reconnect_base_ms = parse_with_default(
            "FEED_RECONNECT_BASE_MS",
            DEFAULT_RECONNECT_BASE_MS,
            &mut lookup,
        )?;
        let reconnect_max_ms = parse_with_default(
            "FEED_RECONNECT_MAX_MS",
            DEFAULT_RECONNECT_MAX_MS,
            &mut lookup,
        )?;
        let max_retained = parse_optional::<usize, _>("FEED_MAX_RETAINED", &mut lookup)?;
        let top_threshold_px = parse_with_default(
            "FEED_TOP_THRESHOLD_PX",
            DEFAULT_TOP_THRESHOLD_PX,
            &mut lookup,
        )?;
        let bottom_threshold_px = parse_with_default(
            "FEED_BOTTOM_THRESHOLD_PX",
            DEFAULT_BOTTOM_THRESHOLD_PX,
            &mut lookup,
        )?;
        let local_author = optional_trimmed_env("FEED_LOCAL_AUTHOR", &mut lookup);
        let command_buffer = parse_with_default(
            "FEED_COMMAND_BUFFER",
            DEFAULT_COMMAND_BUFFER,
            &mut lookup,
        )?;
        let state_buffer =
            parse_with_default("FEED_STATE_BUFFER", DEFAULT_STATE_BUFFER, &mut lookup)?;

        if page_size == 0 {
            return Err(at_least_one("FEED_PAGE_SIZE"));
        }
        if page_size > MAX_PAGE_SIZE {
            tracing::warn!(page_size, max = MAX_PAGE_SIZE, "clamping FEED_PAGE_SIZE");
        }
        if max_retained == Some(0) {
            return Err(at_least_one("FEED_MAX_RETAINED"));
        }
        if command_buffer == 0 {
            return Err(at_least_one("FEED_COMMAND_BUFFER"));
        }
        if state_buffer == 0 {
            return Err(at_least_one("FEED_STATE_BUFFER"));
        }
        for (key, value) in [
            ("FEED_TOP_THRESHOLD_PX", top_threshold_px),
            ("FEED_BOTTOM_THRESHOLD_PX", bottom_threshold_px),
        ] {
            if value.is_nan() || value <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must be greater than 0".to_owned(),
                });
            }
        }
        if reconnect_base_ms > reconnect_max_ms {
            return Err(ConfigError::InvalidValue {
                key: "FEED_RECONNECT_BASE_MS",
                value: reconnect_base_ms.to_string(),
                reason: format!("must not exceed FEED_RECONNECT_MAX_MS ({reconnect_max_ms})"),
            });
        }

        Ok(Self {
            page_size: bounded_page_size(page_size),
            echo_timeout_ms,
            reconnect_base_ms,
            reconnect_max_ms,
            max_retained,
            top_threshold_px,
            bottom_threshold_px,
            local_author,
            command_buffer,
            state_buffer,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.reconnect_base_ms, self.reconnect_max_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn at_least_one(key: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: "0".to_owned(),
        reason: "must be at least 1".to_owned(),
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_with_default<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional(key, lookup)?.unwrap_or(default))
}
