//! Engine configuration from the environment
//!
//! Provides trait-based access to environment variables so configuration
//! parsing can be unit tested without touching process state.

use std::time::Duration;

use tollgate_common::retry::RetryConfig;
use tollgate_common::{Error, Result};

/// Skip the NGINX sleep-module check before delay rules
pub const SKIP_MODULE_VERIFICATION_ENV: &str = "TOLLGATE_SKIP_NGINX_MODULE_VERIFICATION";
/// Attempts for one annotation read-modify-write before giving up
pub const WRITE_ATTEMPTS_ENV: &str = "TOLLGATE_ANNOTATION_WRITE_ATTEMPTS";
/// First backoff delay between annotation write attempts, in milliseconds
pub const RETRY_INITIAL_DELAY_ENV: &str = "TOLLGATE_ANNOTATION_RETRY_INITIAL_DELAY_MS";

const DEFAULT_WRITE_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Source of environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, `None` when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Tunables for the engine
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Trust the operator that the NGINX sleep module is present
    pub skip_module_verification: bool,
    /// Attempts for one annotation read-modify-write
    pub write_attempts: u32,
    /// First backoff delay between write attempts
    pub retry_initial_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            skip_module_verification: false,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            retry_initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(&OsEnv)
    }

    /// Load from any environment source; unset variables keep their defaults
    pub fn from_source(env: &dyn EnvSource) -> Result<Self> {
        let defaults = Self::default();

        let skip_module_verification = match env.var(SKIP_MODULE_VERIFICATION_ENV) {
            Some(v) => parse_bool(SKIP_MODULE_VERIFICATION_ENV, &v)?,
            None => defaults.skip_module_verification,
        };

        let write_attempts = match env.var(WRITE_ATTEMPTS_ENV) {
            Some(v) => v
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::validation_for_field(
                        WRITE_ATTEMPTS_ENV,
                        format!("expected a positive integer, got '{}'", v),
                    )
                })?,
            None => defaults.write_attempts,
        };

        let retry_initial_delay = match env.var(RETRY_INITIAL_DELAY_ENV) {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| {
                    Error::validation_for_field(
                        RETRY_INITIAL_DELAY_ENV,
                        format!("expected milliseconds, got '{}'", v),
                    )
                })?,
            None => defaults.retry_initial_delay,
        };

        Ok(Self {
            skip_module_verification,
            write_attempts,
            retry_initial_delay,
        })
    }

    /// Retry policy for annotation writes
    pub fn write_retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.write_attempts).initial_delay(self.retry_initial_delay)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::validation_for_field(
            key,
            format!("expected a boolean, got '{}'", value),
        )),
    }
}
