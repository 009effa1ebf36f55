//! Layered settings for the performance knobs
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. `~/.config/kusage/config.{toml,json,yaml}` (or the file given with `--config`)
//! 3. `KUSAGE_*` environment variables, e.g. `KUSAGE_PAGE_SIZE=200`
//!
//! Explicit command-line flags are applied on top by the caller.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use usage_lib::options::default_max_concurrency;
use usage_lib::{BreakerConfig, CollectOptions, RetryConfig};

const ENV_PREFIX: &str = "KUSAGE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Items per list call
    pub page_size: u32,
    /// In-flight remote calls; unset means twice the CPU count
    pub max_concurrency: Option<usize>,
    /// Memory ceiling for in-flight pages in MiB
    pub max_memory_mb: u64,
    /// Deadline for the whole collection
    pub timeout_secs: u64,
    /// Pages buffered between fetchers and consumers
    pub queue_depth: usize,
    /// Rows buffered on the result stream
    pub result_buffer: usize,
    /// Samples parked while workloads are still being listed
    pub max_deferred: usize,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub breaker_max_failures: u32,
    pub breaker_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let options = CollectOptions::default();
        let retry = RetryConfig::default();
        let breaker = BreakerConfig::default();
        Self {
            page_size: options.page_size,
            max_concurrency: None,
            max_memory_mb: options.max_memory_mb,
            timeout_secs: options.timeout.as_secs(),
            queue_depth: options.queue_depth,
            result_buffer: options.result_buffer,
            max_deferred: options.max_deferred,
            retry_attempts: retry.max_attempts,
            retry_initial_delay_ms: retry.initial_delay.as_millis() as u64,
            retry_max_delay_ms: retry.max_delay.as_millis() as u64,
            breaker_max_failures: breaker.max_failures,
            breaker_timeout_secs: breaker.timeout.as_secs(),
        }
    }
}

impl Settings {
    /// Load settings; a missing default file is fine, a missing explicit one is not
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match explicit {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(base) = Self::default_file_base() {
                    builder = builder.add_source(config::File::from(base).required(false));
                }
            }
        }

        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Failed to parse settings")
    }

    /// Extension-less path; the config crate probes every supported format
    fn default_file_base() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("kusage").join("config"))
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            max_failures: self.breaker_max_failures,
            timeout: Duration::from_secs(self.breaker_timeout_secs),
        }
    }

    /// Options seeded from these settings, before flags are applied
    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            page_size: self.page_size,
            max_concurrency: self.max_concurrency.unwrap_or_else(default_max_concurrency),
            max_memory_mb: self.max_memory_mb,
            timeout: Duration::from_secs(self.timeout_secs),
            queue_depth: self.queue_depth,
            result_buffer: self.result_buffer,
            max_deferred: self.max_deferred,
            retry: self.retry(),
            ..CollectOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn settings_file(extension: &str, body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(extension)
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_match_library() {
        let settings = Settings::default();
        let options = settings.collect_options();

        assert_eq!(options.page_size, 500);
        assert_eq!(options.max_memory_mb, 2048);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.retry, RetryConfig::default());
        assert_eq!(settings.breaker(), BreakerConfig::default());
        assert!(options.max_concurrency >= 2);
    }

    #[test]
    fn test_load_toml_file() {
        let file = settings_file(
            ".toml",
            r#"
page_size = 200
max_concurrency = 3
timeout_secs = 90
breaker_max_failures = 2
"#,
        );

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.page_size, 200);
        assert_eq!(settings.max_concurrency, Some(3));
        assert_eq!(settings.breaker().max_failures, 2);
        // untouched keys keep their defaults
        assert_eq!(settings.max_memory_mb, 2048);

        let options = settings.collect_options();
        assert_eq!(options.max_concurrency, 3);
        assert_eq!(options.timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_load_json_file() {
        let file = settings_file(".json", r#"{ "retry_attempts": 5, "retry_initial_delay_ms": 250 }"#);

        let retry = Settings::load(Some(file.path())).unwrap().retry();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(Settings::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_malformed_value_is_an_error() {
        let file = settings_file(".toml", "page_size = \"lots\"\n");
        assert!(Settings::load(Some(file.path())).is_err());
    }
}
