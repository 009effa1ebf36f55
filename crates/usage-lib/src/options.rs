//! Collection options consumed by the orchestrators

use crate::error::CollectError;
use crate::filter::{LabelSelector, WorkloadFilter};
use crate::resilience::RetryConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Rows per workload or per sub-unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Aggregate,
    PerSubUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Memory,
    Cpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!("unknown resource {other:?} (expected memory or cpu)")),
        }
    }
}

/// What to do with a sample whose workload is not indexed yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// Drop it immediately
    Drop,
    /// Park it until the specification stream ends, then retry once
    #[default]
    Defer,
}

impl FromStr for MissPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "defer" => Ok(Self::Defer),
            other => Err(format!("unknown miss policy {other:?} (expected drop or defer)")),
        }
    }
}

/// Default in-flight call ceiling: twice the detected hardware parallelism
pub fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

/// Options for a single collection run
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Namespace to list; `None` lists all namespaces
    pub namespace: Option<String>,
    /// Label selector sent to the server and re-checked locally
    pub label_selector: Option<String>,
    pub exclude_namespaces: Option<Regex>,
    /// Matched against the canonical `k=v,...` label string
    pub exclude_labels: Option<Regex>,
    pub granularity: Granularity,
    pub resource: ResourceKind,
    /// Items per list page (default: 500)
    pub page_size: u32,
    /// In-flight remote calls (default: 2 × hardware parallelism)
    pub max_concurrency: usize,
    /// Memory ceiling for the resource pool in MiB (default: 2048)
    pub max_memory_mb: u64,
    /// Deadline for the whole run (default: 30s)
    pub timeout: Duration,
    /// Pages buffered per fetcher queue (default: 10)
    pub queue_depth: usize,
    /// Rows buffered on the outbound stream (default: 1000)
    pub result_buffer: usize,
    /// Samples parked under `MissPolicy::Defer` (default: 10000)
    pub max_deferred: usize,
    pub retry: RetryConfig,
    pub miss_policy: MissPolicy,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            exclude_namespaces: None,
            exclude_labels: None,
            granularity: Granularity::Aggregate,
            resource: ResourceKind::Memory,
            page_size: 500,
            max_concurrency: default_max_concurrency(),
            max_memory_mb: 2048,
            timeout: Duration::from_secs(30),
            queue_depth: 10,
            result_buffer: 1000,
            max_deferred: 10_000,
            retry: RetryConfig::default(),
            miss_policy: MissPolicy::Defer,
        }
    }
}

impl CollectOptions {
    pub fn validate(&self) -> Result<(), CollectError> {
        let invalid = |msg: &str| Err(CollectError::InvalidConfig(msg.to_string()));

        if self.timeout.is_zero() {
            return invalid("timeout must be positive");
        }
        if self.page_size == 0 {
            return invalid("page size must be positive");
        }
        if self.max_concurrency == 0 {
            return invalid("max concurrency must be positive");
        }
        if self.max_memory_mb == 0 {
            return invalid("max memory must be positive");
        }
        if self.queue_depth == 0 || self.result_buffer == 0 {
            return invalid("queue depth and result buffer must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry attempts must be positive");
        }
        self.selector()?;
        Ok(())
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn selector(&self) -> Result<Option<LabelSelector>, CollectError> {
        self.label_selector
            .as_deref()
            .map(LabelSelector::parse)
            .transpose()
            .map(|selector| selector.filter(|s| !s.is_empty()))
            .map_err(|e| CollectError::InvalidConfig(e.to_string()))
    }

    pub fn filter(&self) -> Result<WorkloadFilter, CollectError> {
        Ok(WorkloadFilter {
            exclude_namespaces: self.exclude_namespaces.clone(),
            exclude_labels: self.exclude_labels.clone(),
            selector: self.selector()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CollectOptions::default();
        assert_eq!(options.page_size, 500);
        assert_eq!(options.max_memory_mb, 2048);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.queue_depth, 10);
        assert_eq!(options.result_buffer, 1000);
        assert_eq!(options.miss_policy, MissPolicy::Defer);
        assert!(options.max_concurrency >= 2);
        assert_eq!(options.max_concurrency % 2, 0);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut CollectOptions)>> = vec![
            Box::new(|o| o.timeout = Duration::ZERO),
            Box::new(|o| o.page_size = 0),
            Box::new(|o| o.max_concurrency = 0),
            Box::new(|o| o.max_memory_mb = 0),
            Box::new(|o| o.queue_depth = 0),
            Box::new(|o| o.retry.max_attempts = 0),
            Box::new(|o| o.label_selector = Some("a=b,,c".to_string())),
        ];

        for mutate in cases {
            let mut options = CollectOptions::default();
            mutate(&mut options);
            assert!(matches!(
                options.validate(),
                Err(CollectError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_empty_selector_is_none() {
        let options = CollectOptions {
            label_selector: Some(String::new()),
            ..Default::default()
        };
        assert!(options.selector().unwrap().is_none());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("CPU".parse::<ResourceKind>().unwrap(), ResourceKind::Cpu);
        assert_eq!("drop".parse::<MissPolicy>().unwrap(), MissPolicy::Drop);
        assert!("disk".parse::<ResourceKind>().is_err());
    }
}
