//! Core data models for workload usage analysis

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Build the key used to join specifications with usage samples
pub fn correlation_key(namespace: &str, name: &str) -> String {
    let mut key = String::with_capacity(namespace.len() + name.len() + 1);
    key.push_str(namespace);
    key.push('/');
    key.push_str(name);
    key
}

/// Resource limits declared for one sub-unit (container) of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubUnitSpec {
    pub name: String,
    pub memory_limit_bytes: Option<u64>,
    pub cpu_limit_millicores: Option<u64>,
}

/// Workload specification as returned by the orchestration API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub sub_units: Vec<SubUnitSpec>,
}

impl WorkloadSpec {
    pub fn key(&self) -> String {
        correlation_key(&self.namespace, &self.name)
    }

    /// Sum of memory limits over sub-units that declare one
    pub fn memory_limit_bytes(&self) -> u64 {
        self.sub_units
            .iter()
            .filter_map(|s| s.memory_limit_bytes)
            .fold(0, u64::saturating_add)
    }

    /// Sum of CPU limits over sub-units that declare one
    pub fn cpu_limit_millicores(&self) -> u64 {
        self.sub_units
            .iter()
            .filter_map(|s| s.cpu_limit_millicores)
            .fold(0, u64::saturating_add)
    }
}

/// Observed usage for one sub-unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubUnitUsage {
    pub name: String,
    pub memory_usage_bytes: Option<u64>,
    pub cpu_usage_millicores: Option<u64>,
}

/// Usage sample for a workload from the metrics API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub namespace: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub window: Duration,
    pub sub_units: Vec<SubUnitUsage>,
}

impl MetricSample {
    pub fn key(&self) -> String {
        correlation_key(&self.namespace, &self.name)
    }
}

/// Pre-computed limits for a workload, held by the correlation index
///
/// Memory is converted to MiB and CPU kept in millicores once, when the
/// record is built, so every join reads the same values.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecInfo {
    pub memory_limit_mib: f64,
    pub cpu_limit_millicores: i64,
    pub sub_unit_memory_mib: HashMap<String, f64>,
    pub sub_unit_cpu_millicores: HashMap<String, i64>,
}

impl SpecInfo {
    pub fn from_spec(spec: &WorkloadSpec) -> Self {
        let mut info = Self {
            memory_limit_mib: bytes_to_mib(spec.memory_limit_bytes()),
            cpu_limit_millicores: saturating_i64(spec.cpu_limit_millicores()),
            sub_unit_memory_mib: HashMap::with_capacity(spec.sub_units.len()),
            sub_unit_cpu_millicores: HashMap::with_capacity(spec.sub_units.len()),
        };

        for sub_unit in &spec.sub_units {
            if let Some(bytes) = sub_unit.memory_limit_bytes {
                info.sub_unit_memory_mib
                    .insert(sub_unit.name.clone(), bytes_to_mib(bytes));
            }
            if let Some(millis) = sub_unit.cpu_limit_millicores {
                info.sub_unit_cpu_millicores
                    .insert(sub_unit.name.clone(), saturating_i64(millis));
            }
        }

        info
    }

    pub fn has_memory_limit(&self) -> bool {
        self.memory_limit_mib > 0.0
    }

    pub fn has_cpu_limit(&self) -> bool {
        self.cpu_limit_millicores > 0
    }

    /// Positive memory limit for a sub-unit, if declared
    pub fn sub_unit_memory_limit(&self, name: &str) -> Option<f64> {
        self.sub_unit_memory_mib
            .get(name)
            .copied()
            .filter(|limit| *limit > 0.0)
    }

    /// Positive CPU limit for a sub-unit, if declared
    pub fn sub_unit_cpu_limit(&self, name: &str) -> Option<i64> {
        self.sub_unit_cpu_millicores
            .get(name)
            .copied()
            .filter(|limit| *limit > 0)
    }
}

/// A single ranked result
///
/// `usage` and `limit` are MiB for memory and millicores for CPU. For
/// per-sub-unit rows `name` is `<subunit>:<workload>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub namespace: String,
    pub name: String,
    pub usage: f64,
    pub limit: f64,
    pub percentage: f64,
}

impl ResultRow {
    /// Build a row, returning None when the limit cannot act as a denominator
    pub fn new(namespace: &str, name: String, usage: f64, limit: f64) -> Option<Self> {
        if limit <= 0.0 || !limit.is_finite() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            name,
            usage,
            limit,
            percentage: usage / limit * 100.0,
        })
    }

    /// Split a per-sub-unit name into `(subunit, workload)`
    pub fn sub_unit_parts(&self) -> Option<(&str, &str)> {
        self.name.split_once(':')
    }
}

pub fn bytes_to_mib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkloadSpec {
        WorkloadSpec {
            namespace: "default".to_string(),
            name: "p1".to_string(),
            labels: BTreeMap::new(),
            sub_units: vec![
                SubUnitSpec {
                    name: "c1".to_string(),
                    memory_limit_bytes: Some(512 * 1024 * 1024),
                    cpu_limit_millicores: Some(500),
                },
                SubUnitSpec {
                    name: "c2".to_string(),
                    memory_limit_bytes: Some(256 * 1024 * 1024),
                    cpu_limit_millicores: None,
                },
                SubUnitSpec {
                    name: "sidecar".to_string(),
                    memory_limit_bytes: None,
                    cpu_limit_millicores: None,
                },
            ],
        }
    }

    #[test]
    fn test_correlation_key() {
        assert_eq!(correlation_key("default", "p1"), "default/p1");
        assert_eq!(spec().key(), "default/p1");
    }

    #[test]
    fn test_aggregate_limits_skip_missing() {
        let spec = spec();
        assert_eq!(spec.memory_limit_bytes(), 768 * 1024 * 1024);
        assert_eq!(spec.cpu_limit_millicores(), 500);
    }

    #[test]
    fn test_huge_limits_saturate() {
        let mut spec = spec();
        for sub_unit in &mut spec.sub_units {
            sub_unit.cpu_limit_millicores = Some(u64::MAX);
        }
        assert_eq!(spec.cpu_limit_millicores(), u64::MAX);
        assert_eq!(SpecInfo::from_spec(&spec).cpu_limit_millicores, i64::MAX);
    }

    #[test]
    fn test_spec_info_precomputes_limits() {
        let info = SpecInfo::from_spec(&spec());
        assert_eq!(info.memory_limit_mib, 768.0);
        assert_eq!(info.cpu_limit_millicores, 500);
        assert_eq!(info.sub_unit_memory_limit("c1"), Some(512.0));
        assert_eq!(info.sub_unit_cpu_limit("c1"), Some(500));
        assert_eq!(info.sub_unit_cpu_limit("c2"), None);
        assert_eq!(info.sub_unit_memory_limit("sidecar"), None);
        assert!(info.has_memory_limit());
        assert!(info.has_cpu_limit());
    }

    #[test]
    fn test_result_row_rejects_zero_limit() {
        assert!(ResultRow::new("ns", "p".to_string(), 1.0, 0.0).is_none());
        let row = ResultRow::new("ns", "p".to_string(), 150.0, 100.0).unwrap();
        assert_eq!(row.percentage, 150.0);
    }

    #[test]
    fn test_sub_unit_parts() {
        let row = ResultRow::new("ns", "c1:p1".to_string(), 1.0, 2.0).unwrap();
        assert_eq!(row.sub_unit_parts(), Some(("c1", "p1")));
    }
}
