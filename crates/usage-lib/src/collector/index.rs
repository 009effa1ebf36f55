//! Correlation index
//!
//! Concurrent map from correlation key to pre-computed limits. Backed by
//! `DashMap`, whose sharded locks let indexers insert while correlators read
//! without a global lock. Keys rejected by the filter are remembered so their
//! samples can be dropped at once instead of waiting for a specification that
//! will never arrive.

use super::rows::compute_rows;
use crate::filter::WorkloadFilter;
use crate::models::{MetricSample, ResultRow, SpecInfo, WorkloadSpec};
use crate::observability::CollectorMetrics;
use crate::options::{Granularity, ResourceKind};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

/// Result of looking a sample up in the index
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Matched; possibly empty when no row had a usable limit
    Rows(Vec<ResultRow>),
    /// The workload was filtered out
    Excluded,
    /// No specification indexed for this key (yet)
    Missing,
}

pub struct CorrelationIndex {
    entries: DashMap<String, Arc<SpecInfo>>,
    excluded: DashSet<String>,
    filter: WorkloadFilter,
    metrics: CollectorMetrics,
}

impl CorrelationIndex {
    pub fn new(filter: WorkloadFilter) -> Self {
        Self {
            entries: DashMap::new(),
            excluded: DashSet::new(),
            filter,
            metrics: CollectorMetrics::new(),
        }
    }

    /// Index one specification; returns false if the filter rejected it
    ///
    /// A repeated key overwrites the earlier entry.
    pub fn insert(&self, spec: &WorkloadSpec) -> bool {
        let key = spec.key();

        if !self.filter.admits(spec) {
            self.entries.remove(&key);
            self.excluded.insert(key);
            self.metrics.inc_workloads_excluded();
            return false;
        }

        self.excluded.remove(&key);
        self.entries.insert(key, Arc::new(SpecInfo::from_spec(spec)));
        self.metrics.inc_workloads_indexed();
        true
    }

    /// Index a page; returns `(indexed, excluded)` counts
    pub fn index_page(&self, page: Vec<WorkloadSpec>) -> (usize, usize) {
        let indexed = page.iter().filter(|spec| self.insert(spec)).count();
        (indexed, page.len() - indexed)
    }

    pub fn get(&self, key: &str) -> Option<Arc<SpecInfo>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_excluded(&self, key: &str) -> bool {
        self.excluded.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Join a sample with its specification and compute rows
    pub fn correlate(
        &self,
        sample: &MetricSample,
        resource: ResourceKind,
        granularity: Granularity,
    ) -> Correlation {
        let key = sample.key();
        // clone the Arc so no shard lock is held while computing
        match self.get(&key) {
            Some(info) => {
                self.metrics.inc_samples_processed();
                Correlation::Rows(compute_rows(sample, &info, resource, granularity))
            }
            None if self.is_excluded(&key) => Correlation::Excluded,
            None => Correlation::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubUnitSpec, SubUnitUsage};
    use chrono::Utc;
    use regex::Regex;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn spec(namespace: &str, name: &str, limit_mib: u64) -> WorkloadSpec {
        WorkloadSpec {
            namespace: namespace.to_string(),
            name: name.to_string(),
            labels: BTreeMap::new(),
            sub_units: vec![SubUnitSpec {
                name: "c1".to_string(),
                memory_limit_bytes: Some(limit_mib * MIB),
                cpu_limit_millicores: None,
            }],
        }
    }

    fn sample(namespace: &str, name: &str, usage_mib: u64) -> MetricSample {
        MetricSample {
            namespace: namespace.to_string(),
            name: name.to_string(),
            timestamp: Utc::now(),
            window: Duration::from_secs(30),
            sub_units: vec![SubUnitUsage {
                name: "c1".to_string(),
                memory_usage_bytes: Some(usage_mib * MIB),
                cpu_usage_millicores: Some(5),
            }],
        }
    }

    #[test]
    fn test_last_write_wins() {
        let index = CorrelationIndex::new(WorkloadFilter::default());
        assert!(index.insert(&spec("default", "p1", 512)));
        assert!(index.insert(&spec("default", "p1", 1024)));

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("default/p1").unwrap().memory_limit_mib, 1024.0);
    }

    #[test]
    fn test_excluded_keys_are_remembered() {
        let index = CorrelationIndex::new(WorkloadFilter {
            exclude_namespaces: Some(Regex::new("^kube-system$").unwrap()),
            ..Default::default()
        });

        let (indexed, excluded) =
            index.index_page(vec![spec("default", "p1", 512), spec("kube-system", "dns", 64)]);
        assert_eq!((indexed, excluded), (1, 1));
        assert!(index.is_excluded("kube-system/dns"));
        assert!(index.get("kube-system/dns").is_none());

        let resource = ResourceKind::Memory;
        let granularity = Granularity::Aggregate;
        assert_eq!(
            index.correlate(&sample("kube-system", "dns", 10), resource, granularity),
            Correlation::Excluded
        );
        assert_eq!(
            index.correlate(&sample("default", "p9", 10), resource, granularity),
            Correlation::Missing
        );
        match index.correlate(&sample("default", "p1", 256), resource, granularity) {
            Correlation::Rows(rows) => assert_eq!(rows[0].percentage, 50.0),
            other => panic!("unexpected correlation: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_are_not_lost() {
        let index = Arc::new(CorrelationIndex::new(WorkloadFilter::default()));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    index.insert(&spec("ns", &format!("w{worker}-{i}"), 128));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(index.len(), 2000);
    }
}
