//! Row computation shared by the batch and streaming collectors
//!
//! Pure functions: the same sample and spec info always produce the same rows.

use crate::models::{bytes_to_mib, MetricSample, ResultRow, SpecInfo};
use crate::options::{Granularity, ResourceKind};

/// Compute result rows for one sample against its matched specification
pub fn compute_rows(
    sample: &MetricSample,
    info: &SpecInfo,
    resource: ResourceKind,
    granularity: Granularity,
) -> Vec<ResultRow> {
    match granularity {
        Granularity::Aggregate => aggregate_row(sample, info, resource).into_iter().collect(),
        Granularity::PerSubUnit => sub_unit_rows(sample, info, resource),
    }
}

fn aggregate_row(sample: &MetricSample, info: &SpecInfo, resource: ResourceKind) -> Option<ResultRow> {
    let (usage, limit) = match resource {
        ResourceKind::Memory => {
            if !info.has_memory_limit() {
                return None;
            }
            let usage: f64 = sample
                .sub_units
                .iter()
                .filter(|s| info.sub_unit_memory_limit(&s.name).is_some())
                .map(|s| bytes_to_mib(s.memory_usage_bytes.unwrap_or(0)))
                .sum();
            (usage, info.memory_limit_mib)
        }
        ResourceKind::Cpu => {
            if !info.has_cpu_limit() {
                return None;
            }
            let usage: i64 = sample
                .sub_units
                .iter()
                .filter(|s| info.sub_unit_cpu_limit(&s.name).is_some())
                .map(|s| millicores(s.cpu_usage_millicores))
                .fold(0i64, i64::saturating_add);
            (usage as f64, info.cpu_limit_millicores as f64)
        }
    };

    ResultRow::new(&sample.namespace, sample.name.clone(), usage, limit)
}

fn sub_unit_rows(sample: &MetricSample, info: &SpecInfo, resource: ResourceKind) -> Vec<ResultRow> {
    sample
        .sub_units
        .iter()
        .filter_map(|sub_unit| {
            let (usage, limit) = match resource {
                ResourceKind::Memory => {
                    let limit = info.sub_unit_memory_limit(&sub_unit.name)?;
                    (bytes_to_mib(sub_unit.memory_usage_bytes.unwrap_or(0)), limit)
                }
                ResourceKind::Cpu => {
                    let limit = info.sub_unit_cpu_limit(&sub_unit.name)?;
                    (millicores(sub_unit.cpu_usage_millicores) as f64, limit as f64)
                }
            };
            let name = format!("{}:{}", sub_unit.name, sample.name);
            ResultRow::new(&sample.namespace, name, usage, limit)
        })
        .collect()
}

fn millicores(value: Option<u64>) -> i64 {
    value.map_or(0, |v| i64::try_from(v).unwrap_or(i64::MAX))
}
