//! Kubernetes implementation of the cluster source
//!
//! Pods come from the core API and usage from `metrics.k8s.io/v1beta1`
//! PodMetrics. Quantities are converted to bytes and millicores here, once,
//! so the library only ever sees integers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use usage_lib::quantity::{to_bytes, to_millicores};
use usage_lib::{
    ClusterSource, MetricSample, Page, PageRequest, SubUnitSpec, SubUnitUsage, WorkloadSpec,
};

const READ_TIMEOUT: Duration = Duration::from_secs(60);

const MEMORY: &str = "memory";
const CPU: &str = "cpu";

pub struct KubeSource {
    client: Client,
    pod_metrics: ApiResource,
}

impl KubeSource {
    /// Connect using `kubeconfig` if given, otherwise the usual inference chain
    /// (KUBECONFIG / ~/.kube/config, then in-cluster)
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let mut config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context("Failed to load kubeconfig")?
            }
            None => Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?,
        };
        config.read_timeout = Some(READ_TIMEOUT);

        let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");

        Ok(Self {
            client,
            pod_metrics: ApiResource::from_gvk_with_plural(&gvk, "pods"),
        })
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pod_metrics(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.pod_metrics),
            None => Api::all_with(self.client.clone(), &self.pod_metrics),
        }
    }
}

fn list_params(request: &PageRequest) -> ListParams {
    let mut params = ListParams::default().limit(request.limit);
    if let Some(selector) = request.label_selector.as_deref() {
        params = params.labels(selector);
    }
    if let Some(token) = request.continue_token.as_deref() {
        params = params.continue_token(token);
    }
    params
}

#[async_trait]
impl ClusterSource for KubeSource {
    async fn list_workloads(&self, request: &PageRequest) -> Result<Page<WorkloadSpec>> {
        let list = self
            .pods(request.namespace.as_deref())
            .list(&list_params(request))
            .await
            .context("Failed to list pods")?;

        Ok(Page {
            items: list.items.into_iter().map(workload_from_pod).collect(),
            continue_token: list.metadata.continue_,
        })
    }

    async fn list_samples(&self, request: &PageRequest) -> Result<Page<MetricSample>> {
        let list = self
            .pod_metrics(request.namespace.as_deref())
            .list(&list_params(request))
            .await
            .context("Failed to list pod metrics (is metrics-server installed?)")?;

        let mut items = Vec::with_capacity(list.items.len());
        for object in list.items {
            match sample_from_metrics(object) {
                Ok(sample) => items.push(sample),
                Err(err) => debug!(error = %err, "Skipping malformed PodMetrics object"),
            }
        }

        Ok(Page {
            items,
            continue_token: list.metadata.continue_,
        })
    }
}

fn workload_from_pod(pod: Pod) -> WorkloadSpec {
    let namespace = pod.metadata.namespace.unwrap_or_default();
    let name = pod.metadata.name.unwrap_or_default();

    let sub_units = pod
        .spec
        .map(|spec| spec.containers)
        .unwrap_or_default()
        .into_iter()
        .map(|container| {
            let limits = container
                .resources
                .and_then(|resources| resources.limits)
                .unwrap_or_default();
            SubUnitSpec {
                memory_limit_bytes: quantity(&limits, MEMORY, &container.name, to_bytes),
                cpu_limit_millicores: quantity(&limits, CPU, &container.name, to_millicores),
                name: container.name,
            }
        })
        .collect();

    WorkloadSpec {
        namespace,
        name,
        labels: pod.metadata.labels.unwrap_or_default(),
        sub_units,
    }
}

/// Convert one resource entry; unparseable quantities count as absent
fn quantity<E: std::fmt::Display>(
    values: &BTreeMap<String, Quantity>,
    resource: &str,
    container: &str,
    convert: fn(&str) -> std::result::Result<u64, E>,
) -> Option<u64> {
    let raw = values.get(resource)?;
    match convert(&raw.0) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(container, resource, quantity = %raw.0, error = %err, "Ignoring invalid quantity");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct PodMetricsBody {
    timestamp: Option<DateTime<Utc>>,
    window: Option<String>,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, Quantity>,
}

fn sample_from_metrics(object: DynamicObject) -> Result<MetricSample> {
    let body: PodMetricsBody =
        serde_json::from_value(object.data).context("Unexpected PodMetrics shape")?;

    let sub_units = body
        .containers
        .into_iter()
        .map(|container| SubUnitUsage {
            memory_usage_bytes: quantity(&container.usage, MEMORY, &container.name, to_bytes),
            cpu_usage_millicores: quantity(&container.usage, CPU, &container.name, to_millicores),
            name: container.name,
        })
        .collect();

    Ok(MetricSample {
        namespace: object.metadata.namespace.unwrap_or_default(),
        name: object.metadata.name.unwrap_or_default(),
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        window: body
            .window
            .as_deref()
            .and_then(parse_window)
            .unwrap_or_default(),
        sub_units,
    })
}

/// Parse a metav1.Duration string such as `30s`, `1m0s` or `1.5s`
fn parse_window(raw: &str) -> Option<Duration> {
    let mut total = 0.0_f64;
    let mut rest = raw.trim();
    if rest.is_empty() {
        return None;
    }

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return None,
        };
        total += value * seconds;
        rest = &rest[unit_len..];
    }

    Some(Duration::from_secs_f64(total))
}
