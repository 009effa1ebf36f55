//! Remote API boundary
//!
//! The orchestrators read workload specifications and usage samples through
//! [`ClusterSource`], one page per call. The Kubernetes implementation lives in
//! the CLI crate; tests use in-memory sources.

use crate::models::{MetricSample, WorkloadSpec};
use anyhow::Result;

pub use async_trait::async_trait;

/// Parameters of one paged list call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` lists across all namespaces
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub limit: u32,
    /// Opaque cursor returned by the previous page
    pub continue_token: Option<String>,
}

impl PageRequest {
    /// Request for the page following `token`
    pub fn next(&self, token: String) -> Self {
        Self {
            continue_token: Some(token),
            ..self.clone()
        }
    }
}

/// One page of list results
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` or empty marks the last page
    pub continue_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            continue_token: None,
        }
    }

    /// Token for the next request, if the server reported more pages
    pub fn next_token(&self) -> Option<&str> {
        self.continue_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Paged read access to workload specifications and usage samples
#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// List one page of workload specifications
    async fn list_workloads(&self, request: &PageRequest) -> Result<Page<WorkloadSpec>>;

    /// List one page of usage samples
    async fn list_samples(&self, request: &PageRequest) -> Result<Page<MetricSample>>;
}
