//! Workload filtering
//!
//! Namespace and label exclusion patterns plus a local evaluator for
//! Kubernetes label selectors. The selector is also forwarded to the server;
//! evaluating it locally keeps results correct against servers that ignore it.

use crate::models::WorkloadSpec;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Render labels as `k1=v1,k2=v2` in key order
pub fn canonical_labels(labels: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in labels {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty requirement in selector {0:?}")]
    EmptyRequirement(String),
    #[error("unbalanced parentheses in selector {0:?}")]
    UnbalancedParens(String),
    #[error("invalid requirement {requirement:?}: {reason}")]
    InvalidRequirement { requirement: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals(key, value) => labels.get(key) == Some(value),
            Self::NotEquals(key, value) => labels.get(key) != Some(value),
            Self::Exists(key) => labels.contains_key(key),
            Self::NotExists(key) => !labels.contains_key(key),
            Self::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Self::NotIn(key, values) => labels.get(key).map_or(true, |v| !values.contains(v)),
        }
    }

    fn parse(raw: &str) -> Result<Self, SelectorError> {
        let invalid = |reason: &str| SelectorError::InvalidRequirement {
            requirement: raw.to_string(),
            reason: reason.to_string(),
        };

        if let Some(open) = raw.find('(') {
            let inner = raw[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| invalid("set must end with ')'"))?;
            let mut head = raw[..open].split_whitespace();
            let (Some(key), Some(op), None) = (head.next(), head.next(), head.next()) else {
                return Err(invalid("expected '<key> in (...)' or '<key> notin (...)'"));
            };
            let key = validate_key(key).map_err(invalid)?;
            let values = inner
                .split(',')
                .map(|v| validate_value(v.trim()).map_err(invalid))
                .collect::<Result<BTreeSet<_>, _>>()?;
            return match op {
                "in" => Ok(Self::In(key, values)),
                "notin" => Ok(Self::NotIn(key, values)),
                _ => Err(invalid("unknown set operator")),
            };
        }

        if let Some(key) = raw.strip_prefix('!') {
            return Ok(Self::NotExists(validate_key(key.trim()).map_err(invalid)?));
        }

        let binary = [("!=", false), ("==", true), ("=", true)]
            .into_iter()
            .find_map(|(op, equal)| raw.split_once(op).map(|(k, v)| (k, v, equal)));

        match binary {
            Some((key, value, equal)) => {
                let key = validate_key(key.trim()).map_err(invalid)?;
                let value = validate_value(value.trim()).map_err(invalid)?;
                Ok(if equal {
                    Self::Equals(key, value)
                } else {
                    Self::NotEquals(key, value)
                })
            }
            None => Ok(Self::Exists(validate_key(raw).map_err(invalid)?)),
        }
    }
}

fn validate_key(key: &str) -> Result<String, &'static str> {
    if key.is_empty() {
        return Err("empty key");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err("key contains invalid characters");
    }
    Ok(key.to_string())
}

fn validate_value(value: &str) -> Result<String, &'static str> {
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("value contains invalid characters");
    }
    Ok(value.to_string())
}

/// Parsed label selector; all requirements must hold
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let mut requirements = Vec::new();
        for part in split_top_level(raw)? {
            let part = part.trim();
            if part.is_empty() {
                return Err(SelectorError::EmptyRequirement(raw.to_string()));
            }
            requirements.push(Requirement::parse(part)?);
        }

        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// Split on commas outside parentheses
fn split_top_level(raw: &str) -> Result<Vec<&str>, SelectorError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (idx, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::UnbalancedParens(raw.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&raw[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(SelectorError::UnbalancedParens(raw.to_string()));
    }
    parts.push(&raw[start..]);
    Ok(parts)
}

/// Decides which workload specifications enter the correlation index
#[derive(Debug, Clone, Default)]
pub struct WorkloadFilter {
    pub exclude_namespaces: Option<Regex>,
    pub exclude_labels: Option<Regex>,
    pub selector: Option<LabelSelector>,
}

impl WorkloadFilter {
    pub fn admits(&self, spec: &WorkloadSpec) -> bool {
        if self
            .exclude_namespaces
            .as_ref()
            .is_some_and(|re| re.is_match(&spec.namespace))
        {
            return false;
        }

        if let Some(re) = &self.exclude_labels {
            if re.is_match(&canonical_labels(&spec.labels)) {
                return false;
            }
        }

        self.selector
            .as_ref()
            .map_or(true, |selector| selector.matches(&spec.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn spec(namespace: &str, pairs: &[(&str, &str)]) -> WorkloadSpec {
        WorkloadSpec {
            namespace: namespace.to_string(),
            name: "p1".to_string(),
            labels: labels(pairs),
            sub_units: vec![],
        }
    }

    #[test]
    fn test_canonical_labels_sorted() {
        assert_eq!(canonical_labels(&BTreeMap::new()), "");
        assert_eq!(
            canonical_labels(&labels(&[("tier", "web"), ("app", "shop")])),
            "app=shop,tier=web"
        );
    }

    #[test]
    fn test_equality_requirements() {
        let selector = LabelSelector::parse("app=shop, tier==web,env!=prod").unwrap();
        assert!(selector.matches(&labels(&[("app", "shop"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[
            ("app", "shop"),
            ("tier", "web"),
            ("env", "prod")
        ])));
        assert!(!selector.matches(&labels(&[("app", "shop")])));
    }

    #[test]
    fn test_existence_requirements() {
        let selector = LabelSelector::parse("app,!canary").unwrap();
        assert!(selector.matches(&labels(&[("app", "x")])));
        assert!(!selector.matches(&labels(&[("app", "x"), ("canary", "true")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_set_requirements() {
        let selector = LabelSelector::parse("env in (prod, staging),tier notin (batch)").unwrap();
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(selector.matches(&labels(&[("env", "staging"), ("tier", "web")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("tier", "batch")])));
    }

    #[test]
    fn test_malformed_selectors() {
        assert!(matches!(
            LabelSelector::parse("a=b,,c=d"),
            Err(SelectorError::EmptyRequirement(_))
        ));
        assert!(matches!(
            LabelSelector::parse("env in (prod"),
            Err(SelectorError::UnbalancedParens(_))
        ));
        assert!(matches!(
            LabelSelector::parse("env in prod)"),
            Err(SelectorError::UnbalancedParens(_))
        ));
        assert!(matches!(
            LabelSelector::parse("env within (prod)"),
            Err(SelectorError::InvalidRequirement { .. })
        ));
        assert!(LabelSelector::parse("=value").is_err());
    }

    #[test]
    fn test_empty_selector_matches_all() {
        let selector = LabelSelector::parse("  ").unwrap();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn test_filter_excludes_namespace() {
        let filter = WorkloadFilter {
            exclude_namespaces: Some(Regex::new("^default$").unwrap()),
            ..Default::default()
        };
        assert!(!filter.admits(&spec("default", &[])));
        assert!(filter.admits(&spec("default-2", &[])));
    }

    #[test]
    fn test_filter_excludes_labels() {
        let filter = WorkloadFilter {
            exclude_labels: Some(Regex::new("app=batch").unwrap()),
            selector: Some(LabelSelector::parse("team").unwrap()),
            ..Default::default()
        };
        assert!(!filter.admits(&spec("ns", &[("app", "batch"), ("team", "a")])));
        assert!(filter.admits(&spec("ns", &[("app", "web"), ("team", "a")])));
        assert!(!filter.admits(&spec("ns", &[("app", "web")])));
    }
}
