//! Ranking of collected rows

use crate::models::ResultRow;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Primary sort key; every key sorts descending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Percentage,
    Usage,
    Limit,
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentage => f.write_str("pct"),
            Self::Usage => f.write_str("usage"),
            Self::Limit => f.write_str("limit"),
        }
    }
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pct" | "percentage" => Ok(Self::Percentage),
            "usage" => Ok(Self::Usage),
            "limit" => Ok(Self::Limit),
            other => Err(format!("unknown sort key {other:?} (expected pct, usage or limit)")),
        }
    }
}

impl SortKey {
    fn value(self, row: &ResultRow) -> f64 {
        match self {
            Self::Percentage => row.percentage,
            Self::Usage => row.usage,
            Self::Limit => row.limit,
        }
    }
}

/// Sort descending by `key`; ties fall back to namespace then name, ascending
pub fn sort_rows(rows: &mut [ResultRow], key: SortKey) {
    rows.sort_by(|a, b| compare(a, b, key));
}

fn compare(a: &ResultRow, b: &ResultRow, key: SortKey) -> Ordering {
    key.value(b)
        .total_cmp(&key.value(a))
        .then_with(|| a.namespace.cmp(&b.namespace))
        .then_with(|| a.name.cmp(&b.name))
}

/// Keep the first `n` rows; `0` keeps everything
pub fn top_n(mut rows: Vec<ResultRow>, n: usize) -> Vec<ResultRow> {
    if n > 0 && n < rows.len() {
        rows.truncate(n);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(namespace: &str, name: &str, usage: f64, limit: f64) -> ResultRow {
        ResultRow::new(namespace, name.to_string(), usage, limit).unwrap()
    }

    fn names(rows: &[ResultRow]) -> Vec<&str> {
        rows.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_sort_by_percentage_descending() {
        let mut rows = vec![
            row("default", "low", 10.0, 100.0),
            row("default", "high", 90.0, 100.0),
            row("default", "mid", 100.0, 200.0),
        ];
        sort_rows(&mut rows, SortKey::Percentage);
        assert_eq!(names(&rows), ["high", "mid", "low"]);
    }

    #[test]
    fn test_sort_by_usage_and_limit() {
        let mut rows = vec![
            row("default", "small", 50.0, 100.0),
            row("default", "big", 60.0, 1000.0),
        ];

        sort_rows(&mut rows, SortKey::Usage);
        assert_eq!(names(&rows), ["big", "small"]);

        rows.reverse();
        sort_rows(&mut rows, SortKey::Limit);
        assert_eq!(names(&rows), ["big", "small"]);
    }

    #[test]
    fn test_ties_are_broken_by_identity() {
        let mut rows = vec![
            row("web", "b", 50.0, 100.0),
            row("db", "z", 50.0, 100.0),
            row("web", "a", 50.0, 100.0),
        ];
        sort_rows(&mut rows, SortKey::Percentage);

        let identity: Vec<_> = rows
            .iter()
            .map(|r| (r.namespace.as_str(), r.name.as_str()))
            .collect();
        assert_eq!(identity, [("db", "z"), ("web", "a"), ("web", "b")]);
    }

    #[test]
    fn test_top_n() {
        let rows = vec![
            row("default", "a", 3.0, 10.0),
            row("default", "b", 2.0, 10.0),
            row("default", "c", 1.0, 10.0),
        ];

        assert_eq!(top_n(rows.clone(), 2).len(), 2);
        assert_eq!(top_n(rows.clone(), 0).len(), 3);
        assert_eq!(top_n(rows.clone(), 3).len(), 3);
        assert_eq!(top_n(rows, 50).len(), 3);
    }

    #[test]
    fn test_parse_sort_key() {
        assert_eq!("pct".parse::<SortKey>().unwrap(), SortKey::Percentage);
        assert_eq!("USAGE".parse::<SortKey>().unwrap(), SortKey::Usage);
        assert_eq!("limit".parse::<SortKey>().unwrap(), SortKey::Limit);
        assert!("memory".parse::<SortKey>().is_err());
    }
}
