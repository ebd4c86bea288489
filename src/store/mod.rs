//! Metric storage.
//!
//! The rest of the crate only talks to the [`MetricStore`] port. Two adapters
//! ship with it: SQLite for the worker binary and an in-memory store used by
//! tests and embedders.

mod memory;
mod models;
mod sqlite;

pub use memory::*;
pub use models::*;
pub use sqlite::*;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("aggregate {name} already exists for {fingerprint}")]
    Conflict { name: String, fingerprint: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Query over stored metrics. Unset fields do not constrain the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFilter {
    pub name: Option<String>,
    /// Glob over the metric name; `*` matches any run of characters.
    pub name_pattern: Option<String>,
    pub source: Option<String>,
    /// Every listed dimension must be present with the same value.
    pub dimensions: Dimensions,
    /// Inclusive lower bound.
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end_time: Option<DateTime<Utc>>,
    pub kind: Option<MetricKind>,
}

impl MetricFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn matching(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn before(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn of_kind(mut self, kind: MetricKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Evaluate the filter in memory.
    pub fn matches(&self, metric: &Metric) -> bool {
        if self.name.as_deref().is_some_and(|n| n != metric.name) {
            return false;
        }
        if let Some(pattern) = &self.name_pattern {
            if !glob_matches(pattern, &metric.name) {
                return false;
            }
        }
        if self.source.as_deref().is_some_and(|s| s != metric.source) {
            return false;
        }
        if self.start_time.is_some_and(|start| metric.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| metric.timestamp >= end) {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != metric.kind) {
            return false;
        }
        self.dimensions
            .iter()
            .all(|(k, v)| metric.dimension(k) == Some(v.as_str()))
    }
}

/// Match `name` against a glob where `*` is the only wildcard.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }

    let mut rest = &name[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Persistence operations the core needs.
pub trait MetricRepository {
    /// Persist a new metric and return it with its id.
    fn save(&self, metric: &Metric) -> StoreResult<Metric>;

    fn save_batch(&self, metrics: &[Metric]) -> StoreResult<Vec<Metric>> {
        metrics.iter().map(|m| self.save(m)).collect()
    }

    /// Metrics matching `filter`, ordered by timestamp then id.
    fn list(&self, filter: &MetricFilter) -> StoreResult<Vec<Metric>>;

    /// The aggregate with exactly this name and dimension set.
    fn find_aggregate(&self, name: &str, dimensions: &Dimensions) -> StoreResult<Option<Metric>>;

    /// Overwrite a persisted metric identified by its id.
    fn update(&self, metric: &Metric) -> StoreResult<()>;

    /// Delete matching metrics and return how many were removed.
    fn delete(&self, filter: &MetricFilter) -> StoreResult<usize>;
}

/// A shareable repository with a transactional boundary.
pub trait MetricStore: MetricRepository + Send + Sync {
    /// Run `work` against a repository bound to one transaction.
    ///
    /// Writes become visible only if `work` returns `Ok`; an error rolls back
    /// everything done inside the closure.
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn MetricRepository) -> StoreResult<()>,
    ) -> StoreResult<()>;
}

/// Value-returning wrapper over [`MetricStore::transaction`].
pub trait MetricStoreExt {
    fn in_transaction<T>(
        &self,
        work: impl FnMut(&dyn MetricRepository) -> StoreResult<T>,
    ) -> StoreResult<T>;
}

impl<S: MetricStore + ?Sized> MetricStoreExt for S {
    fn in_transaction<T>(
        &self,
        mut work: impl FnMut(&dyn MetricRepository) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut output = None;
        self.transaction(&mut |repo: &dyn MetricRepository| {
            output = Some(work(repo)?);
            Ok(())
        })?;
        output.ok_or_else(|| StoreError::Unavailable("transaction produced no result".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("github.push.total", "github.push.total"));
        assert!(glob_matches("*.total", "github.push.total"));
        assert!(glob_matches("github.*", "github.push.total"));
        assert!(glob_matches("github.*.total", "github.push.total"));
        assert!(glob_matches("*", "anything"));
        assert!(!glob_matches("*.daily", "github.push.total"));
        assert!(!glob_matches("github.*.total", "gitlab.push.total"));
        assert!(!glob_matches("a*a", "a"));
    }

    #[test]
    fn test_filter_matches() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut dims = Dimensions::new();
        dims.insert("repository".to_string(), "acme/api".to_string());
        let metric = Metric::new("github.push.total", 1.0, ts, "github", dims);

        assert!(MetricFilter::new().matches(&metric));
        assert!(MetricFilter::new()
            .named("github.push.total")
            .from_source("github")
            .dimension("repository", "acme/api")
            .of_kind(MetricKind::Raw)
            .matches(&metric));
        assert!(!MetricFilter::new().dimension("repository", "acme/web").matches(&metric));
        assert!(!MetricFilter::new().of_kind(MetricKind::Aggregate).matches(&metric));

        let end = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert!(!MetricFilter::new().before(end).matches(&metric));
        assert!(MetricFilter::new()
            .between(end, end + chrono::Duration::seconds(1))
            .matches(&metric));
    }
}
