//! Aggregation engine.
//!
//! Sums raw metrics per grouping key and time bucket and upserts one
//! aggregate per group. Each run is authoritative for the buckets it touches:
//! values are replaced, never incremented, so re-running a window is safe.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::Period;
use crate::store::{
    Dimensions, Metric, MetricFilter, MetricKind, MetricRepository, MetricStore, MetricStoreExt,
    StoreError,
};

/// Non-`.total` metric names (last segment) that are aggregated under their full name.
pub const AGGREGATED_DETAILS: [&str; 7] = [
    "commits",
    "directory_changes",
    "filetype_changes",
    "commit_type",
    "breaking_change",
    "code_additions",
    "code_deletions",
];

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("storage failure during aggregation: {0}")]
    Store(#[from] StoreError),
    #[error("empty aggregation window: {start} is not before {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Outcome of one aggregation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub period: Option<Period>,
    /// Raw metrics that fed the run.
    pub raw_metrics: usize,
    pub groups: usize,
    pub created: usize,
    pub updated: usize,
    /// Existing aggregates that already held the computed value.
    pub unchanged: usize,
}

/// How a raw metric name maps onto an aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRule {
    /// Aggregate name without the period suffix.
    pub base: String,
    /// Dimension that splits the groups further, if any.
    pub discriminator: Option<&'static str>,
}

impl AggregationRule {
    /// Rule for `name`, or `None` when the metric is not aggregated.
    pub fn for_metric(name: &str) -> Option<Self> {
        if let Some(stripped) = name.strip_suffix(".total") {
            let base: Vec<&str> = stripped.split('.').take(2).collect();
            return Some(Self {
                base: base.join("."),
                discriminator: None,
            });
        }

        let (_, last) = name.rsplit_once('.')?;
        if !AGGREGATED_DETAILS.contains(&last) {
            return None;
        }
        let discriminator = match last {
            "directory_changes" => Some("directory"),
            "filetype_changes" => Some("filetype"),
            "commit_type" => Some("type"),
            _ => None,
        };
        Some(Self {
            base: name.to_string(),
            discriminator,
        })
    }

    pub fn aggregate_name(&self, period: Period) -> String {
        format!("{}.{}", self.base, period.suffix())
    }
}

/// Grouping key of one aggregate within a run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    name: String,
    bucket: DateTime<Utc>,
    source: String,
    repository: Option<String>,
    discriminator: Option<(&'static str, String)>,
}

impl GroupKey {
    fn dimensions(&self, period: Period) -> Dimensions {
        let mut dims = Dimensions::new();
        dims.insert("source".to_string(), self.source.clone());
        dims.insert("time_period".to_string(), period.bucket_label(self.bucket));
        if let Some(repository) = &self.repository {
            dims.insert("repository".to_string(), repository.clone());
        }
        if let Some((key, value)) = &self.discriminator {
            dims.insert((*key).to_string(), value.clone());
        }
        dims
    }
}

/// Group raw metrics by aggregate key and sum their values.
fn group_metrics(metrics: &[Metric], period: Period) -> BTreeMap<GroupKey, f64> {
    let mut groups: BTreeMap<GroupKey, f64> = BTreeMap::new();
    for metric in metrics {
        let Some(rule) = AggregationRule::for_metric(&metric.name) else {
            continue;
        };
        let discriminator = rule.discriminator.map(|key| {
            let value = metric.dimension(key).unwrap_or(crate::event::UNKNOWN);
            (key, value.to_string())
        });
        let key = GroupKey {
            name: rule.aggregate_name(period),
            bucket: period.truncate(metric.timestamp),
            source: metric.source.clone(),
            repository: metric.dimension("repository").map(str::to_string),
            discriminator,
        };
        *groups.entry(key).or_insert(0.0) += metric.value;
    }
    groups
}

/// Collapses raw metrics into period aggregates through the store port.
pub struct AggregationEngine {
    store: Arc<dyn MetricStore>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    /// Aggregate every `period` bucket that overlaps `[start, end)`.
    ///
    /// The window is widened to whole buckets, since an aggregate always holds
    /// the sum of its entire bucket. Fetch, grouping and upserts share one
    /// store transaction; any storage error aborts the run and leaves the
    /// store untouched.
    pub fn aggregate(
        &self,
        period: Period,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AggregationSummary, AggregationError> {
        if start >= end {
            return Err(AggregationError::InvalidWindow { start, end });
        }

        let (start, _) = period.bucket_bounds(start);
        let (_, end) = period.bucket_bounds(end - ChronoDuration::nanoseconds(1));
        let filter = MetricFilter::new()
            .between(start, end)
            .of_kind(MetricKind::Raw);

        let summary = self
            .store
            .in_transaction(|repo| run(repo, period, &filter))
            .map_err(|e| {
                tracing::error!(
                    "AggregationEngine: {} run for [{}, {}) failed: {}",
                    period,
                    start,
                    end,
                    e
                );
                e
            })?;

        tracing::info!(
            "AggregationEngine: {} [{}, {}): {} raw metrics, {} groups ({} created, {} updated)",
            period,
            start,
            end,
            summary.raw_metrics,
            summary.groups,
            summary.created,
            summary.updated
        );
        Ok(summary)
    }

    /// Aggregate the whole bucket of `period` that contains `at`.
    pub fn aggregate_bucket(
        &self,
        period: Period,
        at: DateTime<Utc>,
    ) -> Result<AggregationSummary, AggregationError> {
        let (start, end) = period.bucket_bounds(at);
        self.aggregate(period, start, end)
    }
}

fn run(
    repo: &dyn MetricRepository,
    period: Period,
    filter: &MetricFilter,
) -> Result<AggregationSummary, StoreError> {
    let raw: Vec<Metric> = repo
        .list(filter)?
        .into_iter()
        .filter(|m| AggregationRule::for_metric(&m.name).is_some())
        .collect();
    let groups = group_metrics(&raw, period);

    let mut summary = AggregationSummary {
        period: Some(period),
        raw_metrics: raw.len(),
        groups: groups.len(),
        ..Default::default()
    };

    for (key, sum) in groups {
        let dims = key.dimensions(period);
        match repo.find_aggregate(&key.name, &dims)? {
            Some(existing) if existing.value == sum => summary.unchanged += 1,
            Some(existing) => {
                repo.update(&existing.with_value(sum))?;
                summary.updated += 1;
            }
            None => {
                repo.save(&Metric::aggregate(key.name.clone(), sum, key.bucket, key.source.clone(), dims))?;
                summary.created += 1;
            }
        }
    }

    tracing::debug!(
        "AggregationEngine: {} groups upserted ({} unchanged)",
        summary.groups,
        summary.unchanged
    );
    Ok(summary)
}
