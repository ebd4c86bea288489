use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::{fetch, DoraConfig, DoraFilter, Rating, RatingBands, Statistic, SECONDS_PER_HOUR};
use crate::classify::LEAD_TIME_STAGES;
use crate::store::{Metric, MetricStore, StoreResult};

/// Average time spent in one delivery stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageBreakdown {
    pub stage: String,
    pub average_hours: f64,
    /// Share of the summed stage averages.
    pub percentage: f64,
    pub sample_size: usize,
}

/// Time from commit to running in production.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTime {
    /// Hours.
    pub value: f64,
    pub rating: Rating,
    pub sample_size: usize,
    pub statistic: Statistic,
    /// Present when a breakdown was requested.
    pub stages: Option<Vec<StageBreakdown>>,
}

pub struct LeadTimeCalculator {
    store: Arc<dyn MetricStore>,
    config: DoraConfig,
    statistic: Statistic,
    breakdown: bool,
}

impl LeadTimeCalculator {
    pub fn new(store: Arc<dyn MetricStore>, config: DoraConfig) -> Self {
        Self {
            store,
            config,
            statistic: Statistic::Mean,
            breakdown: false,
        }
    }

    pub fn with_statistic(mut self, statistic: Statistic) -> Self {
        self.statistic = statistic;
        self
    }

    pub fn with_breakdown(mut self, breakdown: bool) -> Self {
        self.breakdown = breakdown;
        self
    }

    pub fn calculate(&self, period_days: u32, filter: &DoraFilter) -> StoreResult<LeadTime> {
        self.calculate_at(Utc::now(), period_days, filter)
    }

    pub fn calculate_at(
        &self,
        as_of: DateTime<Utc>,
        period_days: u32,
        filter: &DoraFilter,
    ) -> StoreResult<LeadTime> {
        let metrics = fetch(
            self.store.as_ref(),
            &self.config.lead_time_metric,
            as_of,
            period_days,
            filter,
        )?;

        let hours: Vec<f64> = metrics.iter().map(|m| m.value / SECONDS_PER_HOUR).collect();
        let value = self.statistic.compute(&hours);

        Ok(LeadTime {
            value,
            rating: RatingBands::LEAD_TIME.rate(value, hours.len()),
            sample_size: hours.len(),
            statistic: self.statistic,
            stages: self.breakdown.then(|| stage_breakdown(&metrics)),
        })
    }
}

/// Per-stage averages from the stage dimensions carried by lead time metrics.
fn stage_breakdown(metrics: &[Metric]) -> Vec<StageBreakdown> {
    let mut stages: Vec<StageBreakdown> = LEAD_TIME_STAGES
        .iter()
        .filter_map(|stage| {
            let values: Vec<f64> = metrics
                .iter()
                .filter_map(|m| m.dimension(stage)?.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .collect();
            if values.is_empty() {
                return None;
            }
            Some(StageBreakdown {
                stage: (*stage).to_string(),
                average_hours: super::mean(&values),
                percentage: 0.0,
                sample_size: values.len(),
            })
        })
        .collect();

    let total: f64 = stages.iter().map(|s| s.average_hours).sum();
    if total > 0.0 {
        for stage in &mut stages {
            stage.percentage = stage.average_hours / total * 100.0;
        }
    }
    stages
}
