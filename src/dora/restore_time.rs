use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::{fetch, mean, percentile, DoraConfig, DoraFilter, Rating, RatingBands, Statistic, SECONDS_PER_HOUR};
use crate::store::{MetricStore, StoreResult};

/// Time to restore service after an incident, in hours.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreTime {
    /// The selected statistic, in hours.
    pub value: f64,
    pub rating: Rating,
    pub sample_size: usize,
    pub statistic: Statistic,
    pub mean_hours: f64,
    pub median_hours: f64,
    pub p95_hours: f64,
}

pub struct RestoreTimeCalculator {
    store: Arc<dyn MetricStore>,
    config: DoraConfig,
    statistic: Statistic,
}

impl RestoreTimeCalculator {
    pub fn new(store: Arc<dyn MetricStore>, config: DoraConfig) -> Self {
        Self {
            store,
            config,
            statistic: Statistic::Mean,
        }
    }

    pub fn with_statistic(mut self, statistic: Statistic) -> Self {
        self.statistic = statistic;
        self
    }

    pub fn calculate(&self, period_days: u32, filter: &DoraFilter) -> StoreResult<RestoreTime> {
        self.calculate_at(Utc::now(), period_days, filter)
    }

    pub fn calculate_at(
        &self,
        as_of: DateTime<Utc>,
        period_days: u32,
        filter: &DoraFilter,
    ) -> StoreResult<RestoreTime> {
        let hours: Vec<f64> = fetch(
            self.store.as_ref(),
            &self.config.restore_time_metric,
            as_of,
            period_days,
            filter,
        )?
        .iter()
        .map(|m| m.value / SECONDS_PER_HOUR)
        .collect();

        let value = self.statistic.compute(&hours);
        Ok(RestoreTime {
            value,
            rating: RatingBands::RESTORE_TIME.rate(value, hours.len()),
            sample_size: hours.len(),
            statistic: self.statistic,
            mean_hours: mean(&hours),
            median_hours: percentile(&hours, 50.0),
            p95_hours: percentile(&hours, 95.0),
        })
    }
}
