use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::{fetch, DoraConfig, DoraFilter, Rating};
use crate::store::{MetricStore, StoreResult};

/// Share of deployments that caused a failure, in percent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeFailureRate {
    pub value: f64,
    pub rating: Rating,
    /// Total deployments, failed and successful.
    pub sample_size: usize,
    pub failures: usize,
    pub successes: usize,
}

pub struct ChangeFailureRateCalculator {
    store: Arc<dyn MetricStore>,
    config: DoraConfig,
}

impl ChangeFailureRateCalculator {
    pub fn new(store: Arc<dyn MetricStore>, config: DoraConfig) -> Self {
        Self { store, config }
    }

    pub fn calculate(&self, period_days: u32, filter: &DoraFilter) -> StoreResult<ChangeFailureRate> {
        self.calculate_at(Utc::now(), period_days, filter)
    }

    pub fn calculate_at(
        &self,
        as_of: DateTime<Utc>,
        period_days: u32,
        filter: &DoraFilter,
    ) -> StoreResult<ChangeFailureRate> {
        let store = self.store.as_ref();
        let failures = fetch(store, &self.config.incident_metric, as_of, period_days, filter)?.len();
        let successes = fetch(store, &self.config.deployment_metric, as_of, period_days, filter)?.len();
        let total = failures + successes;

        let value = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64 * 100.0
        };

        Ok(ChangeFailureRate {
            value,
            rating: self.config.change_failure_bands.rate(value, total),
            sample_size: total,
            failures,
            successes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dora::testing::{as_of, days_ago, record};
    use crate::dora::RatingBands;
    use crate::store::MemoryStore;

    #[test]
    fn test_zero_deployments() {
        let store = Arc::new(MemoryStore::new());
        let result = ChangeFailureRateCalculator::new(store, DoraConfig::default())
            .calculate_at(as_of(), 30, &DoraFilter::new())
            .unwrap();
        assert_eq!(result.value, 0.0);
        assert_eq!(result.sample_size, 0);
        assert_eq!(result.rating, Rating::NoData);
    }

    #[test]
    fn test_failure_rate() {
        let store = Arc::new(MemoryStore::new());
        for day in 1..=9 {
            record(&store, "ci.deploy.completed", 1.0, days_ago(day), "acme/api");
        }
        record(&store, "ci.deploy.incident", 1.0, days_ago(4), "acme/api");

        let calc = ChangeFailureRateCalculator::new(store.clone(), DoraConfig::default());
        let result = calc.calculate_at(as_of(), 30, &DoraFilter::new()).unwrap();
        assert_eq!(result.failures, 1);
        assert_eq!(result.successes, 9);
        assert_eq!(result.value, 10.0);
        assert_eq!(result.rating, Rating::Medium);

        let lenient = DoraConfig {
            change_failure_bands: RatingBands {
                elite: 15.0,
                high: 20.0,
                medium: 30.0,
                ..RatingBands::CHANGE_FAILURE_RATE
            },
            ..DoraConfig::default()
        };
        let result = ChangeFailureRateCalculator::new(store, lenient)
            .calculate_at(as_of(), 30, &DoraFilter::new())
            .unwrap();
        assert_eq!(result.rating, Rating::Elite);
    }

    #[test]
    fn test_only_failures() {
        let store = Arc::new(MemoryStore::new());
        record(&store, "ci.deploy.incident", 1.0, days_ago(1), "acme/api");
        let result = ChangeFailureRateCalculator::new(store, DoraConfig::default())
            .calculate_at(as_of(), 7, &DoraFilter::new())
            .unwrap();
        assert_eq!(result.value, 100.0);
        assert_eq!(result.rating, Rating::Low);
    }
}
