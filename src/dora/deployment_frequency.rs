use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{fetch, DoraConfig, DoraFilter, Rating, RatingBands};
use crate::store::{MetricStore, StoreResult};

/// Successful deployments per day over the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentFrequency {
    /// Deployments per day.
    pub value: f64,
    pub rating: Rating,
    pub sample_size: usize,
    pub period_days: u32,
    /// Distinct calendar days with at least one deployment.
    pub deployment_days: usize,
    pub per_week: f64,
}

pub struct DeploymentFrequencyCalculator {
    store: Arc<dyn MetricStore>,
    config: DoraConfig,
}

impl DeploymentFrequencyCalculator {
    pub fn new(store: Arc<dyn MetricStore>, config: DoraConfig) -> Self {
        Self { store, config }
    }

    pub fn calculate(&self, period_days: u32, filter: &DoraFilter) -> StoreResult<DeploymentFrequency> {
        self.calculate_at(Utc::now(), period_days, filter)
    }

    pub fn calculate_at(
        &self,
        as_of: DateTime<Utc>,
        period_days: u32,
        filter: &DoraFilter,
    ) -> StoreResult<DeploymentFrequency> {
        let period_days = period_days.max(1);
        let deployments = fetch(
            self.store.as_ref(),
            &self.config.deployment_metric,
            as_of,
            period_days,
            filter,
        )?;

        let days: BTreeSet<NaiveDate> = deployments.iter().map(|m| m.timestamp.date_naive()).collect();
        let sample_size = deployments.len();
        let value = sample_size as f64 / f64::from(period_days);

        Ok(DeploymentFrequency {
            value,
            rating: RatingBands::DEPLOYMENT_FREQUENCY.rate(value, sample_size),
            sample_size,
            period_days,
            deployment_days: days.len(),
            per_week: value * 7.0,
        })
    }
}
