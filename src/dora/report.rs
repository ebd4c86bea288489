use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    ChangeFailureRate, ChangeFailureRateCalculator, DeploymentFrequency,
    DeploymentFrequencyCalculator, DoraConfig, DoraFilter, LeadTime, LeadTimeCalculator, Rating,
    RestoreTime, RestoreTimeCalculator,
};
use crate::store::{MetricStore, StoreResult};

/// All four DORA metrics for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoraReport {
    pub generated_at: DateTime<Utc>,
    pub period_days: u32,
    pub filter: DoraFilter,
    pub deployment_frequency: DeploymentFrequency,
    pub lead_time: LeadTime,
    pub restore_time: RestoreTime,
    pub change_failure_rate: ChangeFailureRate,
    pub overall: Rating,
}

impl DoraReport {
    pub fn generate(
        store: Arc<dyn MetricStore>,
        config: &DoraConfig,
        period_days: u32,
        filter: &DoraFilter,
    ) -> StoreResult<Self> {
        Self::generate_at(store, config, Utc::now(), period_days, filter)
    }

    pub fn generate_at(
        store: Arc<dyn MetricStore>,
        config: &DoraConfig,
        as_of: DateTime<Utc>,
        period_days: u32,
        filter: &DoraFilter,
    ) -> StoreResult<Self> {
        let deployment_frequency = DeploymentFrequencyCalculator::new(store.clone(), config.clone())
            .calculate_at(as_of, period_days, filter)?;
        let lead_time = LeadTimeCalculator::new(store.clone(), config.clone())
            .with_breakdown(true)
            .calculate_at(as_of, period_days, filter)?;
        let restore_time = RestoreTimeCalculator::new(store.clone(), config.clone())
            .calculate_at(as_of, period_days, filter)?;
        let change_failure_rate = ChangeFailureRateCalculator::new(store, config.clone())
            .calculate_at(as_of, period_days, filter)?;

        let overall = overall_rating(&[
            deployment_frequency.rating,
            lead_time.rating,
            restore_time.rating,
            change_failure_rate.rating,
        ]);

        Ok(Self {
            generated_at: as_of,
            period_days,
            filter: filter.clone(),
            deployment_frequency,
            lead_time,
            restore_time,
            change_failure_rate,
            overall,
        })
    }
}

/// Most common rating among metrics with data; ties go to the lower tier.
pub fn overall_rating(ratings: &[Rating]) -> Rating {
    let mut counts: HashMap<Rating, usize> = HashMap::new();
    for rating in ratings.iter().filter(|r| **r != Rating::NoData) {
        *counts.entry(*rating).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then(b.rank().cmp(&a.rank())))
        .map(|(rating, _)| rating)
        .unwrap_or(Rating::NoData)
}
