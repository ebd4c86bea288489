//! DORA delivery performance calculators.
//!
//! Every calculator reads metrics over a trailing window `[as_of - days, as_of)`
//! and never writes. Empty samples produce a value of 0 with
//! [`Rating::NoData`].

mod change_failure_rate;
mod deployment_frequency;
mod lead_time;
mod report;
mod restore_time;
mod stats;

pub use change_failure_rate::*;
pub use deployment_frequency::*;
pub use lead_time::*;
pub use report::*;
pub use restore_time::*;
pub use stats::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::{Metric, MetricFilter, MetricKind, MetricStore, StoreResult};

/// Performance tier of a DORA metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Elite,
    High,
    Medium,
    Low,
    NoData,
}

impl Rating {
    /// Higher is better; `NoData` ranks below everything.
    pub fn rank(self) -> u8 {
        match self {
            Rating::Elite => 4,
            Rating::High => 3,
            Rating::Medium => 2,
            Rating::Low => 1,
            Rating::NoData => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rating::Elite => "elite",
            Rating::High => "high",
            Rating::Medium => "medium",
            Rating::Low => "low",
            Rating::NoData => "no_data",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

/// Thresholds separating the four tiers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingBands {
    pub elite: f64,
    pub high: f64,
    pub medium: f64,
    pub direction: Direction,
}

impl RatingBands {
    /// Deployments per day.
    pub const DEPLOYMENT_FREQUENCY: RatingBands = RatingBands {
        elite: 1.0,
        high: 1.0 / 7.0,
        medium: 1.0 / 30.0,
        direction: Direction::HigherIsBetter,
    };

    /// Hours.
    pub const LEAD_TIME: RatingBands = RatingBands {
        elite: 24.0,
        high: 24.0 * 7.0,
        medium: 24.0 * 30.0,
        direction: Direction::LowerIsBetter,
    };

    /// Hours.
    pub const RESTORE_TIME: RatingBands = RatingBands {
        elite: 1.0,
        high: 24.0,
        medium: 24.0 * 7.0,
        direction: Direction::LowerIsBetter,
    };

    /// Percent.
    pub const CHANGE_FAILURE_RATE: RatingBands = RatingBands {
        elite: 5.0,
        high: 10.0,
        medium: 15.0,
        direction: Direction::LowerIsBetter,
    };

    pub fn rate(&self, value: f64, sample_size: usize) -> Rating {
        if sample_size == 0 {
            return Rating::NoData;
        }
        match self.direction {
            Direction::HigherIsBetter => {
                if value >= self.elite {
                    Rating::Elite
                } else if value >= self.high {
                    Rating::High
                } else if value >= self.medium {
                    Rating::Medium
                } else {
                    Rating::Low
                }
            }
            Direction::LowerIsBetter => {
                if value < self.elite {
                    Rating::Elite
                } else if value < self.high {
                    Rating::High
                } else if value < self.medium {
                    Rating::Medium
                } else {
                    Rating::Low
                }
            }
        }
    }
}

/// Optional narrowing of the metrics a calculator reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoraFilter {
    pub repository: Option<String>,
    pub environment: Option<String>,
    pub source: Option<String>,
}

impl DoraFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    fn apply(&self, mut filter: MetricFilter) -> MetricFilter {
        if let Some(repository) = &self.repository {
            filter = filter.dimension("repository", repository.clone());
        }
        if let Some(environment) = &self.environment {
            filter = filter.dimension("environment", environment.clone());
        }
        if let Some(source) = &self.source {
            filter = filter.from_source(source.clone());
        }
        filter
    }
}

/// Metric names and thresholds used by the calculators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoraConfig {
    pub deployment_metric: String,
    pub incident_metric: String,
    /// Seconds per deployed change.
    pub lead_time_metric: String,
    /// Seconds per resolved incident.
    pub restore_time_metric: String,
    pub change_failure_bands: RatingBands,
}

impl Default for DoraConfig {
    fn default() -> Self {
        Self {
            deployment_metric: "ci.deploy.completed".to_string(),
            incident_metric: "ci.deploy.incident".to_string(),
            lead_time_metric: "ci.lead_time".to_string(),
            restore_time_metric: "ci.incident.restore_time".to_string(),
            change_failure_bands: RatingBands::CHANGE_FAILURE_RATE,
        }
    }
}

/// Trailing window ending at `as_of`. At least one day long.
pub fn window(as_of: DateTime<Utc>, period_days: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let days = i64::from(period_days.max(1));
    (as_of - ChronoDuration::days(days), as_of)
}

/// Raw metrics named `name` inside the trailing window.
fn fetch(
    store: &dyn MetricStore,
    name: &str,
    as_of: DateTime<Utc>,
    period_days: u32,
    filter: &DoraFilter,
) -> StoreResult<Vec<Metric>> {
    let (start, end) = window(as_of, period_days);
    let query = filter.apply(
        MetricFilter::new()
            .named(name)
            .between(start, end)
            .of_kind(MetricKind::Raw),
    );
    store.list(&query)
}

const SECONDS_PER_HOUR: f64 = 3600.0;
