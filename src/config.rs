//! Configuration module for the metrics worker.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregate::Period;
use crate::dora::{DoraConfig, RatingBands};

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path to the SQLite database file (default: "engmetrics.db")
    pub db_path: String,
    /// Seconds between aggregation passes (default: 60)
    pub aggregation_interval_secs: u64,
    /// Periods aggregated on every pass (default: all)
    pub periods: Vec<Period>,
    /// Days raw metrics are kept (default: 90)
    pub raw_retention_days: u32,
    /// Trailing window of the DORA report logged at startup (default: 30)
    pub dora_period_days: u32,
    /// JSON lines file of events replayed at startup
    pub events_file: Option<PathBuf>,
    pub dora: DoraConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: "engmetrics.db".to_string(),
            aggregation_interval_secs: 60,
            periods: Period::ALL.to_vec(),
            raw_retention_days: 90,
            dora_period_days: 30,
            events_file: None,
            dora: DoraConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ENGMETRICS_DB_PATH`: Database file path (default: "engmetrics.db")
    /// - `ENGMETRICS_AGGREGATION_INTERVAL_SECS`: Aggregation interval (default: 60)
    /// - `ENGMETRICS_PERIODS`: Comma separated periods, e.g. "hourly,daily"
    /// - `ENGMETRICS_RAW_RETENTION_DAYS`: Raw metric retention (default: 90)
    /// - `ENGMETRICS_DORA_PERIOD_DAYS`: DORA report window (default: 30)
    /// - `ENGMETRICS_EVENTS_FILE`: Events to replay at startup
    /// - `ENGMETRICS_CFR_ELITE` / `_HIGH` / `_MEDIUM`: Change failure rate bands in percent
    ///
    /// Unparseable values are ignored with a warning.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("ENGMETRICS_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse(&lookup, "ENGMETRICS_AGGREGATION_INTERVAL_SECS") {
            cfg.aggregation_interval_secs = secs;
        }

        if let Some(raw) = lookup("ENGMETRICS_PERIODS") {
            let periods: Result<Vec<Period>, _> = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect();
            match periods {
                Ok(periods) if !periods.is_empty() => cfg.periods = periods,
                Ok(_) => {}
                Err(e) => tracing::warn!("Config: Ignoring ENGMETRICS_PERIODS: {}", e),
            }
        }

        if let Some(days) = parse(&lookup, "ENGMETRICS_RAW_RETENTION_DAYS") {
            cfg.raw_retention_days = days;
        }

        if let Some(days) = parse(&lookup, "ENGMETRICS_DORA_PERIOD_DAYS") {
            cfg.dora_period_days = days;
        }

        if let Some(path) = lookup("ENGMETRICS_EVENTS_FILE") {
            cfg.events_file = Some(PathBuf::from(path));
        }

        let bands = &mut cfg.dora.change_failure_bands;
        if let Some(v) = parse(&lookup, "ENGMETRICS_CFR_ELITE") {
            bands.elite = v;
        }
        if let Some(v) = parse(&lookup, "ENGMETRICS_CFR_HIGH") {
            bands.high = v;
        }
        if let Some(v) = parse(&lookup, "ENGMETRICS_CFR_MEDIUM") {
            bands.medium = v;
        }
        if !(bands.elite <= bands.high && bands.high <= bands.medium) {
            tracing::warn!("Config: Change failure bands out of order, using defaults");
            *bands = RatingBands::CHANGE_FAILURE_RATE;
        }

        cfg
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs.max(1))
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Config: Ignoring {}={:?}", key, raw);
            None
        }
    }
}
