//! Aggregation manager for rolling raw metrics into period aggregates.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::aggregate::{AggregationEngine, AggregationSummary, Period};

/// Manager that periodically re-aggregates the recent buckets of each period.
pub struct AggregationManager {
    engine: Arc<AggregationEngine>,
    periods: Vec<Period>,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl AggregationManager {
    pub fn new(engine: Arc<AggregationEngine>, periods: Vec<Period>, interval: Duration) -> Self {
        Self {
            engine,
            periods,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the aggregation manager background task.
    pub fn start(&self) {
        let engine = self.engine.clone();
        let periods = self.periods.clone();
        let period = self.interval;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            let mut rx = tx.subscribe();
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx);
            }

            // Spread workers sharing a database across the first interval.
            let jitter_ms = rand::random::<u64>() % (period.as_millis() as u64 / 10 + 1);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_aggregations(&engine, &periods, Utc::now());
                    }
                }
            }
            tracing::info!("AggregationManager: Stopped");
        });
    }

    /// Stop the aggregation manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// `[start of previous bucket, end of current bucket)` for `period` at `now`.
///
/// The previous bucket is included so metrics that arrive just after a
/// boundary still reach their aggregate.
pub fn recent_window(period: Period, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (current, end) = period.bucket_bounds(now);
    let previous = period.truncate(current - ChronoDuration::seconds(1));
    (previous, end)
}

/// Run one aggregation pass over every period. Failures are logged and the
/// pass moves on; the next tick retries the same buckets.
pub fn process_aggregations(
    engine: &AggregationEngine,
    periods: &[Period],
    now: DateTime<Utc>,
) -> Vec<AggregationSummary> {
    let mut summaries = Vec::with_capacity(periods.len());
    for period in periods {
        let (start, end) = recent_window(*period, now);
        match engine.aggregate(*period, start, end) {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                tracing::error!("AggregationManager: Failed to aggregate {}: {}", period, e);
            }
        }
    }
    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Dimensions, MemoryStore, Metric, MetricFilter, MetricKind, MetricRepository};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_recent_window() {
        assert_eq!(recent_window(Period::FiveMinutes, at(10, 7)), (at(10, 0), at(10, 10)));
        assert_eq!(recent_window(Period::Hourly, at(10, 7)), (at(9, 0), at(11, 0)));
        let (start, end) = recent_window(Period::Monthly, at(10, 7));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_process_aggregations() {
        let store = Arc::new(MemoryStore::new());
        let mut dims = Dimensions::new();
        dims.insert("repository".to_string(), "acme/api".to_string());
        store
            .save(&Metric::new("ci.build.total", 1.0, at(9, 58), "ci", dims.clone()))
            .unwrap();
        store
            .save(&Metric::new("ci.build.total", 1.0, at(10, 1), "ci", dims))
            .unwrap();

        let engine = AggregationEngine::new(store.clone());
        let summaries = process_aggregations(&engine, &[Period::Hourly, Period::Daily], at(10, 5));
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].groups, 2);
        assert_eq!(summaries[1].groups, 1);

        let daily = store
            .list(&MetricFilter::new().named("ci.build.daily").of_kind(MetricKind::Aggregate))
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_manager_runs_and_stops() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(&Metric::new("ci.build.total", 1.0, Utc::now(), "ci", Dimensions::new()))
            .unwrap();

        let engine = Arc::new(AggregationEngine::new(store.clone()));
        let manager = AggregationManager::new(engine, vec![Period::Hourly], Duration::from_millis(20));
        manager.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop().await;

        let aggregates = store
            .list(&MetricFilter::new().of_kind(MetricKind::Aggregate))
            .unwrap();
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].name, "ci.build.hourly");
    }
}
