//! Retention manager for cleaning up old metrics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::aggregate::Period;
use crate::store::{MetricFilter, MetricKind, MetricStore};

/// How long metrics of one kind are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// `None` for raw metrics.
    pub period: Option<Period>,
    /// Seconds.
    pub retention: i64,
}

/// Default retention policies. Monthly and yearly aggregates are kept forever.
pub fn default_policies(raw_retention_days: u32) -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy { period: None, retention: i64::from(raw_retention_days) * 86400 },
        RetentionPolicy { period: Some(Period::FiveMinutes), retention: 604800 }, // 7 days
        RetentionPolicy { period: Some(Period::Hourly), retention: 7776000 },     // 90 days
        RetentionPolicy { period: Some(Period::Daily), retention: 63072000 },     // 2 years
    ]
}

/// Validate retention policies.
pub fn validate_retention_policies(policies: &[RetentionPolicy]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for p in policies {
        if p.retention <= 0 {
            return Err("retention must be positive".to_string());
        }
        if !seen.insert(p.period) {
            let kind = p.period.map_or("raw".to_string(), |period| period.to_string());
            return Err(format!("duplicate retention policy for {}", kind));
        }
    }
    Ok(())
}

impl RetentionPolicy {
    /// Filter selecting the metrics this policy expires at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> MetricFilter {
        let cutoff = now - ChronoDuration::seconds(self.retention);
        match self.period {
            None => MetricFilter::new().of_kind(MetricKind::Raw).before(cutoff),
            Some(period) => MetricFilter::new()
                .matching(format!("*.{}", period.suffix()))
                .of_kind(MetricKind::Aggregate)
                .before(cutoff),
        }
    }
}

/// Manager for deleting metrics past their retention period.
pub struct RetentionManager {
    store: Arc<dyn MetricStore>,
    policies: Vec<RetentionPolicy>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    /// Invalid policies disable retention instead of deleting on a bad cutoff.
    pub fn new(store: Arc<dyn MetricStore>, policies: Vec<RetentionPolicy>) -> Self {
        let policies = match validate_retention_policies(&policies) {
            Ok(()) => policies,
            Err(e) => {
                tracing::error!("RetentionManager: Invalid policies, retention disabled: {}", e);
                Vec::new()
            }
        };
        Self {
            store,
            policies,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let policies = self.policies.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(store.as_ref(), &policies, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Apply every policy once and return the number of deleted metrics.
pub fn process_retention(store: &dyn MetricStore, policies: &[RetentionPolicy], now: DateTime<Utc>) -> usize {
    let mut deleted = 0;
    for policy in policies {
        match store.delete(&policy.expired(now)) {
            Ok(n) => {
                if n > 0 {
                    tracing::debug!("RetentionManager: Deleted {} metrics for {:?}", n, policy.period);
                }
                deleted += n;
            }
            Err(e) => {
                tracing::error!(
                    "RetentionManager: Failed to delete metrics for {:?}: {}",
                    policy.period,
                    e
                );
            }
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Dimensions, MemoryStore, Metric, MetricRepository};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_validate_policies() {
        assert!(validate_retention_policies(&default_policies(90)).is_ok());

        let mut policies = default_policies(90);
        policies.push(RetentionPolicy { period: None, retention: 10 });
        assert!(validate_retention_policies(&policies).is_err());

        let bad = vec![RetentionPolicy { period: Some(Period::Daily), retention: 0 }];
        assert!(validate_retention_policies(&bad).is_err());
    }

    #[test]
    fn test_manager_rejects_invalid_policies() {
        let store = Arc::new(MemoryStore::new());
        let manager = RetentionManager::new(store.clone(), default_policies(0));
        assert!(manager.policies.is_empty());

        let manager = RetentionManager::new(store, default_policies(30));
        assert_eq!(manager.policies.len(), 4);
    }

    #[test]
    fn test_process_retention() {
        let store = MemoryStore::new();
        let old = now() - ChronoDuration::days(120);
        let recent = now() - ChronoDuration::days(1);
        let mut agg_dims = Dimensions::new();
        agg_dims.insert("time_period".to_string(), "x".to_string());

        store.save(&Metric::new("github.push.total", 1.0, old, "github", Dimensions::new())).unwrap();
        store.save(&Metric::new("github.push.total", 1.0, recent, "github", Dimensions::new())).unwrap();
        store.save(&Metric::aggregate("github.push.hourly", 1.0, old, "github", agg_dims.clone())).unwrap();
        store.save(&Metric::aggregate("github.push.daily", 1.0, old, "github", agg_dims.clone())).unwrap();
        store.save(&Metric::aggregate("github.push.monthly", 1.0, old, "github", agg_dims)).unwrap();

        let deleted = process_retention(&store, &default_policies(90), now());
        assert_eq!(deleted, 2);

        let names: Vec<String> = store
            .list(&MetricFilter::new())
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["github.push.daily", "github.push.monthly", "github.push.total"]);
    }
}
