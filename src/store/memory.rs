//! In-memory metric store.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::models::{fingerprint, Dimensions, Metric};
use super::{MetricFilter, MetricRepository, MetricStore, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    metrics: BTreeMap<i64, Metric>,
}

impl MemoryState {
    fn save(&mut self, metric: &Metric) -> StoreResult<Metric> {
        // Same guarantee as the unique aggregate index in SQLite.
        if metric.is_aggregate() && self.find_aggregate(&metric.name, &metric.dimensions).is_some() {
            return Err(StoreError::Conflict {
                name: metric.name.clone(),
                fingerprint: metric.fingerprint(),
            });
        }

        self.next_id += 1;
        let saved = metric.clone().with_id(self.next_id);
        self.metrics.insert(self.next_id, saved.clone());
        Ok(saved)
    }

    fn list(&self, filter: &MetricFilter) -> Vec<Metric> {
        let mut found: Vec<Metric> = self
            .metrics
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        found
    }

    fn find_aggregate(&self, name: &str, dimensions: &Dimensions) -> Option<Metric> {
        let key = fingerprint(dimensions);
        self.metrics
            .values()
            .find(|m| m.name == name && m.is_aggregate() && m.fingerprint() == key)
            .cloned()
    }

    fn update(&mut self, metric: &Metric) -> StoreResult<()> {
        let id = metric.id.ok_or(StoreError::NotFound)?;
        match self.metrics.get_mut(&id) {
            Some(existing) => {
                *existing = metric.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn delete(&mut self, filter: &MetricFilter) -> usize {
        let before = self.metrics.len();
        self.metrics.retain(|_, m| !filter.matches(m));
        before - self.metrics.len()
    }
}

/// Thread-safe metric store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored metrics.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.metrics.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl MetricRepository for MemoryStore {
    fn save(&self, metric: &Metric) -> StoreResult<Metric> {
        self.lock()?.save(metric)
    }

    fn save_batch(&self, metrics: &[Metric]) -> StoreResult<Vec<Metric>> {
        let mut state = self.lock()?;
        let mut staged = state.clone();
        let saved = metrics
            .iter()
            .map(|m| staged.save(m))
            .collect::<StoreResult<Vec<_>>>()?;
        *state = staged;
        Ok(saved)
    }

    fn list(&self, filter: &MetricFilter) -> StoreResult<Vec<Metric>> {
        Ok(self.lock()?.list(filter))
    }

    fn find_aggregate(&self, name: &str, dimensions: &Dimensions) -> StoreResult<Option<Metric>> {
        Ok(self.lock()?.find_aggregate(name, dimensions))
    }

    fn update(&self, metric: &Metric) -> StoreResult<()> {
        self.lock()?.update(metric)
    }

    fn delete(&self, filter: &MetricFilter) -> StoreResult<usize> {
        Ok(self.lock()?.delete(filter))
    }
}

/// Repository over a snapshot of the state, committed only on success.
struct MemoryTx {
    state: RefCell<MemoryState>,
}

impl MetricRepository for MemoryTx {
    fn save(&self, metric: &Metric) -> StoreResult<Metric> {
        self.state.borrow_mut().save(metric)
    }

    fn list(&self, filter: &MetricFilter) -> StoreResult<Vec<Metric>> {
        Ok(self.state.borrow().list(filter))
    }

    fn find_aggregate(&self, name: &str, dimensions: &Dimensions) -> StoreResult<Option<Metric>> {
        Ok(self.state.borrow().find_aggregate(name, dimensions))
    }

    fn update(&self, metric: &Metric) -> StoreResult<()> {
        self.state.borrow_mut().update(metric)
    }

    fn delete(&self, filter: &MetricFilter) -> StoreResult<usize> {
        Ok(self.state.borrow_mut().delete(filter))
    }
}

impl MetricStore for MemoryStore {
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn MetricRepository) -> StoreResult<()>,
    ) -> StoreResult<()> {
        // The guard is held for the whole closure, serializing transactions.
        let mut guard = self.lock()?;
        let tx = MemoryTx {
            state: RefCell::new(guard.clone()),
        };
        work(&tx)?;
        *guard = tx.state.into_inner();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MetricKind, MetricStoreExt};
    use chrono::{TimeZone, Utc};

    fn dims(repo: &str) -> Dimensions {
        let mut d = Dimensions::new();
        d.insert("repository".to_string(), repo.to_string());
        d
    }

    fn metric(name: &str, hour: u32, repo: &str) -> Metric {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        Metric::new(name, 1.0, ts, "github", dims(repo))
    }

    fn aggregate(name: &str, hour: u32, repo: &str) -> Metric {
        let m = metric(name, hour, repo);
        Metric::aggregate(m.name, m.value, m.timestamp, m.source, m.dimensions)
    }

    #[test]
    fn test_save_assigns_ids_and_lists_in_time_order() {
        let store = MemoryStore::new();
        let late = store.save(&metric("github.push.total", 5, "acme/api")).unwrap();
        let early = store.save(&metric("github.push.total", 1, "acme/api")).unwrap();
        assert_eq!(late.id, Some(1));
        assert_eq!(early.id, Some(2));

        let listed = store.list(&MetricFilter::new()).unwrap();
        assert_eq!(listed, vec![early, late]);
    }

    #[test]
    fn test_find_and_update_aggregate() {
        let store = MemoryStore::new();
        let agg = store.save(&aggregate("github.push.daily", 0, "acme/api")).unwrap();

        let found = store
            .find_aggregate("github.push.daily", &dims("acme/api"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, agg.id);
        assert!(store.find_aggregate("github.push.daily", &dims("acme/web")).unwrap().is_none());

        store.update(&found.with_value(9.0)).unwrap();
        let listed = store
            .list(&MetricFilter::new().of_kind(MetricKind::Aggregate))
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, 9.0);
    }

    #[test]
    fn test_duplicate_aggregate_is_rejected() {
        let store = MemoryStore::new();
        store.save(&aggregate("github.push.daily", 0, "acme/api")).unwrap();
        let err = store.save(&aggregate("github.push.daily", 3, "acme/api")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        // Raw metrics may repeat freely, whatever their name.
        store.save(&metric("github.push.total", 0, "acme/api")).unwrap();
        store.save(&metric("github.push.total", 0, "acme/api")).unwrap();
        store
            .save_batch(&[metric("ci.backup.daily", 0, "acme/api"), metric("ci.backup.daily", 0, "acme/api")])
            .unwrap();
        assert_eq!(store.len(), 5);
        assert_eq!(
            store.list(&MetricFilter::new().of_kind(MetricKind::Aggregate)).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_update_without_id_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update(&aggregate("github.push.daily", 0, "acme/api")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = MemoryStore::new();
        let result: StoreResult<()> = store.in_transaction(|repo| {
            repo.save(&aggregate("github.push.daily", 0, "acme/api"))?;
            Err(StoreError::Unavailable("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.is_empty());

        let saved = store
            .in_transaction(|repo| repo.save(&aggregate("github.push.daily", 0, "acme/api")))
            .unwrap();
        assert_eq!(saved.id, Some(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_by_filter() {
        let store = MemoryStore::new();
        store.save(&metric("github.push.total", 1, "acme/api")).unwrap();
        store.save(&metric("github.push.total", 5, "acme/api")).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        let removed = store.delete(&MetricFilter::new().before(cutoff)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
