//! Scheduler module for classifying events and aggregating metrics.

mod aggregation;
mod retention;

pub use aggregation::*;
pub use retention::*;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::aggregate::AggregationEngine;
use crate::classify::EventClassifier;
use crate::config::WorkerConfig;
use crate::event::Event;
use crate::store::{Metric, MetricStore};

/// Metrics buffered before a forced flush.
const BATCH_SIZE: usize = 500;

/// Maximum time metrics sit in the buffer.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive failed flushes before pending metrics are dropped.
const MAX_FLUSH_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("event intake is closed")]
    Closed,
}

/// The main scheduler that wires intake, classification and storage.
pub struct Scheduler {
    event_tx: mpsc::Sender<Event>,
    pipeline: JoinHandle<()>,
    aggregation_manager: Arc<AggregationManager>,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    /// Create a new scheduler; the intake pipeline starts immediately.
    pub fn new(
        store: Arc<dyn MetricStore>,
        classifier: Arc<EventClassifier>,
        cfg: &WorkerConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1000);
        let (metric_tx, metric_rx) = mpsc::channel(1000);

        let engine = Arc::new(AggregationEngine::new(store.clone()));
        let aggregation_manager = Arc::new(AggregationManager::new(
            engine,
            cfg.periods.clone(),
            cfg.aggregation_interval(),
        ));
        let retention_manager = Arc::new(RetentionManager::new(
            store.clone(),
            default_policies(cfg.raw_retention_days),
        ));

        // Start classification and batch writer in separate tasks
        let intake = tokio::spawn(run_intake(event_rx, classifier, metric_tx));
        let pipeline = tokio::spawn(async move {
            run_batch_writer(metric_rx, store).await;
            let _ = intake.await;
        });

        Self {
            event_tx,
            pipeline,
            aggregation_manager,
            retention_manager,
        }
    }

    /// Start the aggregation and retention managers.
    pub fn start(&self) {
        tracing::info!("Starting scheduler");
        self.aggregation_manager.start();
        self.retention_manager.start();
    }

    /// Queue an event for classification.
    pub async fn submit(&self, event: Event) -> Result<(), SchedulerError> {
        self.event_tx.send(event).await.map_err(|_| SchedulerError::Closed)
    }

    /// A handle producers can use to submit events.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.event_tx.clone()
    }

    /// Classify and store `events` on a scheduler of their own, returning once
    /// every resulting metric has been written.
    pub async fn replay(
        store: Arc<dyn MetricStore>,
        classifier: Arc<EventClassifier>,
        cfg: &WorkerConfig,
        events: impl IntoIterator<Item = Event>,
    ) -> Result<usize, SchedulerError> {
        let scheduler = Self::new(store, classifier, cfg);
        let mut submitted = 0;
        for event in events {
            scheduler.submit(event).await?;
            submitted += 1;
        }
        scheduler.shutdown().await;
        Ok(submitted)
    }

    /// Stop the managers and wait until every submitted event is stored.
    ///
    /// Outstanding [`Scheduler::sender`] handles keep the intake open.
    pub async fn shutdown(self) {
        self.aggregation_manager.stop().await;
        self.retention_manager.stop().await;

        drop(self.event_tx);
        if let Err(e) = self.pipeline.await {
            tracing::error!("Scheduler: Pipeline task failed: {}", e);
        }
        tracing::info!("Scheduler: Stopped");
    }
}

/// Classify incoming events and forward their metrics to the writer.
async fn run_intake(
    mut rx: mpsc::Receiver<Event>,
    classifier: Arc<EventClassifier>,
    tx: mpsc::Sender<Metric>,
) {
    while let Some(event) = rx.recv().await {
        for metric in classifier.classify_metrics(&event) {
            if tx.send(metric).await.is_err() {
                tracing::error!("Failed to send metrics for {}", event.name);
                return;
            }
        }
    }
}

/// Run the batch writer that accumulates and flushes metrics.
async fn run_batch_writer(mut rx: mpsc::Receiver<Metric>, store: Arc<dyn MetricStore>) {
    let mut buffer = PendingMetrics::default();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(m) => {
                        buffer.metrics.push(m);
                        // Metrics kept back by a failed flush wait for the next tick.
                        if buffer.metrics.len() >= BATCH_SIZE && buffer.failures == 0 {
                            flush_buffer(store.as_ref(), &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(store.as_ref(), &mut buffer);
                        if !buffer.metrics.is_empty() {
                            tracing::error!(
                                "Scheduler: Dropping {} unstored metrics at shutdown",
                                buffer.metrics.len()
                            );
                        }
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(store.as_ref(), &mut buffer);
            }
        }
    }
}

/// Metrics waiting to be written, with the count of failed flushes in a row.
#[derive(Debug, Default)]
struct PendingMetrics {
    metrics: Vec<Metric>,
    failures: u32,
}

fn flush_buffer(store: &dyn MetricStore, buffer: &mut PendingMetrics) {
    if buffer.metrics.is_empty() {
        return;
    }

    match store.save_batch(&buffer.metrics) {
        Ok(saved) => {
            tracing::debug!("Flushed {} metrics", saved.len());
            buffer.metrics.clear();
            buffer.failures = 0;
            return;
        }
        Err(e) => tracing::warn!(
            "Batch of {} metrics failed, saving one by one: {}",
            buffer.metrics.len(),
            e
        ),
    }

    // One rejected metric must not take the rest of the batch with it.
    let mut last_error = None;
    buffer.metrics.retain(|metric| match store.save(metric) {
        Ok(_) => false,
        Err(e) => {
            last_error = Some(e);
            true
        }
    });

    let Some(e) = last_error else {
        buffer.failures = 0;
        return;
    };
    buffer.failures += 1;
    if buffer.failures >= MAX_FLUSH_ATTEMPTS {
        tracing::error!(
            "Dropping {} metrics after {} failed flushes: {}",
            buffer.metrics.len(),
            buffer.failures,
            e
        );
        buffer.metrics.clear();
        buffer.failures = 0;
    } else {
        tracing::error!(
            "Failed to store {} metrics (attempt {}), retrying: {}",
            buffer.metrics.len(),
            buffer.failures,
            e
        );
    }
}
