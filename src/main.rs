//! Engmetrics worker.
//!
//! Replays queued events, aggregates metrics on a schedule and logs a DORA
//! report until interrupted.

use engmetrics::config::WorkerConfig;
use engmetrics::dora::{DoraFilter, DoraReport};
use engmetrics::event::Event;
use engmetrics::scheduler::Scheduler;
use engmetrics::store::SqliteStore;
use engmetrics::EventClassifier;

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("engmetrics=info".parse()?))
        .init();

    // Load configuration
    let cfg = WorkerConfig::load();
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(SqliteStore::new(&cfg.db_path)?);
    let stats = store.get_stats()?;
    tracing::info!(
        "Database initialized: {} raw metrics, {} aggregates, {} bytes",
        stats.raw_count,
        stats.aggregate_count,
        stats.db_size_bytes
    );

    let classifier = Arc::new(EventClassifier::default());

    // Replayed metrics are fully written before the report below reads them.
    if let Some(path) = &cfg.events_file {
        let events = read_events(path).await?;
        let replayed = Scheduler::replay(store.clone(), classifier.clone(), &cfg, events).await?;
        tracing::info!("Replayed {} events from {}", replayed, path.display());
    }

    let scheduler = Scheduler::new(store.clone(), classifier, &cfg);
    scheduler.start();

    let report = DoraReport::generate(store.clone(), &cfg.dora, cfg.dora_period_days, &DoraFilter::new())?;
    tracing::info!(
        "DORA ({} days): overall {}, deployment frequency {:.2}/day ({}), lead time {:.1}h ({}), \
         restore time {:.1}h ({}), change failure rate {:.1}% ({})",
        report.period_days,
        report.overall,
        report.deployment_frequency.value,
        report.deployment_frequency.rating,
        report.lead_time.value,
        report.lead_time.rating,
        report.restore_time.value,
        report.restore_time.rating,
        report.change_failure_rate.value,
        report.change_failure_rate.rating,
    );
    tracing::debug!("DORA report: {}", serde_json::to_string(&report)?);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    scheduler.shutdown().await;

    Ok(())
}

/// Read every event in a JSON lines file. Invalid lines are skipped.
async fn read_events(path: &Path) -> Result<Vec<Event>, Box<dyn std::error::Error + Send + Sync>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut events = Vec::new();

    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<Event>(line)
            .map_err(|e| e.to_string())
            .and_then(|e| Event::new(e.name, e.source, e.timestamp, e.data).map_err(|e| e.to_string()));
        match event {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!("Skipping {}:{}: {}", path.display(), line_no + 1, e),
        }
    }

    Ok(events)
}
