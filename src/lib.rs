//! Engineering metrics from webhook events.
//!
//! Events from GitHub, GitLab, Bitbucket, Jira, CI systems and task trackers
//! are classified into metrics, rolled up into period aggregates and turned
//! into DORA delivery performance reports.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod dora;
pub mod event;
pub mod scheduler;
pub mod store;

pub use aggregate::{AggregationEngine, AggregationError, AggregationSummary, Period};
pub use classify::{DimensionExtractor, EventClassifier, MetricDefinition};
pub use dora::{DoraConfig, DoraFilter, DoraReport, Rating};
pub use event::{Event, EventError};
pub use store::{Metric, MetricFilter, MetricStore, StoreError};
