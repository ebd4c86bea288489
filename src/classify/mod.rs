//! Event classification.
//!
//! Turns one [`Event`] into zero or more metric definitions. Dispatch is a
//! table keyed by [`Source`], built once when the classifier is constructed.
//! Handlers never fail: sparse payloads degrade to fewer or more generic
//! metrics.

mod bitbucket;
mod ci;
pub mod commits;
mod dimensions;
mod github;
mod gitlab;
mod jira;
mod task;

pub use bitbucket::BitbucketClassifier;
pub use ci::{CiClassifier, DEPLOY_FAILURE, DEPLOY_SUCCESS, LEAD_TIME_STAGES};
pub use dimensions::*;
pub use github::GithubClassifier;
pub use gitlab::GitlabClassifier;
pub use jira::JiraClassifier;
pub use task::TaskClassifier;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::event::{Event, Payload, Route, Source};
use crate::store::{Dimensions, Metric};

/// A metric produced by classification, before it has an id or timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDefinition {
    pub name: String,
    pub value: f64,
    pub dimensions: Dimensions,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, value: f64, dimensions: Dimensions) -> Self {
        Self {
            name: name.into(),
            value,
            dimensions,
        }
    }

    /// Materialize as a metric stamped with the event's source and time.
    pub fn into_metric(self, event: &Event) -> Metric {
        Metric::new(self.name, self.value, event.timestamp, event.source.clone(), self.dimensions)
    }
}

/// Accumulates definitions sharing a name prefix and base dimensions.
#[derive(Debug, Clone)]
pub struct MetricSet {
    prefix: String,
    base: Dimensions,
    metrics: Vec<MetricDefinition>,
}

impl MetricSet {
    pub fn new(prefix: impl Into<String>, base: Dimensions) -> Self {
        Self {
            prefix: prefix.into(),
            base,
            metrics: Vec::new(),
        }
    }

    /// Add a dimension to every metric emitted afterwards.
    pub fn with_dimension(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.base.insert(key.to_string(), value.into());
        self
    }

    /// Emit `{prefix}.{suffix}` with the base dimensions.
    pub fn emit(&mut self, suffix: &str, value: f64) {
        self.emit_with(suffix, value, &[]);
    }

    /// Emit `{prefix}.{suffix}` with extra dimensions layered over the base.
    pub fn emit_with(&mut self, suffix: &str, value: f64, extra: &[(&str, String)]) {
        let mut dimensions = self.base.clone();
        for (key, val) in extra {
            dimensions.insert((*key).to_string(), val.clone());
        }
        self.metrics.push(MetricDefinition::new(
            format!("{}.{}", self.prefix, suffix),
            value,
            dimensions,
        ));
    }

    /// Emit a metric with an absolute name instead of the set prefix.
    pub fn emit_named(&mut self, name: &str, value: f64, extra: &[(&str, String)]) {
        let mut dimensions = self.base.clone();
        for (key, val) in extra {
            dimensions.insert((*key).to_string(), val.clone());
        }
        self.metrics.push(MetricDefinition::new(name, value, dimensions));
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn finish(self) -> Vec<MetricDefinition> {
        self.metrics
    }
}

/// Classification rules for one upstream system.
pub trait SourceClassifier: Send + Sync {
    fn source(&self) -> Source;

    /// Metrics for an event already routed to this source. `dimensions` come
    /// from the [`DimensionExtractor`].
    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition>;
}

/// Routes events to per-source handlers.
pub struct EventClassifier {
    extractor: DimensionExtractor,
    handlers: HashMap<Source, Box<dyn SourceClassifier>>,
}

impl EventClassifier {
    /// Build a classifier from explicit handlers. Later handlers for the same
    /// source replace earlier ones.
    pub fn new(extractor: DimensionExtractor, handlers: Vec<Box<dyn SourceClassifier>>) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.source(), h)).collect();
        Self { extractor, handlers }
    }

    pub fn extractor(&self) -> &DimensionExtractor {
        &self.extractor
    }

    /// Metric definitions for `event`. Never fails; a payload that is not a
    /// map yields no metrics.
    pub fn classify(&self, event: &Event) -> Vec<MetricDefinition> {
        if !event.payload().is_map() {
            tracing::warn!(
                "EventClassifier: Dropping {} from {}: payload is not a map",
                event.name,
                event.source
            );
            return Vec::new();
        }

        let route = match event.route() {
            Some(route) => route,
            None => return vec![generic_metric(event)],
        };

        let handler = match self.handlers.get(&route.source) {
            Some(handler) => handler,
            None => return vec![generic_metric(event)],
        };

        let dimensions = self.extractor.extract(event);
        let metrics = handler.classify(event, &route, &dimensions);
        if metrics.is_empty() {
            return vec![generic_metric(event)];
        }

        tracing::debug!(
            "EventClassifier: {} produced {} metrics",
            event.name,
            metrics.len()
        );
        metrics
    }

    /// Classify and stamp the results with the event's source and timestamp.
    pub fn classify_metrics(&self, event: &Event) -> Vec<Metric> {
        self.classify(event)
            .into_iter()
            .map(|d| d.into_metric(event))
            .collect()
    }
}

impl Default for EventClassifier {
    /// Classifier wired with the handler for every known source.
    fn default() -> Self {
        Self::new(
            DimensionExtractor::new(),
            vec![
                Box::new(GithubClassifier),
                Box::new(JiraClassifier),
                Box::new(GitlabClassifier),
                Box::new(BitbucketClassifier),
                Box::new(CiClassifier),
                Box::new(TaskClassifier),
            ],
        )
    }
}

/// `{name}.total` dimensioned only by source.
pub fn generic_metric(event: &Event) -> MetricDefinition {
    let mut dimensions = Dimensions::new();
    dimensions.insert("source".to_string(), event.source.clone());
    MetricDefinition::new(format!("{}.total", event.name), 1.0, dimensions)
}

// --- Helpers shared by the source handlers ---

/// Normalize free text into a metric name segment.
pub(crate) fn segment(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Action from the event name, falling back to the payload's `action` field.
pub(crate) fn action_of(route: &Route<'_>, payload: &Payload<'_>) -> Option<String> {
    route
        .action
        .and_then(segment)
        .or_else(|| payload.str(&["action"]).and_then(segment))
}

/// Seconds between two instants; negative spans are discarded.
pub(crate) fn seconds_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    let (start, end) = (start?, end?);
    let millis = (end - start).num_milliseconds();
    if millis < 0 {
        None
    } else {
        Some(millis as f64 / 1000.0)
    }
}
