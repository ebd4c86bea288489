use super::{seconds_between, segment, MetricDefinition, MetricSet, SourceClassifier};
use crate::event::{normalize_value, Event, Payload, Route, Source};
use crate::store::Dimensions;

/// Deploy statuses counted as a successful deployment.
pub const DEPLOY_SUCCESS: [&str; 3] = ["completed", "success", "succeeded"];

/// Deploy statuses counted as a failed deployment.
pub const DEPLOY_FAILURE: [&str; 3] = ["failed", "failure", "error"];

/// Lead time stage fields carried onto `ci.lead_time` as dimensions.
pub const LEAD_TIME_STAGES: [&str; 5] = [
    "code_review_hours",
    "ci_hours",
    "qa_hours",
    "approval_hours",
    "deployment_hours",
];

/// Generic CI events named `ci.{operation}.{status}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CiClassifier;

impl SourceClassifier for CiClassifier {
    fn source(&self) -> Source {
        Source::Ci
    }

    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition> {
        let payload = event.payload();
        let operation = route.entity;
        let status = route
            .action
            .and_then(segment)
            .or_else(|| payload.str(&["status"]).and_then(segment));

        let mut set = MetricSet::new(route.metric_prefix(), dimensions.clone());
        set.emit("total", 1.0);
        if let Some(status) = &status {
            set.emit(status, 1.0);
        }

        let status = status.as_deref().unwrap_or_default();
        if status == "completed" {
            // Unparseable or missing times count as zero rather than dropping the run.
            let duration = seconds_between(
                payload.time(&["start_time"]),
                payload.time(&["end_time"]),
            )
            .unwrap_or(0.0);
            set.emit("duration", duration);
        }

        match operation {
            "deploy" if DEPLOY_SUCCESS.contains(&status) => deploy_succeeded(&payload, status, &mut set),
            "deploy" if DEPLOY_FAILURE.contains(&status) => set.emit("incident", 1.0),
            "incident" if status == "resolved" => {
                if let Some(secs) = restore_time(&payload) {
                    set.emit("restore_time", secs);
                }
            }
            _ => {}
        }

        set.finish()
    }
}

fn deploy_succeeded(payload: &Payload<'_>, status: &str, set: &mut MetricSet) {
    // `ci.deploy.completed` is already the status metric for that status.
    if status != "completed" {
        set.emit("completed", 1.0);
    }

    if let Some(lead_time) = payload.f64(&["lead_time"]).filter(|v| *v >= 0.0) {
        let stages: Vec<(&str, String)> = LEAD_TIME_STAGES
            .iter()
            .filter_map(|stage| {
                payload
                    .get(&[*stage])
                    .and_then(normalize_value)
                    .map(|v| (*stage, v))
            })
            .collect();
        set.emit_named("ci.lead_time", lead_time, &stages);
    }
}

/// Seconds from incident start to recovery.
fn restore_time(payload: &Payload<'_>) -> Option<f64> {
    payload
        .f64(&["restore_time"])
        .filter(|v| *v >= 0.0)
        .or_else(|| seconds_between(payload.time(&["started_at"]), payload.time(&["resolved_at"])))
        .or_else(|| seconds_between(payload.time(&["start_time"]), payload.time(&["end_time"])))
}
