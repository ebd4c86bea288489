use super::{action_of, seconds_between, MetricDefinition, MetricSet, SourceClassifier};
use crate::event::{Event, Payload, Route, Source};
use crate::store::Dimensions;

/// Status names that close an issue.
const DONE_STATUSES: [&str; 3] = ["done", "closed", "resolved"];

/// Jira webhook events (`jira:issue_created` arrives as `jira.issue.created`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JiraClassifier;

impl SourceClassifier for JiraClassifier {
    fn source(&self) -> Source {
        Source::Jira
    }

    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition> {
        let payload = event.payload();
        let mut set = MetricSet::new(route.metric_prefix(), dimensions.clone());

        set.emit("total", 1.0);
        if let Some(action) = action_of(route, &payload) {
            set.emit(&action, 1.0);
        }

        if route.entity == "issue" && moved_to_done(&payload) {
            set.emit("resolved", 1.0);
            let created = payload.time(&["issue", "fields", "created"]);
            let resolved = payload
                .time(&["issue", "fields", "resolutiondate"])
                .unwrap_or(event.timestamp);
            if let Some(secs) = seconds_between(created, Some(resolved)) {
                set.emit("resolution_time", secs);
            }
        }

        set.finish()
    }
}

/// True when the changelog carries a status transition into a done state.
fn moved_to_done(payload: &Payload<'_>) -> bool {
    let Some(items) = payload.array(&["changelog", "items"]) else {
        return false;
    };
    items.iter().map(Payload::new).any(|item| {
        item.str(&["field"]).map(|f| f.eq_ignore_ascii_case("status")) == Some(true)
            && item
                .str(&["toString"])
                .map(|s| DONE_STATUSES.iter().any(|d| s.eq_ignore_ascii_case(d)))
                == Some(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DimensionExtractor;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn classify(name: &str, data: Value) -> Vec<MetricDefinition> {
        let ts = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let event = Event::new(name, "jira", ts, data).unwrap();
        let route = event.route().unwrap();
        let dims = DimensionExtractor::new().extract(&event);
        JiraClassifier.classify(&event, &route, &dims)
    }

    fn value(metrics: &[MetricDefinition], name: &str) -> Option<f64> {
        metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }

    #[test]
    fn test_issue_created() {
        let metrics = classify(
            "jira.issue.created",
            json!({"issue": {"fields": {"project": {"key": "OPS"}}}}),
        );
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["jira.issue.total", "jira.issue.created"]);
        assert_eq!(metrics[0].dimensions.get("project").map(String::as_str), Some("OPS"));
    }

    #[test]
    fn test_issue_resolution_time() {
        let metrics = classify(
            "jira.issue.updated",
            json!({
                "issue": {"fields": {
                    "created": "2024-01-01T00:00:00.000+0000",
                    "resolutiondate": "2024-01-02T00:00:00.000+0000"
                }},
                "changelog": {"items": [
                    {"field": "assignee", "toString": "Sam"},
                    {"field": "status", "fromString": "In Progress", "toString": "Done"}
                ]}
            }),
        );
        assert_eq!(value(&metrics, "jira.issue.resolved"), Some(1.0));
        assert_eq!(value(&metrics, "jira.issue.resolution_time"), Some(86400.0));
    }

    #[test]
    fn test_resolution_falls_back_to_event_time() {
        let metrics = classify(
            "jira.issue.updated",
            json!({
                "issue": {"fields": {"created": "2024-01-01T00:00:00Z"}},
                "changelog": {"items": [{"field": "status", "toString": "closed"}]}
            }),
        );
        assert_eq!(value(&metrics, "jira.issue.resolution_time"), Some(2.0 * 86400.0));
    }

    #[test]
    fn test_status_change_not_done() {
        let metrics = classify(
            "jira.issue.updated",
            json!({"changelog": {"items": [{"field": "status", "toString": "In Review"}]}}),
        );
        assert_eq!(value(&metrics, "jira.issue.resolved"), None);
    }

    #[test]
    fn test_other_entities() {
        let metrics = classify("jira.sprint.started", json!({}));
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["jira.sprint.total", "jira.sprint.started"]);
    }
}
