use super::{seconds_between, segment, MetricDefinition, MetricSet, SourceClassifier};
use crate::event::{Event, Route, Source};
use crate::store::Dimensions;

/// Events from generic task trackers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskClassifier;

impl SourceClassifier for TaskClassifier {
    fn source(&self) -> Source {
        Source::Task
    }

    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition> {
        let payload = event.payload();

        // `task.created` has no entity segment of its own.
        let (entity, raw_action) = match route.action {
            Some(action) => (route.entity, action),
            None => ("item", route.entity),
        };
        let action = segment(raw_action).or_else(|| payload.str(&["action"]).and_then(segment));

        let mut set = MetricSet::new(format!("task.{entity}"), dimensions.clone());
        set.emit("total", 1.0);
        if let Some(action) = &action {
            set.emit(action, 1.0);
        }

        if action.as_deref() == Some("completed") {
            let created = payload.time(&["created_at"]);
            let completed = payload.time(&["completed_at"]).unwrap_or(event.timestamp);
            if let Some(secs) = seconds_between(created, Some(completed)) {
                set.emit("completion_time", secs);
            }
        }

        set.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DimensionExtractor;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn classify(name: &str, data: Value) -> Vec<MetricDefinition> {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let event = Event::new(name, "task", ts, data).unwrap();
        let route = event.route().unwrap();
        let dims = DimensionExtractor::new().extract(&event);
        TaskClassifier.classify(&event, &route, &dims)
    }

    #[test]
    fn test_short_names_map_to_item() {
        let metrics = classify("task.created", json!({"project": "web"}));
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["task.item.total", "task.item.created"]);
        assert_eq!(metrics[0].dimensions.get("project").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_completion_time() {
        let metrics = classify(
            "task.item.completed",
            json!({"created_at": "2024-01-01T00:00:00Z"}),
        );
        let completion = metrics.iter().find(|m| m.name == "task.item.completion_time");
        assert_eq!(completion.map(|m| m.value), Some(12.0 * 3600.0));
    }
}
