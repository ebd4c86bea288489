use super::commits::analyze_commits;
use super::{action_of, seconds_between, segment, MetricDefinition, MetricSet, SourceClassifier};
use crate::event::{Event, Payload, Route, Source};
use crate::store::Dimensions;

/// GitHub webhook events.
#[derive(Debug, Clone, Copy, Default)]
pub struct GithubClassifier;

impl SourceClassifier for GithubClassifier {
    fn source(&self) -> Source {
        Source::Github
    }

    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition> {
        let payload = event.payload();
        let mut set = MetricSet::new(route.metric_prefix(), dimensions.clone());

        match route.entity {
            "push" => push(&payload, &mut set),
            "pull_request" => pull_request(route, &payload, &mut set),
            "pull_request_review" => review(route, &payload, &mut set),
            "workflow_run" | "check_run" | "check_suite" => run(route, &payload, &mut set),
            "deployment_status" => deployment_status(&payload, &mut set),
            _ => {
                set.emit("total", 1.0);
                if let Some(action) = action_of(route, &payload) {
                    set.emit(&action, 1.0);
                }
            }
        }

        set.finish()
    }
}

fn push(payload: &Payload<'_>, set: &mut MetricSet) {
    if let Some(branch) = payload.str(&["ref"]) {
        let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        set.with_dimension("branch", branch);
    }

    let commits = payload.array(&["commits"]);
    let count = commits
        .map(|c| c.len() as f64)
        .or_else(|| payload.f64(&["size"]))
        .unwrap_or(0.0);

    set.emit("total", 1.0);
    set.emit("commits", count);

    if let Some(commits) = commits {
        let analysis = analyze_commits(commits);
        if analysis.truncated {
            tracing::warn!(
                "GithubClassifier: Push with {} commits truncated for analysis",
                commits.len()
            );
        }
        analysis.emit(set);
    }
}

fn pull_request(route: &Route<'_>, payload: &Payload<'_>, set: &mut MetricSet) {
    set.emit("total", 1.0);
    let action = action_of(route, payload);
    if let Some(action) = &action {
        set.emit(action, 1.0);
    }

    let merged = payload.bool(&["pull_request", "merged"]).unwrap_or(false);
    if action.as_deref() == Some("closed") && merged {
        set.emit("merged", 1.0);
        let opened = payload.time(&["pull_request", "created_at"]);
        let merged_at = payload.time(&["pull_request", "merged_at"]);
        if let Some(secs) = seconds_between(opened, merged_at) {
            set.emit("time_to_merge", secs);
        }
    }
}

fn review(route: &Route<'_>, payload: &Payload<'_>, set: &mut MetricSet) {
    set.emit("total", 1.0);
    if let Some(action) = action_of(route, payload) {
        set.emit(&action, 1.0);
    }
    if let Some(state) = payload.str(&["review", "state"]).and_then(segment) {
        set.emit_with("state", 1.0, &[("state", state)]);
    }
}

/// Workflow runs, check runs and check suites share the same shape.
fn run(route: &Route<'_>, payload: &Payload<'_>, set: &mut MetricSet) {
    let body = payload.at(&[route.entity]).unwrap_or(*payload);

    set.emit("total", 1.0);
    if let Some(action) = action_of(route, payload) {
        set.emit(&action, 1.0);
    }
    if let Some(conclusion) = body.str(&["conclusion"]).and_then(segment) {
        set.emit(&conclusion, 1.0);
    }

    let completed = body.str(&["status"]) == Some("completed")
        || action_of(route, payload).as_deref() == Some("completed");
    if completed {
        let started = body.time(&["run_started_at"]).or_else(|| body.time(&["started_at"]));
        let finished = body.time(&["completed_at"]).or_else(|| body.time(&["updated_at"]));
        if let Some(secs) = seconds_between(started, finished) {
            set.emit("duration", secs);
        }
    }
}

fn deployment_status(payload: &Payload<'_>, set: &mut MetricSet) {
    if let Some(environment) = payload.first_str(&[
        &["deployment_status", "environment"],
        &["deployment", "environment"],
    ]) {
        set.with_dimension("environment", environment);
    }

    set.emit("total", 1.0);
    if let Some(state) = payload.str(&["deployment_status", "state"]).and_then(segment) {
        set.emit(&state, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DimensionExtractor;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    fn classify(name: &str, data: Value) -> Vec<MetricDefinition> {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let event = Event::new(name, "github", ts, data).unwrap();
        let route = event.route().unwrap();
        let dims = DimensionExtractor::new().extract(&event);
        GithubClassifier.classify(&event, &route, &dims)
    }

    fn names(metrics: &[MetricDefinition]) -> Vec<&str> {
        metrics.iter().map(|m| m.name.as_str()).collect()
    }

    fn value(metrics: &[MetricDefinition], name: &str) -> Option<f64> {
        metrics.iter().find(|m| m.name == name).map(|m| m.value)
    }

    #[test]
    fn test_push_with_n_conventional_commits() {
        let commits: Vec<Value> = (0..4)
            .map(|i| json!({"message": format!("fix(core): bug {i}")}))
            .collect();
        let metrics = classify("github.push", json!({"commits": commits}));

        let types = metrics.iter().filter(|m| m.name == "github.push.commit_type").count();
        assert_eq!(types, 4);
        assert_eq!(value(&metrics, "github.push.total"), Some(1.0));
        assert_eq!(value(&metrics, "github.push.commits"), Some(4.0));
        // No files and no stats: only the base metrics and commit types.
        assert_eq!(metrics.len(), 6);
    }

    #[test]
    fn test_push_without_commit_list_uses_size() {
        let metrics = classify("github.push", json!({"size": 3, "ref": "refs/heads/main"}));
        assert_eq!(names(&metrics), vec!["github.push.total", "github.push.commits"]);
        assert_eq!(metrics[1].value, 3.0);
        assert_eq!(metrics[0].dimensions.get("branch").map(String::as_str), Some("main"));

        let metrics = classify("github.push", json!({}));
        assert_eq!(value(&metrics, "github.push.commits"), Some(0.0));
    }

    #[test]
    fn test_push_breaking_change_and_stats() {
        let metrics = classify(
            "github.push",
            json!({"commits": [
                {"message": "feat(api)!: drop v1", "stats": {"additions": 5, "deletions": 40}},
                {"message": "wip"}
            ]}),
        );
        assert_eq!(value(&metrics, "github.push.commits"), Some(2.0));
        assert_eq!(value(&metrics, "github.push.breaking_change"), Some(1.0));
        assert_eq!(value(&metrics, "github.push.code_additions"), Some(5.0));
        assert_eq!(value(&metrics, "github.push.code_deletions"), Some(40.0));
        assert_eq!(metrics.iter().filter(|m| m.name == "github.push.commit_type").count(), 1);
    }

    #[test]
    fn test_merged_pull_request() {
        let metrics = classify(
            "github.pull_request",
            json!({
                "action": "closed",
                "pull_request": {
                    "merged": true,
                    "created_at": "2024-01-01T00:00:00Z",
                    "merged_at": "2024-01-01T02:00:00Z"
                }
            }),
        );
        assert_eq!(
            names(&metrics),
            vec![
                "github.pull_request.total",
                "github.pull_request.closed",
                "github.pull_request.merged",
                "github.pull_request.time_to_merge"
            ]
        );
        assert_eq!(value(&metrics, "github.pull_request.time_to_merge"), Some(7200.0));
    }

    #[test]
    fn test_closed_unmerged_pull_request() {
        let metrics = classify(
            "github.pull_request.closed",
            json!({"pull_request": {"merged": false}}),
        );
        assert_eq!(
            names(&metrics),
            vec!["github.pull_request.total", "github.pull_request.closed"]
        );
    }

    #[test]
    fn test_workflow_run_duration() {
        let metrics = classify(
            "github.workflow_run",
            json!({
                "action": "completed",
                "workflow_run": {
                    "status": "completed",
                    "conclusion": "success",
                    "run_started_at": "2024-01-01T00:00:00Z",
                    "updated_at": "2024-01-01T00:05:00Z"
                }
            }),
        );
        assert_eq!(value(&metrics, "github.workflow_run.success"), Some(1.0));
        assert_eq!(value(&metrics, "github.workflow_run.duration"), Some(300.0));
    }

    #[test]
    fn test_deployment_status_environment() {
        let metrics = classify(
            "github.deployment_status",
            json!({"deployment_status": {"state": "success", "environment": "production"}}),
        );
        assert_eq!(
            names(&metrics),
            vec!["github.deployment_status.total", "github.deployment_status.success"]
        );
        for m in &metrics {
            assert_eq!(m.dimensions.get("environment").map(String::as_str), Some("production"));
        }
    }

    #[test]
    fn test_other_entities_emit_total_and_action() {
        let metrics = classify("github.issues", json!({"action": "opened"}));
        assert_eq!(names(&metrics), vec!["github.issues.total", "github.issues.opened"]);

        let metrics = classify("github.release.published", json!({}));
        assert_eq!(names(&metrics), vec!["github.release.total", "github.release.published"]);
    }
}
