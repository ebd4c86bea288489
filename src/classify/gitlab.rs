use super::commits::analyze_commits;
use super::{action_of, seconds_between, segment, MetricDefinition, MetricSet, SourceClassifier};
use crate::event::{Event, Payload, Route, Source};
use crate::store::Dimensions;

/// GitLab webhook events.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitlabClassifier;

impl SourceClassifier for GitlabClassifier {
    fn source(&self) -> Source {
        Source::Gitlab
    }

    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition> {
        let payload = event.payload();
        let mut set = MetricSet::new(route.metric_prefix(), dimensions.clone());

        match route.entity {
            "push" => push(&payload, &mut set),
            "merge_request" => merge_request(route, &payload, &mut set),
            "pipeline" => pipeline(&payload, &mut set),
            "deployment" => deployment(&payload, &mut set),
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
    let count = payload
        .f64(&["total_commits_count"])
        .or_else(|| commits.map(|c| c.len() as f64))
        .unwrap_or(0.0);

    set.emit("total", 1.0);
    set.emit("commits", count);

    if let Some(commits) = commits {
        analyze_commits(commits).emit(set);
    }
}

fn merge_request(route: &Route<'_>, payload: &Payload<'_>, set: &mut MetricSet) {
    set.emit("total", 1.0);

    let action = route
        .action
        .and_then(segment)
        .or_else(|| payload.str(&["object_attributes", "action"]).and_then(segment));
    // GitLab reports a merge as action "merge" and state "merged".
    let merged = action.as_deref() == Some("merge")
        || payload.str(&["object_attributes", "state"]) == Some("merged");

    if let Some(action) = &action {
        set.emit(action, 1.0);
    }
    if merged {
        set.emit("merged", 1.0);
        let opened = payload.time(&["object_attributes", "created_at"]);
        let merged_at = payload.time(&["object_attributes", "merged_at"]);
        if let Some(secs) = seconds_between(opened, merged_at) {
            set.emit("time_to_merge", secs);
        }
    }
}

fn pipeline(payload: &Payload<'_>, set: &mut MetricSet) {
    set.emit("total", 1.0);
    if let Some(status) = payload.str(&["object_attributes", "status"]).and_then(segment) {
        set.emit(&status, 1.0);
    }

    let duration = payload.f64(&["object_attributes", "duration"]).or_else(|| {
        seconds_between(
            payload.time(&["object_attributes", "created_at"]),
            payload.time(&["object_attributes", "finished_at"]),
        )
    });
    if let Some(secs) = duration.filter(|d| *d >= 0.0) {
        set.emit("duration", secs);
    }
}

fn deployment(payload: &Payload<'_>, set: &mut MetricSet) {
    if let Some(environment) = payload.str(&["environment"]) {
        set.with_dimension("environment", environment);
    }
    set.emit("total", 1.0);
    if let Some(status) = payload.str(&["status"]).and_then(segment) {
        set.emit(&status, 1.0);
    }
}
