use serde_json::Value;
use std::collections::BTreeSet;

use super::commits::{analyze_commits, MAX_COMMITS};
use super::{action_of, MetricDefinition, MetricSet, SourceClassifier};
use crate::event::{Event, Payload, Route, Source};
use crate::store::Dimensions;

/// Bitbucket Cloud webhook events (`repo:push`, `pullrequest:*`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BitbucketClassifier;

impl SourceClassifier for BitbucketClassifier {
    fn source(&self) -> Source {
        Source::Bitbucket
    }

    fn classify(&self, event: &Event, route: &Route<'_>, dimensions: &Dimensions) -> Vec<MetricDefinition> {
        let payload = event.payload();

        match (route.entity, route.action) {
            // `repo.push` is reported as `bitbucket.push.*` to line up with other forges.
            ("repo", Some("push")) | ("push", _) => {
                let mut set = MetricSet::new("bitbucket.push", dimensions.clone());
                push(&payload, &mut set);
                set.finish()
            }
            ("pullrequest", _) => {
                let mut set = MetricSet::new(route.metric_prefix(), dimensions.clone());
                set.emit("total", 1.0);
                if let Some(action) = action_of(route, &payload) {
                    if action == "fulfilled" {
                        set.emit("merged", 1.0);
                    }
                    set.emit(&action, 1.0);
                }
                set.finish()
            }
            _ => {
                let mut set = MetricSet::new(route.metric_prefix(), dimensions.clone());
                set.emit("total", 1.0);
                if let Some(action) = action_of(route, &payload) {
                    set.emit(&action, 1.0);
                }
                set.finish()
            }
        }
    }
}

fn push(payload: &Payload<'_>, set: &mut MetricSet) {
    let changes = payload.array(&["push", "changes"]).map(Vec::as_slice).unwrap_or(&[]);

    let mut commits: Vec<Value> = Vec::new();
    let mut branches: BTreeSet<&str> = BTreeSet::new();
    let mut count = 0.0;
    for change in changes {
        let change = Payload::new(change);
        if let Some(branch) = change.str(&["new", "name"]) {
            branches.insert(branch);
        }
        if let Some(list) = change.array(&["commits"]) {
            count += list.len() as f64;
            let room = MAX_COMMITS.saturating_sub(commits.len());
            commits.extend(list.iter().take(room).cloned());
        }
    }

    // A push touching several branches has no single branch to report.
    if let [branch] = Vec::from_iter(branches).as_slice() {
        set.with_dimension("branch", *branch);
    }

    set.emit("total", 1.0);
    set.emit("commits", count);
    analyze_commits(&commits).emit(set);
}
