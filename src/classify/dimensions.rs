//! Source-specific dimension extraction.

use crate::event::{Event, Payload, Source, UNKNOWN};
use crate::store::Dimensions;

/// Builds the flat dimension map shared by every metric derived from an event.
///
/// Pure and infallible: missing fields become `"unknown"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DimensionExtractor;

impl DimensionExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, event: &Event) -> Dimensions {
        let payload = event.payload();
        let mut dims = match Source::from_event_name(&event.name) {
            Some(Source::Github) => github(&payload),
            Some(Source::Gitlab) => gitlab(&payload),
            Some(Source::Bitbucket) => bitbucket(&payload),
            Some(Source::Jira) => jira(&payload),
            Some(Source::Ci) => ci(&payload),
            Some(Source::Task) => task(&payload),
            None => Dimensions::new(),
        };
        dims.insert("source".to_string(), event.source.clone());
        dims
    }
}

/// Owner part of an `owner/name` repository path.
pub fn organization_of(repository: &str) -> Option<&str> {
    repository
        .split_once('/')
        .map(|(owner, _)| owner)
        .filter(|owner| !owner.is_empty())
}

fn github(p: &Payload<'_>) -> Dimensions {
    let repository = p.text_or_unknown(&["repository", "full_name"]);
    let organization = organization_of(&repository)
        .map(str::to_string)
        .unwrap_or_else(|| p.text_or_unknown(&["organization", "login"]));

    let mut dims = Dimensions::new();
    dims.insert("repository".to_string(), repository);
    dims.insert("organization".to_string(), organization);
    dims
}

fn gitlab(p: &Payload<'_>) -> Dimensions {
    let repository = p.text_or_unknown(&["project", "path_with_namespace"]);
    let organization = p
        .text(&["project", "namespace"])
        .or_else(|| organization_of(&repository).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let mut dims = Dimensions::new();
    dims.insert("repository".to_string(), repository);
    dims.insert("organization".to_string(), organization);
    dims
}

fn bitbucket(p: &Payload<'_>) -> Dimensions {
    let repository = p.text_or_unknown(&["repository", "full_name"]);
    let organization = p
        .text(&["repository", "workspace", "slug"])
        .or_else(|| organization_of(&repository).map(str::to_string))
        .unwrap_or_else(|| UNKNOWN.to_string());

    let mut dims = Dimensions::new();
    dims.insert("repository".to_string(), repository);
    dims.insert("organization".to_string(), organization);
    dims
}

fn jira(p: &Payload<'_>) -> Dimensions {
    let mut dims = Dimensions::new();
    dims.insert(
        "project".to_string(),
        p.text_or_unknown(&["issue", "fields", "project", "key"]),
    );
    dims.insert(
        "issue_type".to_string(),
        p.text_or_unknown(&["issue", "fields", "issuetype", "name"]),
    );
    dims.insert(
        "priority".to_string(),
        p.text_or_unknown(&["issue", "fields", "priority", "name"]),
    );
    dims
}

fn ci(p: &Payload<'_>) -> Dimensions {
    // CI producers send the repository either as a plain string or as an object.
    let repository = p
        .str(&["repository"])
        .map(str::to_string)
        .unwrap_or_else(|| p.text_or_unknown(&["repository", "full_name"]));

    let mut dims = Dimensions::new();
    dims.insert("repository".to_string(), repository);
    dims.insert("branch".to_string(), p.text_or_unknown(&["branch"]));
    dims.insert("environment".to_string(), p.text_or_unknown(&["environment"]));
    dims.insert(
        "pipeline".to_string(),
        p.first_str(&[&["pipeline"], &["workflow"]])
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN.to_string()),
    );
    dims
}

fn task(p: &Payload<'_>) -> Dimensions {
    let mut dims = Dimensions::new();
    dims.insert(
        "project".to_string(),
        p.first_str(&[&["project", "name"], &["project"]])
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN.to_string()),
    );
    dims.insert(
        "assignee".to_string(),
        p.first_str(&[&["assignee", "name"], &["assignee"]])
            .map(str::to_string)
            .unwrap_or_else(|| UNKNOWN.to_string()),
    );
    dims.insert("priority".to_string(), p.text_or_unknown(&["priority"]));
    dims
}
