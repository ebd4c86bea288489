//! Commit analysis for push events.

use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use super::MetricSet;
use crate::event::Payload;

/// Commits examined per push. Larger pushes are counted but not inspected.
pub const MAX_COMMITS: usize = 1000;

/// File paths examined per commit and per change list.
pub const MAX_FILES_PER_COMMIT: usize = 1000;

/// `type(scope)!: description` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConventionalCommit {
    pub kind: String,
    pub scope: Option<String>,
    pub breaking: bool,
    pub description: String,
}

fn conventional_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<type>[A-Za-z]+)(?:\((?P<scope>[^()\r\n]*)\))?(?P<breaking>!)?:\s+(?P<description>\S.*)$").ok()
    })
    .as_ref()
}

/// Parse the subject line of a commit message.
pub fn parse_conventional(message: &str) -> Option<ConventionalCommit> {
    let subject = message.lines().next()?.trim();
    let caps = conventional_re()?.captures(subject)?;

    let footer_breaking = message
        .lines()
        .skip(1)
        .any(|line| line.starts_with("BREAKING CHANGE:") || line.starts_with("BREAKING-CHANGE:"));

    Some(ConventionalCommit {
        kind: caps["type"].to_ascii_lowercase(),
        scope: caps
            .name("scope")
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty()),
        breaking: caps.name("breaking").is_some() || footer_breaking,
        description: caps["description"].trim().to_string(),
    })
}

/// Top-level directory of a repository path, or `root` for files at the top.
pub fn top_level_directory(path: &str) -> String {
    let path = path.trim_start_matches('/');
    match path.split_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => "root".to_string(),
    }
}

/// Lower-cased file extension, or `none`. Dotfiles have no extension.
pub fn file_extension(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => "none".to_string(),
    }
}

/// Everything learned from the commit list of one push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushAnalysis {
    pub conventional: Vec<ConventionalCommit>,
    /// Unique files touched, bucketed by top-level directory.
    pub directories: BTreeMap<String, usize>,
    /// Unique files touched, bucketed by extension.
    pub filetypes: BTreeMap<String, usize>,
    pub additions: f64,
    pub deletions: f64,
    /// Entries that were not commit objects.
    pub skipped: usize,
    /// True when the list was longer than [`MAX_COMMITS`].
    pub truncated: bool,
}

/// Inspect each commit independently; a malformed entry only loses its own data.
pub fn analyze_commits(commits: &[Value]) -> PushAnalysis {
    let mut analysis = PushAnalysis {
        truncated: commits.len() > MAX_COMMITS,
        ..Default::default()
    };
    let mut files: BTreeSet<&str> = BTreeSet::new();

    for commit in commits.iter().take(MAX_COMMITS) {
        if !commit.is_object() {
            analysis.skipped += 1;
            continue;
        }
        let c = Payload::new(commit);

        if let Some(parsed) = c.str(&["message"]).and_then(parse_conventional) {
            analysis.conventional.push(parsed);
        }

        for key in ["added", "modified", "removed"] {
            if let Some(paths) = c.array(&[key]) {
                files.extend(
                    paths
                        .iter()
                        .take(MAX_FILES_PER_COMMIT)
                        .filter_map(Value::as_str)
                        .filter(|p| !p.trim().is_empty()),
                );
            }
        }

        analysis.additions += c.f64(&["stats", "additions"]).unwrap_or(0.0).max(0.0);
        analysis.deletions += c.f64(&["stats", "deletions"]).unwrap_or(0.0).max(0.0);
    }

    for file in files {
        *analysis.directories.entry(top_level_directory(file)).or_insert(0) += 1;
        *analysis.filetypes.entry(file_extension(file)).or_insert(0) += 1;
    }

    analysis
}

impl PushAnalysis {
    /// Emit the per-commit metrics of a push onto `set`.
    pub fn emit(&self, set: &mut MetricSet) {
        for commit in &self.conventional {
            let scope = commit.scope.clone().unwrap_or_else(|| "none".to_string());
            set.emit_with(
                "commit_type",
                1.0,
                &[("type", commit.kind.clone()), ("scope", scope.clone())],
            );
            if commit.breaking {
                set.emit_with(
                    "breaking_change",
                    1.0,
                    &[("type", commit.kind.clone()), ("scope", scope)],
                );
            }
        }

        for (directory, count) in &self.directories {
            set.emit_with("directory_changes", *count as f64, &[("directory", directory.clone())]);
        }
        for (filetype, count) in &self.filetypes {
            set.emit_with("filetype_changes", *count as f64, &[("filetype", filetype.clone())]);
        }

        if self.additions > 0.0 {
            set.emit("code_additions", self.additions);
        }
        if self.deletions > 0.0 {
            set.emit("code_deletions", self.deletions);
        }
    }
}
