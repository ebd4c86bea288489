//! Webhook events and payload access.
//!
//! Payloads are kept as `serde_json::Value` with string keys only. Every lookup
//! helper fails soft to `None` so classification never has to handle errors
//! from sparse or malformed data.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Placeholder used for any dimension that cannot be read from a payload.
pub const UNKNOWN: &str = "unknown";

/// Event validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event {0} must not be empty")]
    MissingField(&'static str),
}

/// Something that happened in an upstream system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: Option<i64>,
    /// Dot-hierarchical name, e.g. `github.push.created`.
    pub name: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Event {
    /// Create a validated event. A `null` payload becomes an empty map.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        data: Value,
    ) -> Result<Self, EventError> {
        let name = name.into();
        let source = source.into();

        if name.trim().is_empty() {
            return Err(EventError::MissingField("name"));
        }
        if source.trim().is_empty() {
            return Err(EventError::MissingField("source"));
        }

        let data = if data.is_null() { empty_object() } else { data };

        Ok(Self {
            id: None,
            name,
            source,
            timestamp,
            data,
        })
    }

    /// Read-only view over the payload.
    pub fn payload(&self) -> Payload<'_> {
        Payload::new(&self.data)
    }

    /// Split the event name into its dispatch route, if the prefix is a known source.
    pub fn route(&self) -> Option<Route<'_>> {
        Route::parse(&self.name)
    }
}

/// Upstream systems with dedicated classification rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Github,
    Jira,
    Gitlab,
    Bitbucket,
    Ci,
    Task,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Github,
        Source::Jira,
        Source::Gitlab,
        Source::Bitbucket,
        Source::Ci,
        Source::Task,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Github => "github",
            Source::Jira => "jira",
            Source::Gitlab => "gitlab",
            Source::Bitbucket => "bitbucket",
            Source::Ci => "ci",
            Source::Task => "task",
        }
    }

    /// Resolve the source from the `source.` prefix of an event name.
    pub fn from_event_name(name: &str) -> Option<Self> {
        let (prefix, _) = name.split_once('.')?;
        Self::ALL.into_iter().find(|s| s.as_str() == prefix)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(source, entity, action)` triple parsed from an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub source: Source,
    pub entity: &'a str,
    /// Everything after the entity segment, e.g. `created` or `run.completed`.
    pub action: Option<&'a str>,
}

impl<'a> Route<'a> {
    pub fn parse(name: &'a str) -> Option<Self> {
        let source = Source::from_event_name(name)?;
        let mut parts = name.splitn(3, '.');
        parts.next();
        let entity = parts.next().filter(|s| !s.is_empty())?;
        let action = parts.next().filter(|s| !s.is_empty());
        Some(Self {
            source,
            entity,
            action,
        })
    }

    /// Metric name prefix for this route: `{source}.{entity}`.
    pub fn metric_prefix(&self) -> String {
        format!("{}.{}", self.source, self.entity)
    }
}

/// Fail-soft accessor over a JSON payload.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    value: &'a Value,
}

impl<'a> Payload<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    /// True for objects, and for `null` which is treated as an empty map.
    pub fn is_map(&self) -> bool {
        self.value.is_object() || self.value.is_null()
    }

    pub fn value(&self) -> &'a Value {
        self.value
    }

    /// Walk a path of object keys.
    pub fn get(&self, path: &[&str]) -> Option<&'a Value> {
        let mut current = self.value;
        for key in path {
            current = current.as_object()?.get(*key)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    /// Nested payload at `path`, if it exists.
    pub fn at(&self, path: &[&str]) -> Option<Payload<'a>> {
        self.get(path).map(Payload::new)
    }

    /// Non-empty string at `path`.
    pub fn str(&self, path: &[&str]) -> Option<&'a str> {
        self.get(path)?.as_str().filter(|s| !s.trim().is_empty())
    }

    /// Scalar at `path` rendered as a normalized dimension value.
    pub fn text(&self, path: &[&str]) -> Option<String> {
        self.get(path).and_then(normalize_value)
    }

    pub fn text_or_unknown(&self, path: &[&str]) -> String {
        self.text(path).unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// Number at `path`; numeric strings are accepted.
    pub fn f64(&self, path: &[&str]) -> Option<f64> {
        match self.get(path)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
    }

    /// Boolean at `path`; `"true"`/`"false"` strings are accepted.
    pub fn bool(&self, path: &[&str]) -> Option<bool> {
        match self.get(path)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn array(&self, path: &[&str]) -> Option<&'a Vec<Value>> {
        self.get(path)?.as_array()
    }

    /// Timestamp at `path` (RFC 3339, naive UTC, or epoch seconds).
    pub fn time(&self, path: &[&str]) -> Option<DateTime<Utc>> {
        match self.get(path)? {
            Value::String(s) => parse_timestamp(s),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            _ => None,
        }
    }

    /// First non-empty string among several candidate paths.
    pub fn first_str(&self, paths: &[&[&str]]) -> Option<&'a str> {
        paths.iter().find_map(|p| self.str(p))
    }
}

/// Render a scalar JSON value as a dimension string.
///
/// Booleans become `"true"`/`"false"`, numbers keep their shortest form and
/// RFC 3339 timestamps are re-rendered as ISO-8601 UTC. Objects, arrays,
/// nulls and blank strings yield `None`.
pub fn normalize_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => Some(
                    dt.with_timezone(&Utc)
                        .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                ),
                Err(_) => Some(s.to_string()),
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a timestamp string from a payload.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }
    // Jira style offsets without a colon, e.g. 2024-01-01T10:00:00.000+0000
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_name_and_source() {
        assert_eq!(
            Event::new("", "github", ts(), json!({})),
            Err(EventError::MissingField("name"))
        );
        assert_eq!(
            Event::new("github.push", "  ", ts(), json!({})),
            Err(EventError::MissingField("source"))
        );
    }

    #[test]
    fn test_new_replaces_null_payload() {
        let event = Event::new("github.push", "github", ts(), Value::Null).unwrap();
        assert_eq!(event.data, json!({}));
        assert!(event.payload().is_map());
    }

    #[test]
    fn test_route_parsing() {
        let route = Route::parse("github.push.created").unwrap();
        assert_eq!(route.source, Source::Github);
        assert_eq!(route.entity, "push");
        assert_eq!(route.action, Some("created"));

        let route = Route::parse("ci.deploy.run.completed").unwrap();
        assert_eq!(route.entity, "deploy");
        assert_eq!(route.action, Some("run.completed"));

        let route = Route::parse("github.push").unwrap();
        assert_eq!(route.action, None);
        assert_eq!(route.metric_prefix(), "github.push");

        assert!(Route::parse("slack.message").is_none());
        assert!(Route::parse("github").is_none());
        assert!(Route::parse("github.").is_none());
    }

    #[test]
    fn test_payload_lookups_fail_soft() {
        let data = json!({
            "repository": {"full_name": "acme/api", "private": true, "id": 42},
            "size": "3",
            "empty": "",
            "nothing": null
        });
        let p = Payload::new(&data);

        assert_eq!(p.str(&["repository", "full_name"]), Some("acme/api"));
        assert_eq!(p.text(&["repository", "private"]), Some("true".to_string()));
        assert_eq!(p.text(&["repository", "id"]), Some("42".to_string()));
        assert_eq!(p.f64(&["size"]), Some(3.0));
        assert_eq!(p.str(&["empty"]), None);
        assert_eq!(p.get(&["nothing"]), None);
        assert_eq!(p.str(&["repository", "full_name", "deeper"]), None);
        assert_eq!(p.text_or_unknown(&["missing"]), UNKNOWN);
    }

    #[test]
    fn test_normalize_dates() {
        assert_eq!(
            normalize_value(&json!("2024-01-01T02:00:00+02:00")),
            Some("2024-01-01T00:00:00Z".to_string())
        );
        assert_eq!(normalize_value(&json!(["a"])), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z"), Some(ts()));
        assert_eq!(parse_timestamp("2024-01-01 00:00:00"), Some(ts()));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00.000+0000"), Some(ts()));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_deserialize_event() {
        let event: Event = serde_json::from_value(json!({
            "name": "github.push",
            "source": "github",
            "timestamp": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(event.data, json!({}));
        assert_eq!(event.id, None);
    }
}
