//! Metric and alert model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Contextual attributes of a metric. Ordered so serialization is canonical.
pub type Dimensions = BTreeMap<String, String>;

/// Deterministic identity of a dimension set.
pub fn fingerprint(dimensions: &Dimensions) -> String {
    serde_json::to_string(dimensions).unwrap_or_default()
}

/// Whether a metric was recorded from an event or produced by aggregation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Raw,
    Aggregate,
}

/// A single measured value with context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: Option<i64>,
    /// `source.entity.action[.detail]`, or `{base}.{period}` for aggregates.
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(default)]
    pub kind: MetricKind,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        dimensions: Dimensions,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            value,
            timestamp,
            source: source.into(),
            dimensions,
            kind: MetricKind::Raw,
        }
    }

    /// An aggregate row; only the aggregation engine creates these.
    pub fn aggregate(
        name: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
        dimensions: Dimensions,
    ) -> Self {
        Self {
            kind: MetricKind::Aggregate,
            ..Self::new(name, value, timestamp, source, dimensions)
        }
    }

    /// New version of this metric carrying `value`, keeping its identity.
    pub fn with_value(&self, value: f64) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.dimensions)
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind == MetricKind::Aggregate
    }

    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }
}

// --- Alerts ---

/// Alert state machine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("cannot {action} an alert that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: AlertStatus,
    },
    #[error("severity can only escalate ({from} -> {to} is not allowed)")]
    InvalidEscalation { from: Severity, to: Severity },
}

/// Ordered so that escalation means moving to a greater value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        })
    }
}

/// A metric that breached a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<i64>,
    pub metric: Metric,
    pub severity: Severity,
    pub threshold: f64,
    pub status: AlertStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(metric: Metric, severity: Severity, threshold: f64, created_at: DateTime<Utc>) -> Self {
        let message = format!(
            "{} is {} (threshold {})",
            metric.name, metric.value, threshold
        );
        Self {
            id: None,
            metric,
            severity,
            threshold,
            status: AlertStatus::Active,
            message,
            created_at,
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> Result<(), AlertError> {
        if self.status != AlertStatus::Active {
            return Err(AlertError::InvalidTransition {
                action: "acknowledge",
                status: self.status,
            });
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(at);
        Ok(())
    }

    pub fn resolve(&mut self, at: DateTime<Utc>) -> Result<(), AlertError> {
        if self.status == AlertStatus::Resolved {
            return Err(AlertError::InvalidTransition {
                action: "resolve",
                status: self.status,
            });
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
        Ok(())
    }

    /// Raise the severity. Never lowers it and never touches resolved alerts.
    pub fn escalate(&mut self, to: Severity) -> Result<(), AlertError> {
        if self.status == AlertStatus::Resolved {
            return Err(AlertError::InvalidTransition {
                action: "escalate",
                status: self.status,
            });
        }
        if to <= self.severity {
            return Err(AlertError::InvalidEscalation {
                from: self.severity,
                to,
            });
        }
        self.severity = to;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}

/// Warning/critical limits for one metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub metric_name: String,
    pub warning: f64,
    pub critical: f64,
}

impl AlertThresholds {
    /// Alert for `metric` if it matches this rule and breaches a limit.
    pub fn evaluate(&self, metric: &Metric, now: DateTime<Utc>) -> Option<Alert> {
        if metric.name != self.metric_name {
            return None;
        }
        if metric.value >= self.critical {
            Some(Alert::new(metric.clone(), Severity::Critical, self.critical, now))
        } else if metric.value >= self.warning {
            Some(Alert::new(metric.clone(), Severity::Warning, self.warning, now))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn metric(name: &str, value: f64) -> Metric {
        let mut dims = Dimensions::new();
        dims.insert("repository".to_string(), "acme/api".to_string());
        Metric::new(name, value, now(), "ci", dims)
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let mut a = Dimensions::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let mut b = Dimensions::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn test_with_value_keeps_identity() {
        let m = Metric::aggregate("github.push.daily", 3.0, now(), "github", Dimensions::new()).with_id(7);
        let updated = m.with_value(5.0);
        assert_eq!(updated.id, Some(7));
        assert_eq!(updated.value, 5.0);
        assert_eq!(updated.fingerprint(), m.fingerprint());
        assert!(updated.is_aggregate());
    }

    #[test]
    fn test_kind_does_not_depend_on_name() {
        // A CI job named "daily" produces a raw metric with a period-like suffix.
        let raw = metric("ci.backup.daily", 1.0);
        assert_eq!(raw.kind, MetricKind::Raw);
        assert!(!raw.is_aggregate());

        let json = serde_json::to_value(&raw).unwrap();
        assert_eq!(json["kind"], "raw");
        let mut legacy = json.clone();
        legacy.as_object_mut().unwrap().remove("kind");
        let parsed: Metric = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.kind, MetricKind::Raw);
    }

    #[test]
    fn test_alert_lifecycle() {
        let mut alert = Alert::new(metric("ci.build.duration", 900.0), Severity::Info, 600.0, now());
        assert!(alert.is_open());

        alert.escalate(Severity::Warning).unwrap();
        alert.acknowledge(now()).unwrap();
        assert_eq!(alert.status, AlertStatus::Acknowledged);
        assert!(alert.acknowledge(now()).is_err());

        alert.escalate(Severity::Critical).unwrap();
        alert.resolve(now()).unwrap();
        assert_eq!(alert.resolved_at, Some(now()));
        assert!(!alert.is_open());

        assert_eq!(
            alert.resolve(now()),
            Err(AlertError::InvalidTransition {
                action: "resolve",
                status: AlertStatus::Resolved
            })
        );
    }

    #[test]
    fn test_escalation_is_one_directional() {
        let mut alert = Alert::new(metric("ci.build.duration", 900.0), Severity::Warning, 600.0, now());
        assert_eq!(
            alert.escalate(Severity::Info),
            Err(AlertError::InvalidEscalation {
                from: Severity::Warning,
                to: Severity::Info
            })
        );
        assert!(alert.escalate(Severity::Warning).is_err());
        assert_eq!(alert.severity, Severity::Warning);
    }

    #[test]
    fn test_thresholds_evaluate() {
        let rule = AlertThresholds {
            metric_name: "ci.build.duration".to_string(),
            warning: 600.0,
            critical: 1800.0,
        };
        assert!(rule.evaluate(&metric("ci.build.duration", 100.0), now()).is_none());
        assert!(rule.evaluate(&metric("ci.test.duration", 5000.0), now()).is_none());

        let warn = rule.evaluate(&metric("ci.build.duration", 700.0), now()).unwrap();
        assert_eq!(warn.severity, Severity::Warning);
        assert_eq!(warn.threshold, 600.0);

        let crit = rule.evaluate(&metric("ci.build.duration", 2000.0), now()).unwrap();
        assert_eq!(crit.severity, Severity::Critical);
        assert_eq!(crit.status, AlertStatus::Active);
    }
}
