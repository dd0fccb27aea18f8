use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Default `source` tag stamped onto submissions that do not carry one.
pub const DEFAULT_SOURCE: &str = "courier";

/// Outbound payload handed to the delivery pipeline.
///
/// An open key/value map plus the reserved fields `timestamp`, `source` and
/// `attempt`. The attempt counter is the only field mutated after creation,
/// by the retry loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Submission {
    /// Build a submission from caller-provided fields.
    ///
    /// Reserved keys present in the map take precedence over the defaults,
    /// mirroring the "set if absent" rule for `timestamp` and `source`.
    pub fn new(mut fields: Map<String, Value>) -> Self {
        let timestamp = fields
            .remove("timestamp")
            .and_then(|v| v.as_str().map(str::to_owned))
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let source = fields
            .remove("source")
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        fields.remove("attempt");

        Self {
            timestamp,
            source,
            attempt: 1,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// A configured outbound HTTP target. Immutable after configuration load.
///
/// Lower `priority` is tried first; ties keep declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority: 1,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Cached health observation for one endpoint URL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
}

/// A submission parked for later replay after every endpoint failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub data: Submission,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// Where a dead letter came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterSource {
    RetryQueue,
    Job,
}

/// Terminal record for work that exhausted its retry budget.
///
/// Only written when dead-letter retention is enabled; otherwise exhausted
/// work is dropped with an audit entry alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub source: DeadLetterSource,
    pub payload: Value,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(source: DeadLetterSource, payload: Value, attempts: u32, last_error: String) -> Self {
        Self {
            id: format!("dlq_{}", nanoid::nanoid!(12)),
            source,
            payload,
            attempts,
            last_error,
            created_at: Utc::now(),
        }
    }
}

/// Job ordering within a queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Normal,
    High,
}

/// Priority attached to a routed business event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_submission_defaults() {
        let sub = Submission::new(fields(json!({"email": "s@x.com"})));

        assert_eq!(sub.source, DEFAULT_SOURCE);
        assert_eq!(sub.attempt, 1);
        assert_eq!(sub.field("email"), Some(&json!("s@x.com")));
    }

    #[test]
    fn test_submission_keeps_caller_timestamp_and_source() {
        let sub = Submission::new(fields(json!({
            "timestamp": "2026-01-02T03:04:05Z",
            "source": "intake-form",
            "name": "Dr. Sarah",
        })));

        assert_eq!(sub.source, "intake-form");
        assert_eq!(sub.timestamp.to_rfc3339(), "2026-01-02T03:04:05+00:00");
    }

    #[test]
    fn test_submission_serializes_flat() {
        let sub = Submission::new(fields(json!({"email": "s@x.com"})));
        let value = serde_json::to_value(&sub).unwrap();

        assert!(value.get("email").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("source").is_some());
        assert!(value.get("fields").is_none(), "map should be flattened");
    }

    #[test]
    fn test_endpoint_builder() {
        let ep = Endpoint::new("backup", "https://hooks.example.com/b")
            .with_priority(2)
            .with_timeout(Duration::from_secs(15));

        assert_eq!(ep.priority, 2);
        assert_eq!(ep.timeout, Duration::from_secs(15));
    }
}
