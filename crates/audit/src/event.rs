use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    FormSubmission,
    WebhookCall,
    ApiRequest,
    ValidationError,
    SystemError,
    HealthCheck,
    DataProcessing,
    NotificationSent,
    RetryAttempt,
    FallbackTriggered,
    QueueOperation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    FormInteraction,
    WebhookManagement,
    ThirdPartyIntegration,
    ErrorHandling,
    SystemMonitoring,
    DataValidation,
    Security,
    Performance,
}

/// Optional operation context attached to an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
}

/// One append-only audit record. Ids are unique, so downstream sinks can
/// deduplicate redelivered batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub event_type: AuditEventType,
    pub category: AuditCategory,
    pub details: Value,
    #[serde(default)]
    pub metadata: AuditMetadata,
}

/// Filter for `AuditLogger::export_logs`.
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_types: Vec<AuditEventType>,
    pub categories: Vec<AuditCategory>,
}

impl ExportFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(start) = self.start {
            if event.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if event.timestamp > end {
                return false;
            }
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&event.category) {
            return false;
        }
        true
    }
}
