use crate::event::{AuditCategory, AuditEvent, AuditEventType, AuditMetadata, ExportFilter};
use crate::sanitize::{sanitize_url, sanitize_value};
use crate::sink::AuditSink;
use chrono::Utc;
use courier_store::{load_records, save_records, DurableStore};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const BUFFER_CAPACITY: usize = 100;
const BACKUP_CAPACITY: usize = 500;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered, periodically flushed audit trail.
///
/// Logging never blocks or fails the operation being audited: sink and
/// backup errors are absorbed here and retried on the next flush cycle.
#[derive(Clone)]
pub struct AuditLogger {
    inner: Arc<Inner>,
}

struct Inner {
    buffer: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    backup_capacity: usize,
    sink: Arc<dyn AuditSink>,
    backup: Arc<dyn DurableStore>,
    session_id: String,
    console: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditStats {
    pub total_logs: usize,
    pub recent_errors: usize,
    pub avg_duration_ms: u64,
    pub health_score: u8,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>, backup: Arc<dyn DurableStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer: Mutex::new(VecDeque::new()),
                capacity: BUFFER_CAPACITY,
                backup_capacity: BACKUP_CAPACITY,
                sink,
                backup,
                session_id: nanoid::nanoid!(12),
                console: false,
            }),
        }
    }

    /// Mirror each entry to `tracing` as it is logged (non-production use).
    pub fn with_console(mut self, console: bool) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("configure before sharing");
        inner.console = console;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_capacity(mut self, capacity: usize) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("configure before sharing");
        inner.capacity = capacity;
        self
    }

    /// Append one entry: enrich, sanitize, buffer, flush when full.
    pub async fn log(
        &self,
        event_type: AuditEventType,
        category: AuditCategory,
        details: Value,
        metadata: AuditMetadata,
    ) {
        let event = AuditEvent {
            id: nanoid::nanoid!(16),
            timestamp: Utc::now(),
            session_id: self.inner.session_id.clone(),
            event_type,
            category,
            details: sanitize_value(&details),
            metadata,
        };

        if self.inner.console {
            tracing::debug!(
                target: "courier::audit",
                event_type = ?event.event_type,
                details = %event.details,
                "audit entry"
            );
        }

        let should_flush = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push_back(event);
            buffer.len() >= self.inner.capacity
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Drain the buffer to the sink and mirror the batch to the backup.
    ///
    /// A sink failure returns the batch to the front of the buffer intact, so
    /// a later flush redelivers it (at-least-once).
    pub async fn flush(&self) {
        let batch: Vec<AuditEvent> = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        if let Err(err) = self.inner.sink.send(&batch).await {
            tracing::warn!(error = %err, entries = batch.len(), "audit flush failed, requeueing");
            let mut buffer = self.inner.buffer.lock().await;
            for event in batch.into_iter().rev() {
                buffer.push_front(event);
            }
            return;
        }

        self.mirror_to_backup(batch).await;
    }

    async fn mirror_to_backup(&self, batch: Vec<AuditEvent>) {
        let backup = self.inner.backup.as_ref();
        let mut records: Vec<AuditEvent> = match load_records(backup).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(error = %err, "audit backup unreadable, starting fresh");
                Vec::new()
            }
        };
        records.extend(batch);
        if records.len() > self.inner.backup_capacity {
            let excess = records.len() - self.inner.backup_capacity;
            records.drain(..excess);
        }
        if let Err(err) = save_records(backup, &records).await {
            tracing::warn!(error = %err, "failed to write audit backup");
        }
    }

    /// Spawn the periodic flush task. The handle can be aborted on shutdown.
    pub fn spawn_flush_loop(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let logger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                logger.flush().await;
            }
        })
    }

    /// Filtered view over the durable backup.
    pub async fn export_logs(&self, filter: &ExportFilter) -> Vec<AuditEvent> {
        let records: Vec<AuditEvent> = load_records(self.inner.backup.as_ref())
            .await
            .unwrap_or_default();
        records
            .into_iter()
            .filter(|event| filter.matches(event))
            .collect()
    }

    /// Rolling health summary over the last 24 hours of backed-up entries.
    pub async fn stats(&self) -> AuditStats {
        let records: Vec<AuditEvent> = load_records(self.inner.backup.as_ref())
            .await
            .unwrap_or_default();
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let recent: Vec<&AuditEvent> = records.iter().filter(|e| e.timestamp >= cutoff).collect();

        let recent_errors = recent
            .iter()
            .filter(|e| {
                matches!(
                    e.event_type,
                    AuditEventType::SystemError | AuditEventType::ValidationError
                ) || e.metadata.success == Some(false)
            })
            .count();

        let durations: Vec<u64> = recent.iter().filter_map(|e| e.metadata.duration_ms).collect();
        let avg_duration_ms = if durations.is_empty() {
            0
        } else {
            durations.iter().sum::<u64>() / durations.len() as u64
        };

        let health_score = if recent.is_empty() {
            100
        } else {
            let ok = recent
                .iter()
                .filter(|e| e.metadata.success != Some(false))
                .count();
            ((ok * 100) / recent.len()) as u8
        };

        AuditStats {
            total_logs: records.len(),
            recent_errors,
            avg_duration_ms,
            health_score,
        }
    }

    // Typed entry points for each operation the pipeline records.

    pub async fn webhook_call(
        &self,
        endpoint_url: &str,
        status_code: Option<u16>,
        success: bool,
        duration_ms: u64,
        retry_attempt: Option<u32>,
        error: Option<&str>,
    ) {
        let endpoint = sanitize_url(endpoint_url);
        self.log(
            AuditEventType::WebhookCall,
            AuditCategory::WebhookManagement,
            json!({
                "endpoint": endpoint,
                "method": "POST",
                "statusCode": status_code,
                "errorMessage": error,
            }),
            AuditMetadata {
                endpoint: Some(endpoint.clone()),
                duration_ms: Some(duration_ms),
                success: Some(success),
                retry_attempt,
            },
        )
        .await;
    }

    pub async fn health_check(&self, endpoint_url: &str, healthy: bool, duration_ms: u64) {
        let endpoint = sanitize_url(endpoint_url);
        self.log(
            AuditEventType::HealthCheck,
            AuditCategory::SystemMonitoring,
            json!({ "endpoint": endpoint }),
            AuditMetadata {
                endpoint: Some(endpoint.clone()),
                duration_ms: Some(duration_ms),
                success: Some(healthy),
                retry_attempt: None,
            },
        )
        .await;
    }

    pub async fn retry_attempt(
        &self,
        operation: &str,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        reason: &str,
    ) {
        self.log(
            AuditEventType::RetryAttempt,
            AuditCategory::ErrorHandling,
            json!({
                "operation": operation,
                "attempt": attempt,
                "maxAttempts": max_attempts,
                "delayMs": delay.as_millis() as u64,
                "reason": reason,
            }),
            AuditMetadata {
                retry_attempt: Some(attempt),
                ..Default::default()
            },
        )
        .await;
    }

    pub async fn fallback_triggered(&self, from_url: &str, to_url: &str, reason: &str) {
        self.log(
            AuditEventType::FallbackTriggered,
            AuditCategory::ErrorHandling,
            json!({
                "primaryEndpoint": sanitize_url(from_url),
                "fallbackEndpoint": sanitize_url(to_url),
                "reason": reason,
            }),
            AuditMetadata::default(),
        )
        .await;
    }

    pub async fn queue_operation(
        &self,
        operation: &str,
        queue_size: usize,
        item_id: Option<&str>,
        success: bool,
        error: Option<&str>,
    ) {
        self.log(
            AuditEventType::QueueOperation,
            AuditCategory::SystemMonitoring,
            json!({
                "operation": operation,
                "queueSize": queue_size,
                "itemId": item_id,
                "errorMessage": error,
            }),
            AuditMetadata {
                success: Some(success),
                ..Default::default()
            },
        )
        .await;
    }

    pub async fn validation_error(&self, context: &str, field: &str, message: &str) {
        self.log(
            AuditEventType::ValidationError,
            AuditCategory::DataValidation,
            json!({
                "context": context,
                "field": field,
                "message": message,
            }),
            AuditMetadata::default(),
        )
        .await;
    }

    pub async fn system_error(&self, context: &str, message: &str, severity: &str) {
        self.log(
            AuditEventType::SystemError,
            AuditCategory::ErrorHandling,
            json!({
                "context": context,
                "errorMessage": message,
                "severity": severity,
            }),
            AuditMetadata::default(),
        )
        .await;
    }

    pub async fn notification_sent(
        &self,
        kind: &str,
        recipient: &str,
        service: &str,
        success: bool,
        error: Option<&str>,
    ) {
        self.log(
            AuditEventType::NotificationSent,
            AuditCategory::ThirdPartyIntegration,
            json!({
                "type": kind,
                "recipient": recipient,
                "service": service,
                "errorMessage": error,
            }),
            AuditMetadata {
                success: Some(success),
                ..Default::default()
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use courier_store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<AuditEvent>>>,
        fail: AtomicBool,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        async fn send(&self, events: &[AuditEvent]) -> Result<(), SinkError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError("sink offline".into()));
            }
            self.batches.lock().await.push(events.to_vec());
            Ok(())
        }
    }

    fn logger_with(sink: Arc<RecordingSink>, backup: Arc<MemoryStore>) -> AuditLogger {
        AuditLogger::new(sink, backup)
    }

    #[tokio::test]
    async fn test_flush_delivers_buffered_entries() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink.clone(), backup);

        logger.system_error("delivery", "boom", "high").await;
        logger.flush().await;

        let batches = sink.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_full_triggers_flush() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink.clone(), backup).with_capacity(3);

        for i in 0..3 {
            logger.system_error("ctx", &format!("err {}", i), "low").await;
        }

        assert_eq!(sink.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink.clone(), backup);

        sink.fail.store(true, Ordering::SeqCst);
        logger.system_error("ctx", "first", "low").await;
        logger.system_error("ctx", "second", "low").await;
        logger.flush().await;

        sink.fail.store(false, Ordering::SeqCst);
        logger.flush().await;

        let batches = sink.batches.lock().await;
        assert_eq!(batches.len(), 1, "redelivered as a single batch");
        assert_eq!(batches[0][0].details["errorMessage"], "first");
        assert_eq!(batches[0][1].details["errorMessage"], "second");
    }

    #[tokio::test]
    async fn test_backup_never_contains_raw_email() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink, backup.clone());

        logger
            .notification_sent("welcome", "user@example.com", "mailer", true, None)
            .await;
        logger.flush().await;

        let raw = backup.load().await.unwrap().unwrap().to_string();
        assert!(!raw.contains("user@example.com"));
        assert!(raw.contains("****@example.com"));
    }

    #[tokio::test]
    async fn test_backup_capped_at_500() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink, backup.clone());

        for i in 0..520 {
            logger.system_error("ctx", &format!("err {}", i), "low").await;
        }
        logger.flush().await;

        let records: Vec<AuditEvent> = load_records(backup.as_ref()).await.unwrap();
        assert_eq!(records.len(), 500);
        // oldest entries were evicted
        assert_eq!(records[0].details["errorMessage"], "err 20");
    }

    #[tokio::test]
    async fn test_export_filters_by_category() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink, backup);

        logger.system_error("ctx", "boom", "low").await;
        logger.health_check("https://hooks.example.com/a", true, 12).await;
        logger.flush().await;

        let exported = logger
            .export_logs(&ExportFilter {
                categories: vec![AuditCategory::SystemMonitoring],
                ..Default::default()
            })
            .await;

        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].event_type, AuditEventType::HealthCheck);
    }

    #[tokio::test]
    async fn test_stats_counts_errors_and_score() {
        let sink = Arc::new(RecordingSink::default());
        let backup = Arc::new(MemoryStore::new());
        let logger = logger_with(sink, backup);

        logger
            .webhook_call("https://hooks.example.com/a", Some(200), true, 40, None, None)
            .await;
        logger
            .webhook_call(
                "https://hooks.example.com/a",
                Some(500),
                false,
                60,
                Some(2),
                Some("server error"),
            )
            .await;
        logger.flush().await;

        let stats = logger.stats().await;
        assert_eq!(stats.total_logs, 2);
        assert_eq!(stats.recent_errors, 1);
        assert_eq!(stats.avg_duration_ms, 50);
        assert_eq!(stats.health_score, 50);
    }
}
