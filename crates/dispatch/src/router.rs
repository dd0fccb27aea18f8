use crate::events::{Audience, EventType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_audit::AuditLogger;
use courier_core::error::DispatchError;
use courier_core::signing::verify_signature;
use courier_core::types::EventPriority;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Audience-specific downstream automation. One handler per audience;
/// the event-type dispatch within an audience lives behind this seam.
#[async_trait]
pub trait AudienceHandler: Send + Sync + 'static {
    fn audience(&self) -> Audience;
    async fn handle(&self, event: EventType, data: &Value) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Override the routing table for this call.
    pub audiences: Option<Vec<Audience>>,
    pub priority: Option<EventPriority>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudienceStatus {
    Fulfilled,
    Rejected,
}

/// Per-audience outcome; `detail` is the handler's value or error message.
#[derive(Debug, Clone, Serialize)]
pub struct AudienceResult {
    pub audience: Audience,
    pub status: AudienceStatus,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub event_type: EventType,
    pub priority: EventPriority,
    pub target_audiences: Vec<Audience>,
    pub results: Vec<AudienceResult>,
}

impl DispatchReport {
    pub fn fulfilled(&self) -> usize {
        self.results.iter().filter(|r| r.status == AudienceStatus::Fulfilled).count()
    }

    pub fn rejected(&self) -> usize {
        self.results.len() - self.fulfilled()
    }

    /// False only when every audience failed.
    pub fn any_succeeded(&self) -> bool {
        self.fulfilled() > 0
    }
}

/// One event in a batch.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: EventType,
    pub data: Value,
    pub options: DispatchOptions,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub fulfilled: usize,
    pub rejected: usize,
}

/// Acknowledgement returned to a webhook caller once the event is accepted.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub success: bool,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub events_processed: u64,
    pub notifications_sent: u64,
    pub errors: u64,
    pub avg_processing_ms: f64,
    pub events_by_type: HashMap<String, u64>,
    pub sent_by_audience: HashMap<String, u64>,
}

#[derive(Default)]
struct MetricsState {
    events_processed: u64,
    notifications_sent: u64,
    errors: u64,
    avg_processing_ms: f64,
    events_by_type: HashMap<String, u64>,
    sent_by_audience: HashMap<String, u64>,
}

/// Validates a typed business event and fans it out to the registered
/// audience handlers with all-settled semantics.
///
/// Validation failures are synchronous errors; per-audience handler
/// failures are isolated in the report and never abort the other
/// audiences.
pub struct EventRouter {
    handlers: HashMap<Audience, Arc<dyn AudienceHandler>>,
    audit: AuditLogger,
    ingress_secret: Option<String>,
    metrics: tokio::sync::Mutex<MetricsState>,
}

impl EventRouter {
    pub fn new(audit: AuditLogger) -> Self {
        Self {
            handlers: HashMap::new(),
            audit,
            ingress_secret: None,
            metrics: tokio::sync::Mutex::new(MetricsState::default()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn AudienceHandler>) -> Self {
        self.handlers.insert(handler.audience(), handler);
        self
    }

    /// Require an HMAC signature on `process_webhook` calls.
    pub fn with_ingress_secret(mut self, secret: impl Into<String>) -> Self {
        self.ingress_secret = Some(secret.into());
        self
    }

    /// Validate, resolve audiences and priority, then fan out.
    pub async fn dispatch_event(
        &self,
        event: EventType,
        data: &Value,
        options: DispatchOptions,
    ) -> Result<DispatchReport, DispatchError> {
        let started = Instant::now();

        if let Err(err) = validate(event, data) {
            self.audit
                .validation_error("dispatch", event.as_str(), &err.to_string())
                .await;
            self.metrics.lock().await.errors += 1;
            return Err(err);
        }

        let audiences = options
            .audiences
            .unwrap_or_else(|| event.routes().to_vec());
        let priority = options.priority.unwrap_or_else(|| event.priority());

        let calls = audiences.iter().map(|&audience| async move {
            let result = match self.handlers.get(&audience) {
                Some(handler) => handler.handle(event, data).await,
                None => Err(anyhow::anyhow!("no handler registered for {audience}")),
            };
            (audience, result)
        });

        let mut results = Vec::with_capacity(audiences.len());
        for (audience, result) in join_all(calls).await {
            let result = match result {
                Ok(detail) => {
                    self.audit
                        .notification_sent(event.as_str(), audience.as_str(), "dispatch", true, None)
                        .await;
                    AudienceResult {
                        audience,
                        status: AudienceStatus::Fulfilled,
                        detail,
                    }
                }
                Err(err) => {
                    warn!(event = %event, %audience, error = %err, "audience handler failed");
                    self.audit
                        .notification_sent(
                            event.as_str(),
                            audience.as_str(),
                            "dispatch",
                            false,
                            Some(&err.to_string()),
                        )
                        .await;
                    AudienceResult {
                        audience,
                        status: AudienceStatus::Rejected,
                        detail: Value::String(err.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let report = DispatchReport {
            event_type: event,
            priority,
            target_audiences: audiences,
            results,
        };
        self.record(&report, started.elapsed()).await;
        Ok(report)
    }

    /// Process events in fixed-size batches with a pause in between, so a
    /// burst does not overwhelm downstream automation.
    pub async fn batch_dispatch(
        &self,
        events: Vec<EventEnvelope>,
        options: BatchOptions,
    ) -> BatchReport {
        let total = events.len();
        let batch_size = options.batch_size.max(1);
        let mut fulfilled = 0;
        let mut rejected = 0;

        let batches = events.len().div_ceil(batch_size);
        for (index, batch) in events.chunks(batch_size).enumerate() {
            let calls = batch.iter().map(|envelope| {
                self.dispatch_event(envelope.event, &envelope.data, envelope.options.clone())
            });
            for result in join_all(calls).await {
                match result {
                    Ok(report) if report.any_succeeded() => fulfilled += 1,
                    _ => rejected += 1,
                }
            }

            if index + 1 < batches {
                tokio::time::sleep(options.batch_delay).await;
            }
        }

        info!(total, fulfilled, rejected, "batch dispatch complete");
        BatchReport { total, fulfilled, rejected }
    }

    /// Webhook ingress: verify the HMAC signature (fail closed when a
    /// secret is configured), then dispatch in the background and
    /// acknowledge immediately.
    pub async fn process_webhook(
        self: &Arc<Self>,
        event: EventType,
        payload: Value,
        signature: Option<&str>,
    ) -> Result<WebhookAck, DispatchError> {
        if let Some(secret) = &self.ingress_secret {
            let Some(signature) = signature else {
                self.audit
                    .validation_error("webhook_ingress", event.as_str(), "missing signature")
                    .await;
                return Err(DispatchError::MissingSignature);
            };
            if !verify_signature(secret, &payload, signature) {
                self.audit
                    .validation_error("webhook_ingress", event.as_str(), "invalid signature")
                    .await;
                return Err(DispatchError::InvalidSignature);
            }
        }

        let router = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = router
                .dispatch_event(event, &payload, DispatchOptions::default())
                .await
            {
                warn!(event = %event, error = %err, "webhook-ingested event failed dispatch");
            }
        });

        Ok(WebhookAck {
            success: true,
            event_type: event,
            timestamp: Utc::now(),
        })
    }

    pub async fn metrics(&self) -> DispatchMetrics {
        let metrics = self.metrics.lock().await;
        DispatchMetrics {
            events_processed: metrics.events_processed,
            notifications_sent: metrics.notifications_sent,
            errors: metrics.errors,
            avg_processing_ms: metrics.avg_processing_ms,
            events_by_type: metrics.events_by_type.clone(),
            sent_by_audience: metrics.sent_by_audience.clone(),
        }
    }

    async fn record(&self, report: &DispatchReport, elapsed: Duration) {
        let mut metrics = self.metrics.lock().await;
        metrics.events_processed += 1;
        metrics.notifications_sent += report.fulfilled() as u64;
        metrics.errors += report.rejected() as u64;

        let n = metrics.events_processed as f64;
        let ms = elapsed.as_millis() as f64;
        metrics.avg_processing_ms += (ms - metrics.avg_processing_ms) / n;

        *metrics
            .events_by_type
            .entry(report.event_type.as_str().to_string())
            .or_insert(0) += 1;
        for result in &report.results {
            if result.status == AudienceStatus::Fulfilled {
                *metrics
                    .sent_by_audience
                    .entry(result.audience.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
    }
}

fn validate(event: EventType, data: &Value) -> Result<(), DispatchError> {
    let Some(object) = data.as_object() else {
        return Err(DispatchError::InvalidEventData);
    };
    for field in event.required_fields() {
        if !object.contains_key(*field) {
            return Err(DispatchError::MissingField {
                event_type: event.as_str().to_string(),
                field: field.to_string(),
            });
        }
    }
    Ok(())
}
