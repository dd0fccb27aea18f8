use crate::event::AuditEvent;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("audit sink rejected batch: {0}")]
pub struct SinkError(pub String);

/// Remote destination for flushed audit batches.
///
/// Delivery is at-least-once; implementations must treat entry ids as the
/// deduplication key.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn send(&self, events: &[AuditEvent]) -> Result<(), SinkError>;
}

/// Sink that emits each entry as a structured `tracing` event. Suitable when
/// log shipping is handled by the subscriber (json logs collected off
/// stdout).
#[derive(Default)]
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn send(&self, events: &[AuditEvent]) -> Result<(), SinkError> {
        for event in events {
            tracing::info!(
                target: "courier::audit",
                id = %event.id,
                event_type = ?event.event_type,
                category = ?event.category,
                details = %event.details,
                "audit"
            );
        }
        Ok(())
    }
}
