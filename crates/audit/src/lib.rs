//! Structured audit trail for pipeline operations.
//!
//! Entries are buffered in memory, flushed to a sink on a timer or when the
//! buffer fills, and mirrored to a capped durable backup. Flushing is
//! at-least-once: a failed sink send returns the batch to the front of the
//! buffer, so sinks must tolerate duplicates (dedupe by entry id).

mod event;
mod logger;
mod sanitize;
mod sink;

pub use event::{AuditCategory, AuditEvent, AuditEventType, AuditMetadata, ExportFilter};
pub use logger::{AuditLogger, AuditStats, FLUSH_INTERVAL};
pub use sanitize::{mask_email, sanitize_url, sanitize_value};
pub use sink::{AuditSink, SinkError, TracingSink};
