//! Typed business-event routing.
//!
//! An [`EventRouter`] validates an incoming event against its required
//! fields, resolves target audiences and priority from static tables (both
//! overridable per call), and fans out to audience handlers concurrently.
//! One audience's failure never blocks another; callers inspect the report
//! to tell partial from total failure.

mod events;
mod forward;
mod router;

pub use events::{Audience, EventType};
pub use forward::ForwardingHandler;
pub use router::{
    AudienceHandler, AudienceResult, AudienceStatus, BatchOptions, BatchReport, DispatchMetrics,
    DispatchOptions, DispatchReport, EventEnvelope, EventRouter, WebhookAck,
};
