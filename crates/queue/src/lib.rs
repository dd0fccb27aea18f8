//! Named, priority, rate-limited job queues for bulk work that does not go
//! through the single-shot webhook path.
//!
//! A manager owns any number of lazily created queues sharing one token
//! bucket. Execution is delegated to an injected [`JobProcessor`]; lifecycle
//! transitions are published on a broadcast channel.

mod manager;
mod rate_limit;

pub use manager::{
    BulkOp, BulkOptions, BulkTag, Job, JobOptions, JobProcessor, QueueConfig, QueueEvent,
    QueueManager, QueueMetrics, QueueStatus,
};
pub use rate_limit::{RateLimiterStats, TokenBucket};
