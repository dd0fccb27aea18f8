//! Outbound webhook delivery: endpoint registry with health tracking, a
//! retrying HTTP client with cross-endpoint fallback, and a durable retry
//! queue for submissions that could not be delivered synchronously.
//!
//! Failure semantics: transient errors (5xx, 429, timeouts, network) are
//! absorbed by the per-endpoint retry loop; non-retryable client errors fall
//! through to the next endpoint; total exhaustion parks the submission in
//! the retry queue. A submission is never silently dropped — it is either
//! delivered or durably queued.

mod client;
mod endpoints;
mod retry_queue;

pub use client::{DeliveryReceipt, RetryOptions, WebhookClient};
pub use endpoints::{EndpointHealth, EndpointRegistry, HealthSummary};
pub use retry_queue::{DeadLetterPolicy, ReplayOutcome, RetryQueue, REPLAY_INTERVAL};
