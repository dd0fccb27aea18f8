//! End-to-end wiring: config from the environment, file-backed stores,
//! audit logging, the delivery client with its replay loop, and an event
//! router forwarding every audience through the webhook pipeline.
//!
//! Set COURIER_WEBHOOK_URL (and optionally COURIER_WEBHOOK_URL_BACKUP)
//! before running.

use anyhow::Result;
use courier_audit::{AuditLogger, TracingSink};
use courier_core::config::Settings;
use courier_delivery::{EndpointRegistry, RetryQueue, WebhookClient, REPLAY_INTERVAL};
use courier_dispatch::{Audience, DispatchOptions, EventRouter, EventType, ForwardingHandler};
use courier_store::FileStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env();

    let audit_store = Arc::new(FileStore::new(&settings.audit_store_path));
    let audit = AuditLogger::new(Arc::new(TracingSink), audit_store)
        .with_console(!settings.is_production());
    let _flush_task = audit.spawn_flush_loop(Duration::from_secs(settings.audit_flush_secs));

    let registry = Arc::new(EndpointRegistry::new(settings.endpoints()));
    let retry_store = Arc::new(FileStore::new(&settings.retry_store_path));
    let mut queue = RetryQueue::new(retry_store, audit.clone());
    if settings.keep_dead_letters {
        queue = queue.with_dead_letter_store(Arc::new(FileStore::new("courier_dead_letters.json")));
    }
    let queue = Arc::new(queue);

    let client = Arc::new(WebhookClient::new(registry.clone(), queue.clone(), audit.clone()));
    let _replay_task = queue.spawn_replay_loop(client.clone());
    info!(replay_interval_secs = REPLAY_INTERVAL.as_secs(), "delivery pipeline up");

    let mut router = EventRouter::new(audit.clone());
    for audience in Audience::ALL {
        router = router.with_handler(Arc::new(ForwardingHandler::new(audience, client.clone())));
    }
    if let Some(secret) = &settings.ingress_secret {
        router = router.with_ingress_secret(secret);
    }
    let router = Arc::new(router);

    let report = router
        .dispatch_event(
            EventType::StudyMilestoneReached,
            &json!({
                "studyId": "st_demo",
                "milestoneId": "m_1",
                "title": "First patient enrolled",
            }),
            DispatchOptions::default(),
        )
        .await?;
    info!(
        fulfilled = report.fulfilled(),
        rejected = report.rejected(),
        "demo event dispatched"
    );

    let health = client.health_check().await;
    info!(?health, "endpoint probe complete");
    info!(metrics = ?router.metrics().await, "dispatcher metrics");

    audit.flush().await;
    Ok(())
}
