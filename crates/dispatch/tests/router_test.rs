use async_trait::async_trait;
use courier_audit::{AuditLogger, TracingSink};
use courier_core::error::DispatchError;
use courier_core::signing::sign_payload;
use courier_core::types::EventPriority;
use courier_dispatch::{
    Audience, AudienceHandler, AudienceStatus, BatchOptions, DispatchOptions, EventEnvelope,
    EventRouter, EventType,
};
use courier_store::MemoryStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct StubHandler {
    audience: Audience,
    calls: AtomicUsize,
    fail: bool,
}

impl StubHandler {
    fn new(audience: Audience) -> Arc<Self> {
        Arc::new(Self { audience, calls: AtomicUsize::new(0), fail: false })
    }

    fn failing(audience: Audience) -> Arc<Self> {
        Arc::new(Self { audience, calls: AtomicUsize::new(0), fail: true })
    }
}

#[async_trait]
impl AudienceHandler for StubHandler {
    fn audience(&self) -> Audience {
        self.audience
    }

    async fn handle(&self, event: EventType, _data: &Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("downstream unavailable");
        }
        Ok(json!({"handled": event.as_str()}))
    }
}

fn audit() -> AuditLogger {
    AuditLogger::new(Arc::new(TracingSink), Arc::new(MemoryStore::new()))
}

fn router_with(handlers: Vec<Arc<StubHandler>>) -> EventRouter {
    let mut router = EventRouter::new(audit());
    for handler in handlers {
        router = router.with_handler(handler);
    }
    router
}

// study.milestone.reached reaches investor and investigator,
// not physician, at medium priority.
#[tokio::test]
async fn test_milestone_routes_by_table() {
    let physician = StubHandler::new(Audience::Physician);
    let investor = StubHandler::new(Audience::Investor);
    let investigator = StubHandler::new(Audience::Investigator);
    let router = router_with(vec![physician.clone(), investor.clone(), investigator.clone()]);

    let report = router
        .dispatch_event(
            EventType::StudyMilestoneReached,
            &json!({"studyId": "st_1", "milestoneId": "m_1", "title": "Phase II complete"}),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.priority, EventPriority::Medium);
    assert_eq!(report.target_audiences, vec![Audience::Investor, Audience::Investigator]);
    assert_eq!(report.fulfilled(), 2);
    assert_eq!(physician.calls.load(Ordering::SeqCst), 0);
    assert_eq!(investor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(investigator.calls.load(Ordering::SeqCst), 1);
}

// A missing required field fails validation before any handler runs.
#[tokio::test]
async fn test_missing_field_fails_before_handlers() {
    let investigator = StubHandler::new(Audience::Investigator);
    let router = router_with(vec![investigator.clone()]);

    let err = router
        .dispatch_event(
            EventType::SafetyAlert,
            &json!({"studyId": "st_1", "severity": "high"}),
            DispatchOptions::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        DispatchError::MissingField {
            event_type: "safety.alert".into(),
            field: "description".into(),
        }
    );
    assert_eq!(investigator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_non_object_data_rejected() {
    let router = router_with(vec![StubHandler::new(Audience::Investor)]);

    let err = router
        .dispatch_event(EventType::RiskAlert, &json!("not an object"), DispatchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err, DispatchError::InvalidEventData);
}

// One failing audience does not block the other; both outcomes appear
// in the report.
#[tokio::test]
async fn test_partial_failure_is_isolated() {
    let physician = StubHandler::failing(Audience::Physician);
    let investigator = StubHandler::new(Audience::Investigator);
    let router = router_with(vec![physician, investigator.clone()]);

    let report = router
        .dispatch_event(
            EventType::SafetyAlert,
            &json!({"studyId": "st_1", "severity": "high", "description": "SAE observed"}),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.fulfilled(), 1);
    assert_eq!(report.rejected(), 1);
    assert!(report.any_succeeded());
    assert_eq!(investigator.calls.load(Ordering::SeqCst), 1);

    let rejected = report
        .results
        .iter()
        .find(|r| r.status == AudienceStatus::Rejected)
        .unwrap();
    assert_eq!(rejected.audience, Audience::Physician);
}

// Explicit audience and priority overrides win over the tables.
#[tokio::test]
async fn test_overrides_beat_routing_table() {
    let physician = StubHandler::new(Audience::Physician);
    let investor = StubHandler::new(Audience::Investor);
    let router = router_with(vec![physician.clone(), investor.clone()]);

    let report = router
        .dispatch_event(
            EventType::FinancialReport,
            &json!({"quarter": "Q2"}),
            DispatchOptions {
                audiences: Some(vec![Audience::Physician]),
                priority: Some(EventPriority::High),
            },
        )
        .await
        .unwrap();

    assert_eq!(report.priority, EventPriority::High);
    assert_eq!(report.target_audiences, vec![Audience::Physician]);
    assert_eq!(physician.calls.load(Ordering::SeqCst), 1);
    assert_eq!(investor.calls.load(Ordering::SeqCst), 0);
}

// Ingress with a configured secret rejects bad or absent signatures
// before anything is dispatched.
#[tokio::test]
async fn test_ingress_signature_fails_closed() {
    let investor = StubHandler::new(Audience::Investor);
    let router = Arc::new(
        router_with(vec![investor.clone()]).with_ingress_secret("shared-secret"),
    );
    let payload = json!({"roundType": "Series A", "amountRaised": 5_000_000});

    let err = router
        .process_webhook(EventType::FundingRoundCompleted, payload.clone(), None)
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::MissingSignature);

    let err = router
        .process_webhook(EventType::FundingRoundCompleted, payload.clone(), Some("deadbeef"))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::InvalidSignature);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(investor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ingress_accepts_valid_signature() {
    let investor = StubHandler::new(Audience::Investor);
    let router = Arc::new(
        router_with(vec![investor.clone()]).with_ingress_secret("shared-secret"),
    );
    let payload = json!({"roundType": "Series A", "amountRaised": 5_000_000});
    let signature = sign_payload("shared-secret", &payload);

    let ack = router
        .process_webhook(EventType::FundingRoundCompleted, payload, Some(&signature))
        .await
        .unwrap();
    assert!(ack.success);
    assert_eq!(ack.event_type, EventType::FundingRoundCompleted);

    // dispatch runs in the background
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(investor.calls.load(Ordering::SeqCst), 1);
}

// Without a secret, unsigned ingress is accepted.
#[tokio::test]
async fn test_ingress_without_secret_skips_verification() {
    let physician = StubHandler::new(Audience::Physician);
    let router = Arc::new(router_with(vec![physician.clone()]));

    let ack = router
        .process_webhook(
            EventType::EmailOpened,
            json!({"email": "dr@example.org"}),
            None,
        )
        .await
        .unwrap();
    assert!(ack.success);
}

#[tokio::test]
async fn test_batch_dispatch_counts_outcomes() {
    let investor = StubHandler::new(Audience::Investor);
    let router = router_with(vec![investor.clone()]);

    let good = EventEnvelope {
        event: EventType::FinancialReport,
        data: json!({"quarter": "Q2"}),
        options: DispatchOptions::default(),
    };
    let invalid = EventEnvelope {
        event: EventType::FundingRoundCompleted,
        data: json!({"roundType": "Seed"}),
        options: DispatchOptions::default(),
    };

    let report = router
        .batch_dispatch(
            vec![good.clone(), invalid, good],
            BatchOptions { batch_size: 2, batch_delay: Duration::from_millis(10) },
        )
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(report.fulfilled, 2);
    assert_eq!(report.rejected, 1);
}

#[tokio::test]
async fn test_metrics_track_dispatches() {
    let investor = StubHandler::new(Audience::Investor);
    let investigator = StubHandler::failing(Audience::Investigator);
    let router = router_with(vec![investor, investigator]);

    router
        .dispatch_event(
            EventType::StudyMilestoneReached,
            &json!({"studyId": "st_1", "milestoneId": "m_1", "title": "t"}),
            DispatchOptions::default(),
        )
        .await
        .unwrap();

    let metrics = router.metrics().await;
    assert_eq!(metrics.events_processed, 1);
    assert_eq!(metrics.notifications_sent, 1);
    assert_eq!(metrics.errors, 1);
    assert_eq!(metrics.events_by_type.get("study.milestone.reached"), Some(&1));
    assert_eq!(metrics.sent_by_audience.get("investor"), Some(&1));
    assert_eq!(metrics.sent_by_audience.get("investigator"), None);
}
