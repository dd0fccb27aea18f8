use crate::client::WebhookClient;
use chrono::{Duration as ChronoDuration, Utc};
use courier_audit::AuditLogger;
use courier_core::backoff::BackoffPolicy;
use courier_core::types::{DeadLetterEntry, DeadLetterSource, RetryQueueItem, Submission};
use courier_store::{load_records, save_records, DurableStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const MAX_REPLAY_RETRIES: u32 = 5;
const INITIAL_RETRY_DELAY_SECS: i64 = 60;
pub const REPLAY_INTERVAL: Duration = Duration::from_secs(60);

fn initial_retry_delay() -> ChronoDuration {
    ChronoDuration::seconds(INITIAL_RETRY_DELAY_SECS)
}

/// What to do with an item that exhausts its replay budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterPolicy {
    /// Drop with an audit entry only.
    Drop,
    /// Also persist a dead-letter record for operator review.
    Keep,
}

/// Counters from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub remaining: usize,
}

/// Durable FIFO of submissions that failed every endpoint, replayed on a
/// timer with capped exponential backoff.
///
/// The backing store is read and written wholesale on every pass, so the
/// queue survives process restarts without a separate recovery step. Every
/// load-modify-save on the store runs under `store_lock`; a replay pass
/// releases it while endpoints are in flight and merges concurrent enqueues
/// back in before its final save, so an enqueue can never be clobbered by a
/// stale snapshot.
pub struct RetryQueue {
    store: Arc<dyn DurableStore>,
    dead_letters: Option<Arc<dyn DurableStore>>,
    audit: AuditLogger,
    backoff: BackoffPolicy,
    store_lock: Mutex<()>,
    // one replay pass at a time; enqueue only appends, so a pass can merge
    // by snapshot length
    replay_lock: Mutex<()>,
    dlq_lock: Mutex<()>,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn DurableStore>, audit: AuditLogger) -> Self {
        Self {
            store,
            dead_letters: None,
            audit,
            backoff: BackoffPolicy::replay(),
            store_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
            dlq_lock: Mutex::new(()),
        }
    }

    /// Enable `DeadLetterPolicy::Keep` backed by the given store.
    pub fn with_dead_letter_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn policy(&self) -> DeadLetterPolicy {
        if self.dead_letters.is_some() {
            DeadLetterPolicy::Keep
        } else {
            DeadLetterPolicy::Drop
        }
    }

    /// Park a submission; first replay is due no sooner than one minute out.
    /// Returns the queue length after the append.
    pub async fn enqueue(&self, data: Submission) -> Result<usize, StoreError> {
        let _guard = self.store_lock.lock().await;
        let mut items: Vec<RetryQueueItem> = load_records(self.store.as_ref()).await?;
        let now = Utc::now();
        items.push(RetryQueueItem {
            data,
            enqueued_at: now,
            retry_count: 0,
            next_retry_at: now + initial_retry_delay(),
        });
        save_records(self.store.as_ref(), &items).await?;

        self.audit
            .queue_operation("enqueue", items.len(), None, true, None)
            .await;
        Ok(items.len())
    }

    pub async fn len(&self) -> usize {
        load_records::<RetryQueueItem>(self.store.as_ref())
            .await
            .map(|items| items.len())
            .unwrap_or(0)
    }

    /// Replay every due item once through the client's endpoint walk.
    ///
    /// Success removes the item; failure bumps its retry count and pushes
    /// `next_retry_at` out by `2^retry_count` minutes; the fifth failure is
    /// terminal and handled per the dead-letter policy.
    pub async fn process(&self, client: &WebhookClient) -> Result<ReplayOutcome, StoreError> {
        let _pass = self.replay_lock.lock().await;

        let snapshot: Vec<RetryQueueItem> = {
            let _guard = self.store_lock.lock().await;
            load_records(self.store.as_ref()).await?
        };
        if snapshot.is_empty() {
            return Ok(ReplayOutcome::default());
        }
        let snapshot_len = snapshot.len();

        let now = Utc::now();
        let mut outcome = ReplayOutcome::default();
        let mut remaining: Vec<RetryQueueItem> = Vec::with_capacity(snapshot_len);

        for mut item in snapshot {
            if item.retry_count >= MAX_REPLAY_RETRIES {
                // already terminal; shed it
                self.dead_letter(item, "replay budget exhausted").await;
                outcome.dead_lettered += 1;
                continue;
            }
            if now < item.next_retry_at {
                remaining.push(item);
                continue;
            }

            outcome.attempted += 1;
            let mut submission = item.data.clone();
            match client
                .try_endpoints(&mut submission, client.retry_options())
                .await
            {
                Ok(_) => {
                    outcome.delivered += 1;
                    info!("queued submission delivered on replay");
                    self.audit
                        .queue_operation("process", remaining.len(), None, true, None)
                        .await;
                }
                Err(err) => {
                    item.retry_count += 1;
                    if item.retry_count >= MAX_REPLAY_RETRIES {
                        self.dead_letter(item, &err.to_string()).await;
                        outcome.dead_lettered += 1;
                    } else {
                        item.next_retry_at =
                            now + ChronoDuration::from_std(self.backoff.delay(item.retry_count + 1))
                                .unwrap_or_else(|_| initial_retry_delay());
                        remaining.push(item);
                        outcome.requeued += 1;
                    }
                }
            }
        }

        // items enqueued while endpoints were in flight sit past the
        // snapshot; keep them
        let _guard = self.store_lock.lock().await;
        let current: Vec<RetryQueueItem> = load_records(self.store.as_ref()).await?;
        remaining.extend(current.into_iter().skip(snapshot_len));

        outcome.remaining = remaining.len();
        save_records(self.store.as_ref(), &remaining).await?;
        Ok(outcome)
    }

    async fn dead_letter(&self, item: RetryQueueItem, reason: &str) {
        warn!(retry_count = item.retry_count, reason, "retry queue item exhausted");
        self.audit
            .queue_operation("dequeue", 0, None, false, Some(reason))
            .await;

        let Some(store) = &self.dead_letters else {
            return;
        };
        let payload = match serde_json::to_value(&item.data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "dead letter payload not serializable");
                return;
            }
        };
        let entry = DeadLetterEntry::new(
            DeadLetterSource::RetryQueue,
            payload,
            item.retry_count,
            reason.to_string(),
        );
        let _guard = self.dlq_lock.lock().await;
        let mut entries: Vec<DeadLetterEntry> =
            load_records(store.as_ref()).await.unwrap_or_default();
        entries.push(entry);
        if let Err(err) = save_records(store.as_ref(), &entries).await {
            warn!(error = %err, "failed to persist dead letter");
        }
    }

    /// Background replay: best-effort, one pass per minute while the process
    /// lives. The handle can be aborted on shutdown.
    pub fn spawn_replay_loop(
        self: &Arc<Self>,
        client: Arc<WebhookClient>,
    ) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(REPLAY_INTERVAL).await;
                match queue.process(&client).await {
                    Ok(outcome) if outcome.attempted > 0 => {
                        info!(
                            delivered = outcome.delivered,
                            requeued = outcome.requeued,
                            dead_lettered = outcome.dead_lettered,
                            remaining = outcome.remaining,
                            "retry queue pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "retry queue pass failed"),
                }
            }
        })
    }
}
