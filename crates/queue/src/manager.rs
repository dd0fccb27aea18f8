use crate::rate_limit::{RateLimiterStats, TokenBucket};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::backoff::BackoffPolicy;
use courier_core::types::{DeadLetterEntry, DeadLetterSource, JobPriority};
use courier_store::{load_records, save_records, DurableStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Executes one job. Injected so the manager stays transport-agnostic;
/// the payload carries whatever the processor expects.
#[async_trait]
pub trait JobProcessor: Send + Sync + 'static {
    async fn process(&self, job: &Job) -> anyhow::Result<Value>;
}

/// One unit of work in a named queue.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub data: Value,
    pub priority: JobPriority,
    pub max_retries: u32,
    pub retry_count: u32,
    pub added_at: DateTime<Utc>,
    /// Soft deadline measured from `added_at`; a job still pending past it
    /// is discarded, never executed. Running jobs are not cancelled.
    #[serde(skip)]
    pub timeout: Duration,
    pub bulk: Option<BulkTag>,
}

/// The bulk list operations the pipeline supports. A processor matches on
/// this exhaustively, so a new operation cannot be added without deciding
/// how it is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOp {
    AddMembers,
    UpdateMembers,
    SendCampaign,
    AddTags,
    UpdateMemberFields,
}

impl BulkOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOp::AddMembers => "add_members",
            BulkOp::UpdateMembers => "update_members",
            BulkOp::SendCampaign => "send_campaign",
            BulkOp::AddTags => "add_tags",
            BulkOp::UpdateMemberFields => "update_member_fields",
        }
    }
}

impl std::fmt::Display for BulkOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marks a job as one batch of a bulk split.
#[derive(Debug, Clone, Serialize)]
pub struct BulkTag {
    pub bulk_id: String,
    pub operation: BulkOp,
    pub batch_index: usize,
    pub total_batches: usize,
    pub original_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub priority: JobPriority,
    pub max_retries: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            max_retries: 3,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BulkOptions {
    pub batch_size: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-queue concurrency limit for lazily created queues.
    pub concurrency: usize,
    pub rate_limit_per_second: u32,
    /// Base delay for job retries, doubled per retry.
    pub retry_delay: Duration,
    pub default_timeout: Duration,
    /// Scheduling pass interval for the background loop.
    pub tick: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            rate_limit_per_second: 10,
            retry_delay: Duration::from_secs(1),
            default_timeout: Duration::from_secs(300),
            tick: Duration::from_millis(100),
        }
    }
}

/// Lifecycle notifications, one broadcast channel per manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded { queue: String, job_id: String, priority: JobPriority },
    JobStarted { queue: String, job_id: String },
    JobCompleted { queue: String, job_id: String, duration_ms: u64 },
    JobRetried { queue: String, job_id: String, retry_count: u32, delay_ms: u64 },
    JobExhausted { queue: String, job_id: String, error: String },
    JobTimedOut { queue: String, job_id: String },
    BulkProgress { queue: String, operation: BulkOp, completed_batches: usize, total_batches: usize, progress: f64 },
    BulkCompleted { queue: String, operation: BulkOp, total_batches: usize },
    QueuePaused { queue: String },
    QueueResumed { queue: String },
    QueueCleared { queue: String, dropped: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub name: String,
    pub pending: usize,
    pub active: usize,
    pub paused: bool,
    pub concurrency: usize,
}

/// Point-in-time counters; plain data for a monitoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub timed_out_jobs: u64,
    pub retried_jobs: u64,
    pub rate_limit_hits: u64,
    pub active_jobs: usize,
    pub avg_processing_ms: f64,
    pub queue_sizes: HashMap<String, usize>,
    pub rate_limiter: RateLimiterStats,
}

struct QueueState {
    pending: VecDeque<Job>,
    concurrency: usize,
    active: usize,
    paused: bool,
}

#[derive(Default)]
struct MetricsState {
    total: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    retried: u64,
    rate_limit_hits: u64,
    avg_processing_ms: f64,
}

struct BulkProgress {
    queue: String,
    operation: BulkOp,
    completed: usize,
    total: usize,
}

/// Named, priority, rate-limited job runner.
///
/// Jobs are dispatched in priority-then-insertion order within a queue;
/// completion order is not guaranteed once concurrency exceeds one. The
/// shared token bucket gates dispatch across all queues.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: QueueConfig,
    processor: Arc<dyn JobProcessor>,
    queues: Mutex<HashMap<String, QueueState>>,
    bulk: Mutex<HashMap<String, BulkProgress>>,
    metrics: Mutex<MetricsState>,
    limiter: TokenBucket,
    backoff: BackoffPolicy,
    events: broadcast::Sender<QueueEvent>,
    dead_letters: Option<Arc<dyn DurableStore>>,
    // exhausted jobs finish on concurrent worker tasks; their
    // load-append-save on the store must not interleave
    dead_letter_lock: Mutex<()>,
}

impl QueueManager {
    pub fn new(processor: Arc<dyn JobProcessor>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let limiter = TokenBucket::new(config.rate_limit_per_second);
        let backoff = BackoffPolicy::job(config.retry_delay);
        Self {
            inner: Arc::new(Inner {
                config,
                processor,
                queues: Mutex::new(HashMap::new()),
                bulk: Mutex::new(HashMap::new()),
                metrics: Mutex::new(MetricsState::default()),
                limiter,
                backoff,
                events,
                dead_letters: None,
                dead_letter_lock: Mutex::new(()),
            }),
        }
    }

    /// Persist exhausted jobs instead of dropping them. Must be called
    /// before the manager is cloned or spawned.
    pub fn with_dead_letter_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.dead_letters = Some(store),
            None => warn!("dead letter store ignored: manager already shared"),
        }
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Create the named queue up front with an explicit concurrency limit.
    /// Queues referenced by `add_job` without this are created with the
    /// configured default.
    pub async fn create_queue(&self, name: &str, concurrency: usize) {
        let mut queues = self.inner.queues.lock().await;
        queues.entry(name.to_string()).or_insert_with(|| QueueState {
            pending: VecDeque::new(),
            concurrency: concurrency.max(1),
            active: 0,
            paused: false,
        });
    }

    /// Enqueue one job; high priority goes to the front of the pending
    /// list. Returns the job id.
    pub async fn add_job(&self, queue: &str, data: Value, options: JobOptions) -> String {
        let job = Job {
            id: format!("job_{}", nanoid::nanoid!(12)),
            queue: queue.to_string(),
            data,
            priority: options.priority,
            max_retries: options.max_retries,
            retry_count: 0,
            added_at: Utc::now(),
            timeout: options.timeout,
            bulk: None,
        };
        let id = job.id.clone();

        self.inner.metrics.lock().await.total += 1;
        self.emit(QueueEvent::JobAdded {
            queue: queue.to_string(),
            job_id: id.clone(),
            priority: options.priority,
        });

        if options.delay > Duration::ZERO {
            // delayed jobs wait on a timer and only join the pending list
            // (and compete for a slot) once the delay fires
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(options.delay).await;
                manager.push(job).await;
            });
        } else {
            self.push(job).await;
        }
        id
    }

    /// Split `items` into `ceil(len / batch_size)` batches, one job each,
    /// tagged with batch index and total for progress reporting.
    pub async fn add_bulk_job(
        &self,
        queue: &str,
        operation: BulkOp,
        items: Vec<Value>,
        options: BulkOptions,
    ) -> Vec<String> {
        if items.is_empty() {
            return Vec::new();
        }
        let batch_size = options.batch_size.max(1);
        let original_count = items.len();
        let total_batches = original_count.div_ceil(batch_size);
        let bulk_id = format!("bulk_{}", nanoid::nanoid!(12));

        self.inner.bulk.lock().await.insert(
            bulk_id.clone(),
            BulkProgress {
                queue: queue.to_string(),
                operation,
                completed: 0,
                total: total_batches,
            },
        );

        let mut ids = Vec::with_capacity(total_batches);
        for (batch_index, chunk) in items.chunks(batch_size).enumerate() {
            let job = Job {
                id: format!("job_{}", nanoid::nanoid!(12)),
                queue: queue.to_string(),
                data: Value::Array(chunk.to_vec()),
                priority: JobPriority::Normal,
                max_retries: 3,
                retry_count: 0,
                added_at: Utc::now(),
                timeout: self.inner.config.default_timeout,
                bulk: Some(BulkTag {
                    bulk_id: bulk_id.clone(),
                    operation,
                    batch_index,
                    total_batches,
                    original_count,
                }),
            };
            ids.push(job.id.clone());
            self.inner.metrics.lock().await.total += 1;
            self.emit(QueueEvent::JobAdded {
                queue: queue.to_string(),
                job_id: job.id.clone(),
                priority: JobPriority::Normal,
            });
            self.push(job).await;
        }

        info!(queue, operation = %operation, batches = total_batches, items = original_count, "bulk job split");
        ids
    }

    pub async fn pause(&self, queue: &str) {
        if let Some(state) = self.inner.queues.lock().await.get_mut(queue) {
            state.paused = true;
            self.emit(QueueEvent::QueuePaused { queue: queue.to_string() });
        }
    }

    pub async fn resume(&self, queue: &str) {
        if let Some(state) = self.inner.queues.lock().await.get_mut(queue) {
            state.paused = false;
            self.emit(QueueEvent::QueueResumed { queue: queue.to_string() });
        }
    }

    /// Drop every pending job in the queue; running jobs finish.
    pub async fn clear(&self, queue: &str) -> usize {
        let dropped = match self.inner.queues.lock().await.get_mut(queue) {
            Some(state) => {
                let dropped = state.pending.len();
                state.pending.clear();
                dropped
            }
            None => 0,
        };
        if dropped > 0 {
            self.emit(QueueEvent::QueueCleared { queue: queue.to_string(), dropped });
        }
        dropped
    }

    pub async fn queue_status(&self, queue: &str) -> Option<QueueStatus> {
        self.inner.queues.lock().await.get(queue).map(|state| QueueStatus {
            name: queue.to_string(),
            pending: state.pending.len(),
            active: state.active,
            paused: state.paused,
            concurrency: state.concurrency,
        })
    }

    pub async fn all_queue_statuses(&self) -> Vec<QueueStatus> {
        let queues = self.inner.queues.lock().await;
        queues
            .iter()
            .map(|(name, state)| QueueStatus {
                name: name.clone(),
                pending: state.pending.len(),
                active: state.active,
                paused: state.paused,
                concurrency: state.concurrency,
            })
            .collect()
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let (active_jobs, queue_sizes) = {
            let queues = self.inner.queues.lock().await;
            let active = queues.values().map(|s| s.active).sum();
            let sizes = queues
                .iter()
                .map(|(name, state)| (name.clone(), state.pending.len()))
                .collect();
            (active, sizes)
        };
        let metrics = self.inner.metrics.lock().await;
        QueueMetrics {
            total_jobs: metrics.total,
            completed_jobs: metrics.completed,
            failed_jobs: metrics.failed,
            timed_out_jobs: metrics.timed_out,
            retried_jobs: metrics.retried,
            rate_limit_hits: metrics.rate_limit_hits,
            active_jobs,
            avg_processing_ms: metrics.avg_processing_ms,
            queue_sizes,
            rate_limiter: self.inner.limiter.stats(),
        }
    }

    /// One scheduling pass over every queue. The background loop calls this
    /// on a fixed tick; tests can drive it directly.
    pub async fn tick_once(&self) {
        let names: Vec<String> = self.inner.queues.lock().await.keys().cloned().collect();
        for name in names {
            self.dispatch_ready(&name).await;
        }
    }

    /// Background scheduler; abort the handle on shutdown.
    pub fn spawn_processing_loop(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let tick = manager.inner.config.tick;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                manager.tick_once().await;
            }
        })
    }

    async fn push(&self, job: Job) {
        let mut queues = self.inner.queues.lock().await;
        let state = queues.entry(job.queue.clone()).or_insert_with(|| QueueState {
            pending: VecDeque::new(),
            concurrency: self.inner.config.concurrency,
            active: 0,
            paused: false,
        });
        match job.priority {
            JobPriority::High => state.pending.push_front(job),
            JobPriority::Normal => state.pending.push_back(job),
        }
    }

    // Retries jump the line so old work is not starved by newer jobs.
    async fn push_front(&self, job: Job) {
        let mut queues = self.inner.queues.lock().await;
        if let Some(state) = queues.get_mut(&job.queue) {
            state.pending.push_front(job);
        }
    }

    async fn dispatch_ready(&self, queue: &str) {
        loop {
            let job = {
                let mut queues = self.inner.queues.lock().await;
                let Some(state) = queues.get_mut(queue) else { return };
                if state.paused || state.active >= state.concurrency {
                    return;
                }
                let Some(front) = state.pending.front() else { return };

                let age = Utc::now() - front.added_at;
                let expired = age.to_std().map(|a| a > front.timeout).unwrap_or(false);
                if expired {
                    let job = state.pending.pop_front().unwrap_or_else(|| unreachable!());
                    drop(queues);
                    self.expire(job).await;
                    continue;
                }

                if !self.inner.limiter.try_take() {
                    self.inner.metrics.lock().await.rate_limit_hits += 1;
                    debug!(queue, "rate limit reached, deferring to next tick");
                    return;
                }

                let job = state.pending.pop_front().unwrap_or_else(|| unreachable!());
                state.active += 1;
                job
            };

            self.emit(QueueEvent::JobStarted {
                queue: job.queue.clone(),
                job_id: job.id.clone(),
            });
            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_job(job).await;
            });
        }
    }

    async fn run_job(&self, mut job: Job) {
        let started = Instant::now();
        let result = self.inner.processor.process(&job).await;
        let elapsed = started.elapsed();

        if let Some(state) = self.inner.queues.lock().await.get_mut(&job.queue) {
            state.active = state.active.saturating_sub(1);
        }

        match result {
            Ok(_) => self.complete(job, elapsed).await,
            Err(err) => self.fail(&mut job, err).await,
        }
    }

    async fn complete(&self, job: Job, elapsed: Duration) {
        {
            let mut metrics = self.inner.metrics.lock().await;
            metrics.completed += 1;
            let n = metrics.completed as f64;
            let ms = elapsed.as_millis() as f64;
            metrics.avg_processing_ms += (ms - metrics.avg_processing_ms) / n;
        }
        self.emit(QueueEvent::JobCompleted {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            duration_ms: elapsed.as_millis() as u64,
        });

        let Some(tag) = &job.bulk else { return };
        let mut bulk = self.inner.bulk.lock().await;
        let Some(progress) = bulk.get_mut(&tag.bulk_id) else { return };
        progress.completed += 1;
        self.emit(QueueEvent::BulkProgress {
            queue: progress.queue.clone(),
            operation: progress.operation,
            completed_batches: progress.completed,
            total_batches: progress.total,
            progress: progress.completed as f64 / progress.total as f64,
        });
        if progress.completed >= progress.total {
            self.emit(QueueEvent::BulkCompleted {
                queue: progress.queue.clone(),
                operation: progress.operation,
                total_batches: progress.total,
            });
            bulk.remove(&tag.bulk_id);
        }
    }

    async fn fail(&self, job: &mut Job, err: anyhow::Error) {
        job.retry_count += 1;

        if job.retry_count <= job.max_retries {
            let delay = self.inner.backoff.delay(job.retry_count);
            self.inner.metrics.lock().await.retried += 1;
            self.emit(QueueEvent::JobRetried {
                queue: job.queue.clone(),
                job_id: job.id.clone(),
                retry_count: job.retry_count,
                delay_ms: delay.as_millis() as u64,
            });
            warn!(
                queue = %job.queue,
                job_id = %job.id,
                retry_count = job.retry_count,
                error = %err,
                "job failed, retrying"
            );

            let manager = self.clone();
            let job = job.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                manager.push_front(job).await;
            });
            return;
        }

        self.inner.metrics.lock().await.failed += 1;
        self.emit(QueueEvent::JobExhausted {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            error: err.to_string(),
        });
        warn!(queue = %job.queue, job_id = %job.id, error = %err, "job exhausted its retries");

        if let Some(store) = &self.inner.dead_letters {
            let entry = DeadLetterEntry::new(
                DeadLetterSource::Job,
                job.data.clone(),
                job.retry_count,
                err.to_string(),
            );
            let _guard = self.inner.dead_letter_lock.lock().await;
            let mut entries: Vec<DeadLetterEntry> =
                load_records(store.as_ref()).await.unwrap_or_default();
            entries.push(entry);
            if let Err(err) = save_records(store.as_ref(), &entries).await {
                warn!(error = %err, "failed to persist job dead letter");
            }
        }
    }

    async fn expire(&self, job: Job) {
        {
            let mut metrics = self.inner.metrics.lock().await;
            metrics.timed_out += 1;
            metrics.failed += 1;
        }
        self.emit(QueueEvent::JobTimedOut {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
        });
        warn!(queue = %job.queue, job_id = %job.id, "job expired before execution");
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
