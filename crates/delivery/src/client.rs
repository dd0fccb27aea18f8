use crate::endpoints::EndpointRegistry;
use crate::retry_queue::RetryQueue;
use courier_audit::AuditLogger;
use courier_core::backoff::BackoffPolicy;
use courier_core::error::DeliveryError;
use courier_core::types::{Endpoint, Submission};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::http(),
        }
    }
}

/// Terminal outcome of a submission. `Queued` is a signaled non-fatal
/// failure: the payload was parked for later replay, not lost.
#[derive(Debug, Clone)]
pub enum DeliveryReceipt {
    Delivered { message: String, body: Value },
    Queued,
}

impl DeliveryReceipt {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryReceipt::Delivered { .. })
    }
}

/// Delivers a submission to exactly one of several interchangeable webhook
/// endpoints, with per-endpoint retry and cross-endpoint fallback.
pub struct WebhookClient {
    registry: Arc<EndpointRegistry>,
    queue: Arc<RetryQueue>,
    audit: AuditLogger,
    retry: RetryOptions,
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(registry: Arc<EndpointRegistry>, queue: Arc<RetryQueue>, audit: AuditLogger) -> Self {
        Self {
            registry,
            queue,
            audit,
            retry: RetryOptions::default(),
            // per-request timeouts come from the endpoint configuration
            http: reqwest::Client::new(),
        }
    }

    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Options the replay path uses, so a tuned client retries the same way
    /// on replay as it does on first delivery.
    pub(crate) fn retry_options(&self) -> &RetryOptions {
        &self.retry
    }

    /// Deliver with retry and fallback; on total exhaustion the submission is
    /// queued for background replay and `Queued` is returned.
    ///
    /// Only two outcomes cross this boundary: delivered, or accepted for
    /// later delivery. An error is returned solely when the payload could be
    /// neither delivered nor durably queued.
    pub async fn submit_with_fallback(
        &self,
        submission: Submission,
        options: Option<RetryOptions>,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let opts = options.unwrap_or(self.retry);
        let mut submission = submission;

        let last_error = match self.try_endpoints(&mut submission, &opts).await {
            Ok(receipt) => return Ok(receipt),
            Err(err) => err,
        };

        match self.queue.enqueue(submission).await {
            Ok(queue_len) => {
                info!(queue_len, "all endpoints failed, submission queued for retry");
                Ok(DeliveryReceipt::Queued)
            }
            Err(store_err) => {
                self.audit
                    .system_error("retry_queue", &store_err.to_string(), "critical")
                    .await;
                Err(last_error)
            }
        }
    }

    /// Walk endpoints in health-then-priority order; first success wins.
    ///
    /// Also the replay path: the retry queue calls this directly so a failed
    /// replay never re-enqueues a duplicate of an item it already holds.
    pub(crate) async fn try_endpoints(
        &self,
        submission: &mut Submission,
        opts: &RetryOptions,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let ordered = self.registry.ordered().await;
        if ordered.is_empty() {
            return Err(DeliveryError::NoEndpoints);
        }

        let mut last_error: Option<DeliveryError> = None;
        let mut failed_url: Option<String> = None;

        for endpoint in &ordered {
            if let Some(previous) = failed_url.take() {
                self.audit
                    .fallback_triggered(
                        &previous,
                        &endpoint.url,
                        &last_error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                    )
                    .await;
            }

            match self.submit_to_endpoint(endpoint, submission, opts).await {
                Ok(receipt) => {
                    self.registry.mark(&endpoint.url, true).await;
                    return Ok(receipt);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint.name, error = %err, "endpoint failed");
                    self.registry.mark(&endpoint.url, false).await;
                    failed_url = Some(endpoint.url.clone());
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.expect("at least one endpoint was attempted"))
    }

    /// Bounded retry loop against a single endpoint.
    ///
    /// 2xx returns; 429 retries after a penalty delay; 5xx, timeouts and
    /// network failures retry with exponential backoff; any other 4xx is
    /// non-retryable and escalates to the caller for fallback.
    async fn submit_to_endpoint(
        &self,
        endpoint: &Endpoint,
        submission: &mut Submission,
        opts: &RetryOptions,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut last_error: Option<DeliveryError> = None;

        for attempt in 1..=opts.max_retries {
            submission.attempt = attempt;
            let started = Instant::now();
            let result = self.send_once(endpoint, submission).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok((status, body)) => {
                    self.audit
                        .webhook_call(&endpoint.url, Some(status), true, latency_ms, Some(attempt), None)
                        .await;
                    let message = body
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Submission successful")
                        .to_string();
                    return Ok(DeliveryReceipt::Delivered { message, body });
                }
                Err(err) => {
                    let status = match &err {
                        DeliveryError::Client { status, .. } | DeliveryError::Server { status, .. } => {
                            Some(*status)
                        }
                        DeliveryError::RateLimited { .. } => Some(429),
                        _ => None,
                    };
                    self.audit
                        .webhook_call(
                            &endpoint.url,
                            status,
                            false,
                            latency_ms,
                            Some(attempt),
                            Some(&err.to_string()),
                        )
                        .await;

                    if !err.is_retryable() {
                        return Err(err);
                    }

                    if attempt < opts.max_retries {
                        let delay = match &err {
                            DeliveryError::RateLimited { .. } => opts.backoff.rate_limit_delay(attempt),
                            _ => opts.backoff.delay(attempt),
                        };
                        self.audit
                            .retry_attempt(
                                "webhook_submit",
                                attempt,
                                opts.max_retries,
                                delay,
                                &err.to_string(),
                            )
                            .await;
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(DeliveryError::RetriesExhausted {
            endpoint: endpoint.name.clone(),
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "max retries exceeded".to_string()),
        })
    }

    async fn send_once(
        &self,
        endpoint: &Endpoint,
        submission: &Submission,
    ) -> Result<(u16, Value), DeliveryError> {
        let response = self
            .http
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .json(submission)
            .timeout(endpoint.timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    let body = resp.json::<Value>().await.unwrap_or(Value::Null);
                    Ok((status.as_u16(), body))
                } else if status.as_u16() == 429 {
                    Err(DeliveryError::RateLimited {
                        endpoint: endpoint.name.clone(),
                    })
                } else if status.is_server_error() {
                    Err(DeliveryError::Server {
                        endpoint: endpoint.name.clone(),
                        status: status.as_u16(),
                    })
                } else {
                    let body = resp.text().await.unwrap_or_default();
                    Err(DeliveryError::Client {
                        endpoint: endpoint.name.clone(),
                        status: status.as_u16(),
                        body,
                    })
                }
            }
            Err(err) => {
                if err.is_timeout() {
                    Err(DeliveryError::Timeout {
                        endpoint: endpoint.name.clone(),
                    })
                } else {
                    Err(DeliveryError::Network {
                        endpoint: endpoint.name.clone(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    /// Out-of-band HEAD probe of every configured endpoint. Any status below
    /// 500 counts as healthy. Updates the health cache.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let probes = self.registry.all().iter().map(|endpoint| async move {
            let started = Instant::now();
            let healthy = match self
                .http
                .head(&endpoint.url)
                .timeout(HEALTH_PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => resp.status().as_u16() < 500,
                Err(_) => false,
            };
            self.registry.mark(&endpoint.url, healthy).await;
            self.audit
                .health_check(&endpoint.url, healthy, started.elapsed().as_millis() as u64)
                .await;
            (endpoint.name.clone(), healthy)
        });

        join_all(probes).await.into_iter().collect()
    }
}
