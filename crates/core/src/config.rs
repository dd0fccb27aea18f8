use crate::types::Endpoint;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub primary_webhook_url: Option<String>,
    pub backup_webhook_url: Option<String>,
    pub primary_timeout_ms: u64,
    pub backup_timeout_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: u32,
    pub max_concurrency: usize,
    pub rate_limit_per_second: u32,
    pub retry_delay_ms: u64,
    pub batch_size: usize,
    pub queue_timeout_ms: u64,
    pub retry_store_path: String,
    pub audit_store_path: String,
    pub audit_flush_secs: u64,
    pub ingress_secret: Option<String>,
    pub keep_dead_letters: bool,
    pub env: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let primary_webhook_url = non_empty(std::env::var("COURIER_WEBHOOK_URL").ok());
        let backup_webhook_url = non_empty(std::env::var("COURIER_WEBHOOK_URL_BACKUP").ok());
        let primary_timeout_ms = parse_or("COURIER_PRIMARY_TIMEOUT_MS", 10_000);
        let backup_timeout_ms = parse_or("COURIER_BACKUP_TIMEOUT_MS", 15_000);
        let max_retries = parse_or("COURIER_MAX_RETRIES", 3);
        let base_delay_ms = parse_or("COURIER_BASE_DELAY_MS", 1_000);
        let max_delay_ms = parse_or("COURIER_MAX_DELAY_MS", 10_000);
        let backoff_factor = parse_or("COURIER_BACKOFF_FACTOR", 2);
        let max_concurrency = parse_or("COURIER_MAX_CONCURRENCY", 3);
        let rate_limit_per_second = parse_or("COURIER_RATE_LIMIT_PER_SECOND", 10);
        let retry_delay_ms = parse_or("COURIER_RETRY_DELAY_MS", 1_000);
        let batch_size = parse_or("COURIER_BATCH_SIZE", 500);
        let queue_timeout_ms = parse_or("COURIER_QUEUE_TIMEOUT_MS", 300_000);
        let retry_store_path = std::env::var("COURIER_RETRY_STORE")
            .unwrap_or_else(|_| "courier_retry_queue.json".to_string());
        let audit_store_path = std::env::var("COURIER_AUDIT_STORE")
            .unwrap_or_else(|_| "courier_audit_log.json".to_string());
        let audit_flush_secs = parse_or("COURIER_AUDIT_FLUSH_SECS", 30);
        let ingress_secret = non_empty(std::env::var("COURIER_INGRESS_SECRET").ok());
        let keep_dead_letters = parse_or("COURIER_KEEP_DEAD_LETTERS", false);
        let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "dev".to_string());

        Self {
            primary_webhook_url,
            backup_webhook_url,
            primary_timeout_ms,
            backup_timeout_ms,
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_factor,
            max_concurrency,
            rate_limit_per_second,
            retry_delay_ms,
            batch_size,
            queue_timeout_ms,
            retry_store_path,
            audit_store_path,
            audit_flush_secs,
            ingress_secret,
            keep_dead_letters,
            env,
        }
    }

    /// Endpoint list derived from the configured URLs, empty URLs removed.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        if let Some(url) = &self.primary_webhook_url {
            endpoints.push(
                Endpoint::new("primary", url)
                    .with_priority(1)
                    .with_timeout(Duration::from_millis(self.primary_timeout_ms)),
            );
        }
        if let Some(url) = &self.backup_webhook_url {
            endpoints.push(
                Endpoint::new("backup", url)
                    .with_priority(2)
                    .with_timeout(Duration::from_millis(self.backup_timeout_ms)),
            );
        }
        endpoints
    }

    pub fn is_production(&self) -> bool {
        self.env == "production"
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
