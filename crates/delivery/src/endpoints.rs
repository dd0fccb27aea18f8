use chrono::{Duration as ChronoDuration, Utc};
use courier_core::types::{Endpoint, HealthStatus};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

const HEALTH_CACHE_TTL_SECS: i64 = 5 * 60;

/// Prioritized outbound targets with a per-URL health cache.
///
/// Health entries expire after five minutes; an expired or missing entry is
/// treated as healthy so a recovered endpoint gets traffic again without an
/// explicit probe.
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
    health: Mutex<HashMap<String, HealthStatus>>,
    ttl: ChronoDuration,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub name: String,
    pub url: String,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub endpoints: Vec<EndpointHealth>,
}

impl EndpointRegistry {
    pub fn new(mut endpoints: Vec<Endpoint>) -> Self {
        endpoints.retain(|e| !e.url.trim().is_empty());
        // stable: equal priorities keep declaration order
        endpoints.sort_by_key(|e| e.priority);
        Self {
            endpoints,
            health: Mutex::new(HashMap::new()),
            ttl: ChronoDuration::seconds(HEALTH_CACHE_TTL_SECS),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn all(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Healthy per the cache, optimistic when unknown or stale.
    pub async fn is_healthy(&self, url: &str) -> bool {
        let health = self.health.lock().await;
        match health.get(url) {
            Some(status) if Utc::now() - status.last_checked <= self.ttl => status.healthy,
            _ => true,
        }
    }

    pub async fn mark(&self, url: &str, healthy: bool) {
        let mut health = self.health.lock().await;
        health.insert(
            url.to_string(),
            HealthStatus {
                healthy,
                last_checked: Utc::now(),
            },
        );
    }

    /// Delivery order: healthy endpoints first, then endpoints currently
    /// marked unhealthy, each group in priority order. Unhealthy targets are
    /// deprioritized rather than dropped so a submission always gets at
    /// least one live attempt per pass.
    pub async fn ordered(&self) -> Vec<Endpoint> {
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for endpoint in &self.endpoints {
            if self.is_healthy(&endpoint.url).await {
                healthy.push(endpoint.clone());
            } else {
                unhealthy.push(endpoint.clone());
            }
        }
        healthy.extend(unhealthy);
        healthy
    }

    pub async fn summary(&self) -> HealthSummary {
        let mut endpoints = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            endpoints.push(EndpointHealth {
                name: endpoint.name.clone(),
                url: endpoint.url.clone(),
                healthy: self.is_healthy(&endpoint.url).await,
            });
        }
        let healthy = endpoints.iter().filter(|e| e.healthy).count();
        HealthSummary {
            total: endpoints.len(),
            healthy,
            unhealthy: endpoints.len() - healthy,
            endpoints,
        }
    }
}
