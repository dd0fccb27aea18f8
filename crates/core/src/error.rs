use thiserror::Error;

/// Failures observed while delivering to a single endpoint.
///
/// Transient variants are retried with backoff inside the endpoint loop;
/// `Client` short-circuits to the next endpoint in priority order.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("client error from {endpoint}: HTTP {status}: {body}")]
    Client {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("server error from {endpoint}: HTTP {status}")]
    Server { endpoint: String, status: u16 },

    #[error("rate limited by {endpoint}")]
    RateLimited { endpoint: String },

    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("network failure reaching {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    #[error("retry budget exhausted for {endpoint}: {last}")]
    RetriesExhausted { endpoint: String, last: String },

    #[error("no webhook endpoints configured")]
    NoEndpoints,
}

impl DeliveryError {
    /// Whether the same endpoint should be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Server { .. }
                | DeliveryError::RateLimited { .. }
                | DeliveryError::Timeout { .. }
                | DeliveryError::Network { .. }
        )
    }
}

/// Synchronous, fatal validation and ingress failures from the event router.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("event data is required and must be a JSON object")]
    InvalidEventData,

    #[error("required field '{field}' missing for event type '{event_type}'")]
    MissingField { event_type: String, field: String },

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown audience: {0}")]
    UnknownAudience(String),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("webhook signature required but not provided")]
    MissingSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = DeliveryError::Client {
            endpoint: "primary".into(),
            status: 400,
            body: "bad payload".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let server = DeliveryError::Server {
            endpoint: "primary".into(),
            status: 503,
        };
        let timeout = DeliveryError::Timeout {
            endpoint: "primary".into(),
        };
        let limited = DeliveryError::RateLimited {
            endpoint: "primary".into(),
        };

        assert!(server.is_retryable());
        assert!(timeout.is_retryable());
        assert!(limited.is_retryable());
    }

    #[test]
    fn test_missing_field_message_names_both() {
        let err = DispatchError::MissingField {
            event_type: "safety.alert".into(),
            field: "severity".into(),
        };
        let message = err.to_string();

        assert!(message.contains("severity"));
        assert!(message.contains("safety.alert"));
    }
}
