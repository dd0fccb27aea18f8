use crate::events::{Audience, EventType};
use crate::router::AudienceHandler;
use async_trait::async_trait;
use courier_core::types::Submission;
use courier_delivery::WebhookClient;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Audience handler that forwards events as webhook submissions through
/// the delivery pipeline, tagged with event type and audience so the
/// downstream automation can route them.
pub struct ForwardingHandler {
    audience: Audience,
    client: Arc<WebhookClient>,
}

impl ForwardingHandler {
    pub fn new(audience: Audience, client: Arc<WebhookClient>) -> Self {
        Self { audience, client }
    }
}

#[async_trait]
impl AudienceHandler for ForwardingHandler {
    fn audience(&self) -> Audience {
        self.audience
    }

    async fn handle(&self, event: EventType, data: &Value) -> anyhow::Result<Value> {
        let mut fields: Map<String, Value> = data.as_object().cloned().unwrap_or_default();
        fields.insert("event".to_string(), Value::String(event.as_str().to_string()));
        fields.insert(
            "audience".to_string(),
            Value::String(self.audience.as_str().to_string()),
        );

        let receipt = self
            .client
            .submit_with_fallback(Submission::new(fields), None)
            .await?;
        Ok(json!({"delivered": receipt.is_delivered()}))
    }
}
