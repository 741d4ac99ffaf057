use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use shared_config::AppConfig;

use super::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use crate::models::ChannelKind;
use crate::services::templates::RenderedMessage;

/// Generic push gateway reached with a JSON POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushGatewayConfig {
    pub url: String,
    /// Sent as a bearer token when non-empty.
    pub token: String,
}

impl PushGatewayConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            url: config.push_gateway_url.clone(),
            token: config.push_gateway_token.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushGatewayResponse {
    id: Option<String>,
}

pub struct PushGatewayChannel {
    config: PushGatewayConfig,
    client: Client,
}

impl PushGatewayChannel {
    pub fn new(config: PushGatewayConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn build_payload(&self, message: &RenderedMessage) -> serde_json::Value {
        json!({
            "to": message.recipient,
            "title": message.subject,
            "body": message.body,
            "data": {
                "notification_id": message.notification_id,
            }
        })
    }
}

#[async_trait]
impl DeliveryChannel for PushGatewayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    fn provider(&self) -> &'static str {
        "push-gateway"
    }

    async fn deliver(&self, message: &RenderedMessage) -> Result<DeliveryReceipt, DeliveryError> {
        if self.config.url.is_empty() {
            return Err(DeliveryError::Permanent("Push gateway URL is not configured".to_string()));
        }

        let mut request = self.client.post(&self.config.url).json(&self.build_payload(message));
        if !self.config.token.is_empty() {
            request = request.bearer_auth(&self.config.token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::from_request("push-gateway", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Push gateway rejected notification {}: {} - {}", message.notification_id, status, body);
            return Err(DeliveryError::from_status("push-gateway", status, &body));
        }

        let parsed: Option<PushGatewayResponse> = response.json().await.ok();
        debug!("Push notification {} accepted by gateway", message.notification_id);

        Ok(DeliveryReceipt {
            provider: "push-gateway".to_string(),
            provider_message_id: parsed.and_then(|r| r.id),
        })
    }
}
