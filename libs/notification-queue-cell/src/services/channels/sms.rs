use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shared_config::AppConfig;

use super::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use crate::models::ChannelKind;
use crate::services::templates::RenderedMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub base_url: String,
}

impl TwilioConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            account_sid: config.twilio_account_sid.clone(),
            auth_token: config.twilio_auth_token.clone(),
            from_number: config.twilio_from_number.clone(),
            base_url: config.twilio_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/2010-04-01/Accounts/{}/Messages.json", self.base_url, self.account_sid)
    }
}

#[derive(Debug, Deserialize)]
struct TwilioResponse {
    sid: Option<String>,
}

pub struct TwilioChannel {
    config: TwilioConfig,
    client: Client,
}

impl TwilioChannel {
    pub fn new(config: TwilioConfig, client: Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl DeliveryChannel for TwilioChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    fn provider(&self) -> &'static str {
        "twilio"
    }

    async fn deliver(&self, message: &RenderedMessage) -> Result<DeliveryReceipt, DeliveryError> {
        if self.config.account_sid.is_empty() || self.config.from_number.is_empty() {
            return Err(DeliveryError::Permanent("Twilio credentials are not configured".to_string()));
        }

        // SMS carries the body only
        let form = [
            ("To", message.recipient.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", message.body.as_str()),
        ];

        let response = self
            .client
            .post(self.config.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| DeliveryError::from_request("twilio", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Twilio rejected notification {}: {} - {}", message.notification_id, status, body);
            return Err(DeliveryError::from_status("twilio", status, &body));
        }

        let parsed: Option<TwilioResponse> = response.json().await.ok();
        debug!("SMS notification {} accepted by Twilio", message.notification_id);

        Ok(DeliveryReceipt {
            provider: "twilio".to_string(),
            provider_message_id: parsed.and_then(|r| r.sid),
        })
    }
}
