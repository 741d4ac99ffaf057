use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shared_config::AppConfig;

use super::{DeliveryChannel, DeliveryError, DeliveryReceipt};
use crate::models::ChannelKind;
use crate::services::templates::RenderedMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailgunConfig {
    pub api_key: String,
    pub domain: String,
    pub base_url: String,
    pub from: String,
}

impl MailgunConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            api_key: config.mailgun_api_key.clone(),
            domain: config.mailgun_domain.clone(),
            base_url: config.mailgun_base_url.trim_end_matches('/').to_string(),
            from: config.mail_from.clone(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/v3/{}/messages", self.base_url, self.domain)
    }
}

#[derive(Debug, Deserialize)]
struct MailgunResponse {
    id: Option<String>,
}

pub struct MailgunChannel {
    config: MailgunConfig,
    client: Client,
}

impl MailgunChannel {
    pub fn new(config: MailgunConfig, client: Client) -> Self {
        Self { config, client }
    }
}

#[async_trait]
impl DeliveryChannel for MailgunChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn provider(&self) -> &'static str {
        "mailgun"
    }

    async fn deliver(&self, message: &RenderedMessage) -> Result<DeliveryReceipt, DeliveryError> {
        if self.config.api_key.is_empty() || self.config.domain.is_empty() {
            return Err(DeliveryError::Permanent("Mailgun credentials are not configured".to_string()));
        }

        let fields = [
            ("from", self.config.from.as_str()),
            ("to", message.recipient.as_str()),
            ("subject", message.subject.as_str()),
            ("text", message.body.as_str()),
        ];

        let request = self
            .client
            .post(self.config.messages_url())
            .basic_auth("api", Some(&self.config.api_key));

        // Attachments need multipart; plain messages stay url-encoded.
        let request = if message.attachments.is_empty() {
            request.form(&fields)
        } else {
            request.multipart(multipart_form(&fields, message)?)
        };

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::from_request("mailgun", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Mailgun rejected notification {}: {} - {}", message.notification_id, status, body);
            return Err(DeliveryError::from_status("mailgun", status, &body));
        }

        let parsed: Option<MailgunResponse> = response.json().await.ok();
        debug!("Email notification {} accepted by Mailgun", message.notification_id);

        Ok(DeliveryReceipt {
            provider: "mailgun".to_string(),
            provider_message_id: parsed.and_then(|r| r.id),
        })
    }
}

fn multipart_form(fields: &[(&'static str, &str)], message: &RenderedMessage) -> Result<Form, DeliveryError> {
    let mut form = Form::new();
    for (name, value) in fields {
        form = form.text(*name, value.to_string());
    }

    for attachment in &message.attachments {
        let part = Part::text(attachment.content.clone())
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.content_type)
            .map_err(|e| DeliveryError::Permanent(format!("Invalid attachment {}: {}", attachment.filename, e)))?;
        form = form.part("attachment", part);
    }

    Ok(form)
}
