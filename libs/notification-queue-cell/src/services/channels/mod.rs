//! Delivery channel adapters.
//!
//! Each adapter turns a [`RenderedMessage`] into one provider call and reports
//! whether a failure is worth retrying.

mod email;
mod push;
mod sms;

pub use email::{MailgunChannel, MailgunConfig};
pub use push::{PushGatewayChannel, PushGatewayConfig};
pub use sms::{TwilioChannel, TwilioConfig};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use shared_config::AppConfig;

use crate::models::{ChannelKind, FailureKind};
use crate::services::templates::RenderedMessage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Transient delivery failure: {0}")]
    Transient(String),

    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::Transient(_) => FailureKind::Transient,
            DeliveryError::Permanent(_) => FailureKind::Permanent,
        }
    }

    /// 5xx and 429 are retried; any other non-success status is not.
    pub fn from_status(provider: &str, status: StatusCode, body: &str) -> Self {
        let message = format!("{} responded {}: {}", provider, status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            DeliveryError::Transient(message)
        } else {
            DeliveryError::Permanent(message)
        }
    }

    pub fn from_request(provider: &str, error: reqwest::Error) -> Self {
        let message = format!("{} request failed: {}", provider, error);
        if error.is_builder() {
            DeliveryError::Permanent(message)
        } else {
            DeliveryError::Transient(message)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    pub provider: String,
    pub provider_message_id: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn provider(&self) -> &'static str;

    async fn deliver(&self, message: &RenderedMessage) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Dry-run adapter used when a provider has no credentials.
pub struct LoggingChannel {
    kind: ChannelKind,
}

impl LoggingChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl DeliveryChannel for LoggingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn provider(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, message: &RenderedMessage) -> Result<DeliveryReceipt, DeliveryError> {
        info!(
            "[dry-run] {} to {}: {} | {}",
            self.kind, message.recipient, message.subject, message.body
        );
        Ok(DeliveryReceipt {
            provider: "log".to_string(),
            provider_message_id: None,
        })
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Arc<dyn DeliveryChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Real providers where credentials are present, dry-run logging elsewhere.
    pub fn from_config(config: &AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.notification_delivery_timeout_seconds))
            .build()
            .unwrap_or_default();

        let mut registry = Self::new();

        if config.is_email_configured() {
            registry.register(Arc::new(MailgunChannel::new(MailgunConfig::from_app_config(config), client.clone())));
        } else {
            warn!("Mailgun is not configured, email notifications will only be logged");
            registry.register(Arc::new(LoggingChannel::new(ChannelKind::Email)));
        }

        if config.is_sms_configured() {
            registry.register(Arc::new(TwilioChannel::new(TwilioConfig::from_app_config(config), client.clone())));
        } else {
            warn!("Twilio is not configured, SMS notifications will only be logged");
            registry.register(Arc::new(LoggingChannel::new(ChannelKind::Sms)));
        }

        if config.is_push_configured() {
            registry.register(Arc::new(PushGatewayChannel::new(PushGatewayConfig::from_app_config(config), client)));
        } else {
            warn!("Push gateway is not configured, push notifications will only be logged");
            registry.register(Arc::new(LoggingChannel::new(ChannelKind::Push)));
        }

        registry
    }

    /// Replaces any adapter already registered for the same kind.
    pub fn register(&mut self, channel: Arc<dyn DeliveryChannel>) {
        self.channels.insert(channel.kind(), channel);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn DeliveryChannel>> {
        self.channels.get(&kind).cloned()
    }
}
