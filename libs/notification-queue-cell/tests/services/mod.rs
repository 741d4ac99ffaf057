use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use serde_json::{json, Value};
use tokio::time::Duration;
use uuid::Uuid;

use notification_queue_cell::*;
use shared_config::AppConfig;
use shared_utils::test_utils::TestConfig;

/// Redis-backed tests only run when REDIS_TEST_URL points at a disposable instance.
pub struct RedisTestUtils {
    pub pool: Pool,
    pub redis_url: String,
    pub test_prefix: String,
}

impl RedisTestUtils {
    pub async fn new() -> Option<Self> {
        let redis_url = std::env::var("REDIS_TEST_URL").ok()?;

        let cfg = Config::from_url(redis_url.clone());
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).ok()?;

        let mut conn = pool.get().await.ok()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.ok()?;

        let test_prefix = format!("test_{}:", Uuid::new_v4().simple());

        Some(Self {
            pool,
            redis_url,
            test_prefix,
        })
    }

    pub fn create_test_config(&self) -> AppConfig {
        AppConfig {
            redis_url: Some(self.redis_url.clone()),
            store_backend: "redis".to_string(),
            ..TestConfig::default().to_app_config()
        }
    }

    pub async fn store(&self) -> RedisNotificationStore {
        RedisNotificationStore::with_prefix(&self.create_test_config(), &self.test_prefix)
            .await
            .expect("Failed to create Redis notification store")
    }

    pub async fn cleanup(&self) {
        let mut conn = self.pool.get().await.expect("Failed to get Redis connection");
        let keys: Vec<String> = conn
            .keys(format!("{}*", self.test_prefix))
            .await
            .expect("Failed to list test keys");

        if !keys.is_empty() {
            let _: () = conn.del(keys).await.expect("Failed to delete test keys");
        }
    }
}

/// What a [`ScriptedChannel`] does on its next delivery.
#[derive(Clone)]
pub enum Step {
    Accept,
    Fail(DeliveryError),
    Hang(Duration),
}

/// Channel that replays a script and records every message it was asked to send.
/// Once the script runs out it accepts everything.
pub struct ScriptedChannel {
    kind: ChannelKind,
    script: Mutex<VecDeque<Step>>,
    delivered: Mutex<Vec<RenderedMessage>>,
}

impl ScriptedChannel {
    pub fn new(kind: ChannelKind, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(script.into()),
            delivered: Mutex::new(Vec::new()),
        })
    }

    pub fn accepting(kind: ChannelKind) -> Arc<Self> {
        Self::new(kind, Vec::new())
    }

    pub fn delivered(&self) -> Vec<RenderedMessage> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn provider(&self) -> &'static str {
        "scripted"
    }

    async fn deliver(&self, message: &RenderedMessage) -> Result<DeliveryReceipt, DeliveryError> {
        self.delivered.lock().unwrap().push(message.clone());
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);

        match step {
            Step::Accept => Ok(DeliveryReceipt {
                provider: "scripted".to_string(),
                provider_message_id: Some(format!("msg-{}", message.notification_id)),
            }),
            Step::Fail(error) => Err(error),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(DeliveryReceipt {
                    provider: "scripted".to_string(),
                    provider_message_id: None,
                })
            }
        }
    }
}

pub fn test_processor_config() -> ProcessorConfig {
    ProcessorConfig {
        worker_id: format!("test-worker-{}", Uuid::new_v4().simple()),
        retry_backoff_seconds: 0,
        delivery_timeout_seconds: 2,
        ..ProcessorConfig::default()
    }
}

/// In-memory service wired to the given channels (logging adapters for the rest).
pub fn memory_service(
    store: Arc<InMemoryNotificationStore>,
    channels: &[Arc<ScriptedChannel>],
) -> NotificationService {
    let mut registry = ChannelRegistry::from_config(&TestConfig::default().to_app_config());
    for channel in channels {
        registry.register(channel.clone());
    }

    NotificationService::new(
        store,
        registry,
        TemplateRegistry::with_defaults().expect("default templates"),
        test_processor_config(),
    )
}

pub fn full_contact() -> ContactDetails {
    ContactDetails {
        email: Some("patient@example.com".to_string()),
        phone: Some("+33600000000".to_string()),
        push_token: Some("push-token-abc".to_string()),
    }
}

pub fn booking_merge_data() -> Value {
    json!({
        "patient_first_name": "Ana",
        "patient_name": "Ana Lopez",
        "doctor_name": "Dr. Martin",
        "appointment_datetime_local": "22/01/2026 10:00",
        "join_link": "https://clinic.example/join/abc",
        "short_link": "https://clinic.example/j/abc",
        "new_appointment_datetime_local": "23/01/2026 11:00",
        "appointment_id": "195",
        "first_name": "Ana"
    })
}

pub fn booking_request(user_id: Uuid, appointment_id: Option<Uuid>) -> ScheduleRequest {
    let mut request = ScheduleRequest::new(user_id, appointment_id, TriggerCode::BookConf, full_contact());
    request.merge_data = Some(booking_merge_data());
    request
}

pub async fn enable_all_channels(service: &NotificationService, user_id: Uuid) {
    service
        .update_preferences(
            user_id,
            PreferencesUpdate {
                email_enabled: Some(true),
                sms_enabled: Some(true),
                push_enabled: Some(true),
                locale: None,
                ..PreferencesUpdate::default()
            },
        )
        .await
        .expect("Failed to update preferences");
}

mod dedup_test;
mod producer_test;
mod queue_test;
