use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::NotificationError;
use crate::models::{
    AppointmentReminders, AuditEntry, AuditEvent, CycleReport, FailureKind, NotificationFilter,
    NotificationPreferences, NotificationRequest, NotificationStats, NotificationStatus,
    PreferencesUpdate, ProcessorConfig, QueueHealth, ScheduleOutcome, ScheduleRequest,
};
use crate::services::channels::ChannelRegistry;
use crate::services::memory_store::InMemoryNotificationStore;
use crate::services::producer::{NotificationSchedulerService, ReminderOutcome};
use crate::services::queue::RedisNotificationStore;
use crate::services::store::NotificationStore;
use crate::services::templates::TemplateRegistry;
use crate::services::worker::DeliveryProcessorService;

/// Entry point for everything the API and the background loop need.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    scheduler: Arc<NotificationSchedulerService>,
    processor: Arc<DeliveryProcessorService>,
    config: ProcessorConfig,
}

impl NotificationService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        channels: ChannelRegistry,
        templates: TemplateRegistry,
        config: ProcessorConfig,
    ) -> Self {
        let scheduler = Arc::new(NotificationSchedulerService::new(
            Arc::clone(&store),
            config.dedup_window_minutes,
        ));
        let processor = Arc::new(DeliveryProcessorService::new(
            config.clone(),
            Arc::clone(&store),
            Arc::new(channels),
            Arc::new(templates),
        ));

        Self {
            store,
            scheduler,
            processor,
            config,
        }
    }

    /// Picks the store backend and the delivery providers from configuration.
    pub async fn from_config(app_config: &AppConfig) -> Result<Self, NotificationError> {
        let store: Arc<dyn NotificationStore> = match app_config.store_backend.as_str() {
            "memory" => {
                warn!("Using in-memory notification store; queued notifications are lost on restart");
                Arc::new(InMemoryNotificationStore::new())
            }
            "redis" => Arc::new(RedisNotificationStore::new(app_config).await?),
            other => {
                return Err(NotificationError::Configuration(format!(
                    "Unknown notification store backend: {}",
                    other
                )))
            }
        };

        let templates = TemplateRegistry::with_defaults()
            .map_err(|e| NotificationError::Configuration(e.to_string()))?;

        Ok(Self::new(
            store,
            ChannelRegistry::from_config(app_config),
            templates,
            ProcessorConfig::from_app_config(app_config),
        ))
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> Arc<NotificationSchedulerService> {
        Arc::clone(&self.scheduler)
    }

    pub fn processor(&self) -> Arc<DeliveryProcessorService> {
        Arc::clone(&self.processor)
    }

    /// Runs the delivery loop and a queue health monitor until [`shutdown`](Self::shutdown).
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), NotificationError> {
        info!("Starting notification service with processor {}", self.config.worker_id);

        let processor = Arc::clone(&self.processor);
        let processor_handle = tokio::spawn(async move {
            if let Err(e) = processor.start().await {
                error!("Delivery processor failed: {}", e);
            }
        });

        let monitor = Arc::clone(&self.store);
        let config = self.config.clone();
        let monitor_handle = tokio::spawn(async move { monitoring_loop(monitor, config).await });

        if let Err(e) = processor_handle.await {
            error!("Delivery processor task panicked: {}", e);
        }
        monitor_handle.abort();

        info!("Notification service stopped");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.processor.shutdown().await;
    }

    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleOutcome, NotificationError> {
        self.scheduler.schedule(request).await
    }

    pub async fn schedule_appointment_reminders(
        &self,
        reminders: AppointmentReminders,
    ) -> Result<Vec<ReminderOutcome>, NotificationError> {
        self.scheduler.schedule_appointment_reminders(reminders).await
    }

    pub async fn preferences(&self, user_id: Uuid) -> Result<NotificationPreferences, NotificationError> {
        self.scheduler.preferences(user_id).await
    }

    pub async fn update_preferences(
        &self,
        user_id: Uuid,
        update: PreferencesUpdate,
    ) -> Result<NotificationPreferences, NotificationError> {
        self.scheduler.update_preferences(user_id, update).await
    }

    pub async fn get(&self, id: Uuid) -> Result<NotificationRequest, NotificationError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(id.to_string()))
    }

    pub async fn list(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRequest>, NotificationError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn audit(&self, id: Uuid) -> Result<Vec<AuditEntry>, NotificationError> {
        self.get(id).await?;
        Ok(self.store.audit_for(id).await?)
    }

    pub async fn stats(&self) -> Result<NotificationStats, NotificationError> {
        collect_stats(self.store.as_ref(), &self.config).await
    }

    /// Operator reset of a failed notification. Rows that failed permanently
    /// (template or provider rejection) need `force`.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: Uuid, force: bool) -> Result<NotificationRequest, NotificationError> {
        let notification = self.get(id).await?;

        if notification.status != NotificationStatus::Failed {
            return Err(NotificationError::InvalidStatusTransition {
                from: notification.status,
                to: NotificationStatus::Pending,
            });
        }

        if notification.failure_kind == Some(FailureKind::Permanent) && !force {
            return Err(NotificationError::PermanentFailure {
                id: id.to_string(),
                reason: notification
                    .error_message
                    .unwrap_or_else(|| "permanent failure".to_string()),
            });
        }

        let reset = self
            .store
            .reset_for_retry(id, Utc::now())
            .await?
            .ok_or_else(|| NotificationError::ConcurrentUpdate { id: id.to_string() })?;

        info!("Notification {} reset to pending (force={})", id, force);
        let entry = AuditEntry::new(&reset, AuditEvent::Reset, force.then(|| "forced".to_string()));
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!("Failed to record audit entry for notification {}: {}", id, e);
        }

        Ok(reset)
    }

    /// Runs one delivery cycle immediately.
    pub async fn process_now(&self) -> Result<CycleReport, NotificationError> {
        self.processor.run_cycle().await
    }
}

async fn collect_stats(
    store: &dyn NotificationStore,
    config: &ProcessorConfig,
) -> Result<NotificationStats, NotificationError> {
    let all = store.list(&NotificationFilter::default()).await?;
    // A due row older than two poll intervals means the loop is not keeping up.
    let stall_after = chrono::Duration::seconds((config.poll_interval_seconds * 2) as i64);
    Ok(NotificationStats::from_notifications(&all, Utc::now(), config.max_attempts, stall_after))
}

async fn monitoring_loop(store: Arc<dyn NotificationStore>, config: ProcessorConfig) {
    let mut monitor_interval = interval(Duration::from_secs(config.poll_interval_seconds.max(1) * 5));

    loop {
        monitor_interval.tick().await;

        match collect_stats(store.as_ref(), &config).await {
            Ok(stats) => {
                debug!(
                    "Queue health check - pending: {}, overdue: {}, sent: {}, failed: {}",
                    stats.pending, stats.overdue, stats.sent, stats.failed
                );
                if !matches!(stats.queue_health, QueueHealth::Healthy) {
                    warn!("Notification queue health: {:?}", stats.queue_health);
                }
            }
            Err(e) => error!("Failed to collect queue stats: {}", e),
        }
    }
}
