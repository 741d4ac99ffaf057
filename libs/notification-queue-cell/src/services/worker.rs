use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::NotificationError;
use crate::models::{
    AuditEntry, AuditEvent, CycleReport, FailureKind, FailureUpdate, NotificationRequest,
    NotificationStatus, ProcessorConfig,
};
use crate::services::channels::{ChannelRegistry, DeliveryError};
use crate::services::store::NotificationStore;
use crate::services::templates::TemplateRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Sent,
    Retried,
    Failed,
    /// Lease expired or the row changed under us; nothing written.
    Lost,
}

/// Clears the processing flag however the cycle ends, including when its future is dropped.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DeliveryProcessorService {
    config: ProcessorConfig,
    store: Arc<dyn NotificationStore>,
    channels: Arc<ChannelRegistry>,
    templates: Arc<TemplateRegistry>,
    is_processing: AtomicBool,
    is_shutdown: tokio::sync::RwLock<bool>,
}

impl DeliveryProcessorService {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<dyn NotificationStore>,
        channels: Arc<ChannelRegistry>,
        templates: Arc<TemplateRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            channels,
            templates,
            is_processing: AtomicBool::new(false),
            is_shutdown: tokio::sync::RwLock::new(false),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    /// Poll loop: one delivery cycle per tick plus periodic purge of old closed rows.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), NotificationError> {
        info!(
            "Starting delivery processor {} (every {}s, batch {})",
            self.config.worker_id, self.config.poll_interval_seconds, self.config.batch_size
        );

        let mut poll = interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = interval(Duration::from_secs(self.config.cleanup_interval_seconds.max(1)));
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.wait_for_shutdown() => {
                    info!("Shutdown signal received, stopping processor {}", self.config.worker_id);
                    break;
                }
                _ = poll.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                "Cycle done: claimed={}, sent={}, retried={}, failed={}",
                                report.claimed, report.sent, report.retried, report.failed
                            );
                        }
                        Ok(_) => debug!("No due notifications"),
                        Err(e) => error!("Delivery cycle failed: {}", e),
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup().await {
                        warn!("Failed to purge closed notifications: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Initiating shutdown for processor {}", self.config.worker_id);
        let mut is_shutdown = self.is_shutdown.write().await;
        *is_shutdown = true;
    }

    /// One pass over due notifications. Returns a skipped report if a pass is already running.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_cycle(&self) -> Result<CycleReport, NotificationError> {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            debug!("Previous delivery cycle still running, skipping");
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::default()
            });
        }

        let _guard = CycleGuard(&self.is_processing);
        self.process_batch().await
    }

    /// Drop sent and failed rows past their retention periods.
    pub async fn cleanup(&self) -> Result<u64, NotificationError> {
        let now = Utc::now();
        let sent_cutoff = now - chrono::Duration::days(self.config.sent_retention_days);
        let failed_cutoff = now - chrono::Duration::days(self.config.failed_retention_days);
        Ok(self.store.purge_closed_before(sent_cutoff, failed_cutoff).await?)
    }

    async fn process_batch(&self) -> Result<CycleReport, NotificationError> {
        let claimed = self
            .store
            .claim_due(Utc::now(), self.config.batch_size, &self.config.worker_id, self.config.lease_duration())
            .await?;

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..CycleReport::default()
        };

        for notification in claimed {
            let id = notification.id;
            match self.process_one(notification).await {
                Ok(AttemptOutcome::Sent) => report.sent += 1,
                Ok(AttemptOutcome::Retried) => report.retried += 1,
                Ok(AttemptOutcome::Failed) => report.failed += 1,
                Ok(AttemptOutcome::Lost) => {}
                Err(e) => error!("Failed to process notification {}: {}", id, e),
            }
        }

        Ok(report)
    }

    #[instrument(skip(self, notification), fields(notification_id = %notification.id, trigger = %notification.trigger_code))]
    async fn process_one(&self, notification: NotificationRequest) -> Result<AttemptOutcome, NotificationError> {
        // Exhausted rows are closed out without another send.
        if notification.retry_count >= self.config.max_attempts {
            warn!(
                "Notification {} already has {} attempts, failing without delivery",
                notification.id, notification.retry_count
            );
            let update = FailureUpdate {
                status: NotificationStatus::Failed,
                retry_count: notification.retry_count,
                failure_kind: notification.failure_kind.unwrap_or(FailureKind::Transient),
                error_message: notification
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "retry limit reached".to_string()),
                next_attempt_at: notification.scheduled_for,
            };
            return self.write_failure(&notification, update).await;
        }

        let message = match self.templates.render(&notification) {
            Ok(message) => message,
            Err(e) => {
                return self
                    .handle_failure(&notification, DeliveryError::Permanent(e.to_string()))
                    .await;
            }
        };

        let Some(channel) = self.channels.get(notification.channel) else {
            let error = DeliveryError::Permanent(format!("No delivery channel for {}", notification.channel));
            return self.handle_failure(&notification, error).await;
        };

        // The batch lease was taken before earlier rows were delivered; extend it for this send.
        let renewed = self
            .store
            .renew_lease(notification.id, &self.config.worker_id, Utc::now(), self.config.lease_duration())
            .await?;
        if !renewed {
            warn!("Lease on notification {} lost before delivery, leaving it to its holder", notification.id);
            return Ok(AttemptOutcome::Lost);
        }

        let deadline = Duration::from_secs(self.config.delivery_timeout_seconds);
        let delivery = match timeout(deadline, channel.deliver(&message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transient(format!(
                "{} delivery timed out after {}s",
                channel.provider(),
                self.config.delivery_timeout_seconds
            ))),
        };

        match delivery {
            Ok(receipt) => {
                let sent = self
                    .store
                    .mark_sent(notification.id, &self.config.worker_id, Utc::now())
                    .await?;

                let Some(sent) = sent else {
                    warn!("Lease on notification {} lost before it could be marked sent", notification.id);
                    return Ok(AttemptOutcome::Lost);
                };

                info!("Notification {} sent via {}", sent.id, receipt.provider);
                let detail = match receipt.provider_message_id {
                    Some(message_id) => format!("{} accepted as {}", receipt.provider, message_id),
                    None => format!("{} accepted", receipt.provider),
                };
                self.audit(&sent, AuditEvent::Sent, Some(detail)).await;
                Ok(AttemptOutcome::Sent)
            }
            Err(e) => self.handle_failure(&notification, e).await,
        }
    }

    async fn handle_failure(
        &self,
        notification: &NotificationRequest,
        error: DeliveryError,
    ) -> Result<AttemptOutcome, NotificationError> {
        let retry_count = notification.retry_count + 1;
        let failure_kind = error.kind();
        let exhausted = failure_kind == FailureKind::Permanent || retry_count >= self.config.max_attempts;

        let backoff = chrono::Duration::seconds((self.config.retry_backoff_seconds * retry_count as u64) as i64);
        let update = FailureUpdate {
            status: if exhausted { NotificationStatus::Failed } else { NotificationStatus::Pending },
            retry_count,
            failure_kind,
            error_message: error.to_string(),
            next_attempt_at: if exhausted { notification.scheduled_for } else { Utc::now() + backoff },
        };

        if exhausted {
            error!("Notification {} failed after {} attempt(s): {}", notification.id, retry_count, error);
        } else {
            warn!(
                "Notification {} attempt {}/{} failed, retrying at {}: {}",
                notification.id, retry_count, self.config.max_attempts, update.next_attempt_at, error
            );
        }

        self.write_failure(notification, update).await
    }

    async fn write_failure(
        &self,
        notification: &NotificationRequest,
        update: FailureUpdate,
    ) -> Result<AttemptOutcome, NotificationError> {
        let written = self
            .store
            .record_failure(notification.id, &self.config.worker_id, &update)
            .await?;

        let Some(updated) = written else {
            warn!("Lease on notification {} lost before failure could be recorded", notification.id);
            return Ok(AttemptOutcome::Lost);
        };

        if updated.status == NotificationStatus::Failed {
            self.audit(&updated, AuditEvent::Failed, Some(update.error_message)).await;
            Ok(AttemptOutcome::Failed)
        } else {
            self.audit(&updated, AuditEvent::AttemptFailed, Some(update.error_message)).await;
            Ok(AttemptOutcome::Retried)
        }
    }

    async fn audit(&self, notification: &NotificationRequest, event: AuditEvent, detail: Option<String>) {
        let entry = AuditEntry::new(notification, event, detail);
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!("Failed to record audit entry for notification {}: {}", notification.id, e);
        }
    }

    async fn wait_for_shutdown(&self) {
        loop {
            if *self.is_shutdown.read().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
