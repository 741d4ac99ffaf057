//! Storage seam for the notification queue.
//!
//! Every status change goes through a conditional update: the row must still be
//! `pending` (or `failed` for an operator reset) and, for processor updates, still
//! be leased by the calling worker. A `None` return means the condition did not
//! hold and nothing was written. Writes that `NotificationStatus::can_transition_to`
//! rejects are never applied.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AuditEntry, FailureUpdate, NotificationFilter, NotificationPreferences, NotificationRequest,
    TriggerCode,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Fails with [`StoreError::UniqueViolation`] when a row with the same
    /// (appointment, trigger, user) key already exists.
    async fn insert(&self, notification: &NotificationRequest) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRequest>, StoreError>;

    /// Most recent pending or failed row for the same user/appointment/trigger created at or after `since`.
    async fn find_recent_duplicate(
        &self,
        user_id: Uuid,
        appointment_id: Option<Uuid>,
        trigger_code: TriggerCode,
        since: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError>;

    /// Lease up to `limit` due pending rows to `worker_id`, highest priority first.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<NotificationRequest>, StoreError>;

    /// Push the lease on a pending row out to `now + lease`. Succeeds when the caller
    /// still holds it, or when it lapsed and nobody else took it.
    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    async fn mark_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError>;

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        update: &FailureUpdate,
    ) -> Result<Option<NotificationRequest>, StoreError>;

    /// Failed → pending with a fresh attempt budget.
    async fn reset_for_retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRequest>, StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    async fn audit_for(&self, notification_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;

    async fn get_preferences(&self, user_id: Uuid) -> Result<Option<NotificationPreferences>, StoreError>;

    async fn upsert_preferences(&self, preferences: &NotificationPreferences) -> Result<(), StoreError>;

    /// Drop rows sent before `sent_cutoff` and rows that failed for good before
    /// `failed_cutoff`, with their audit trail. Returns the number removed.
    async fn purge_closed_before(
        &self,
        sent_cutoff: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Delivery order inside a batch: priority desc, then oldest schedule first.
pub fn sort_for_delivery(notifications: &mut [NotificationRequest]) {
    notifications.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.scheduled_for.cmp(&b.scheduled_for))
            .then(a.created_at.cmp(&b.created_at))
    });
}

pub fn sort_newest_first(notifications: &mut [NotificationRequest]) {
    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

pub(crate) fn apply_failure(notification: &mut NotificationRequest, update: &FailureUpdate) {
    notification.status = update.status;
    notification.retry_count = update.retry_count;
    notification.failure_kind = Some(update.failure_kind);
    notification.error_message = Some(update.error_message.clone());
    notification.scheduled_for = update.next_attempt_at;
    notification.updated_at = Utc::now();
    notification.release_claim();
}

pub(crate) fn apply_reset(notification: &mut NotificationRequest, now: DateTime<Utc>) {
    notification.status = crate::models::NotificationStatus::Pending;
    notification.retry_count = 0;
    notification.error_message = None;
    notification.failure_kind = None;
    notification.scheduled_for = now;
    notification.updated_at = now;
    notification.release_claim();
}

pub(crate) fn apply_sent(notification: &mut NotificationRequest, sent_at: DateTime<Utc>) {
    notification.status = crate::models::NotificationStatus::Sent;
    notification.sent_at = Some(sent_at);
    notification.error_message = None;
    notification.updated_at = sent_at;
    notification.release_claim();
}
