use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    AuditEntry, FailureUpdate, NotificationFilter, NotificationPreferences, NotificationRequest,
    NotificationStatus, TriggerCode,
};
use crate::services::store::{
    apply_failure, apply_reset, apply_sent, sort_for_delivery, sort_newest_first, NotificationStore,
};

#[derive(Default)]
struct Tables {
    notifications: HashMap<Uuid, NotificationRequest>,
    unique_index: HashMap<String, Uuid>,
    audit: HashMap<Uuid, Vec<AuditEntry>>,
    preferences: HashMap<Uuid, NotificationPreferences>,
}

/// Single-process store. One write lock covers the row and its unique index,
/// so a check-and-insert can never interleave with another insert.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    tables: RwLock<Tables>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.notifications.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn update_if<C, M>(
        &self,
        id: Uuid,
        target: NotificationStatus,
        condition: C,
        mutate: M,
    ) -> Option<NotificationRequest>
    where
        C: FnOnce(&NotificationRequest) -> bool,
        M: FnOnce(&mut NotificationRequest),
    {
        let mut tables = self.tables.write().await;
        let notification = tables.notifications.get_mut(&id)?;
        if !notification.status.can_transition_to(&target) || !condition(notification) {
            debug!("Conditional update skipped for notification {}", id);
            return None;
        }
        mutate(notification);
        Some(notification.clone())
    }
}

fn held_by(notification: &NotificationRequest, worker_id: &str) -> bool {
    notification.status == NotificationStatus::Pending
        && notification.claimed_by.as_deref() == Some(worker_id)
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, notification: &NotificationRequest) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        if let Some(key) = notification.unique_key() {
            if tables.unique_index.contains_key(&key) {
                return Err(StoreError::UniqueViolation { key });
            }
            tables.unique_index.insert(key, notification.id);
        }

        tables.notifications.insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRequest>, StoreError> {
        Ok(self.tables.read().await.notifications.get(&id).cloned())
    }

    async fn find_recent_duplicate(
        &self,
        user_id: Uuid,
        appointment_id: Option<Uuid>,
        trigger_code: TriggerCode,
        since: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let tables = self.tables.read().await;
        let found = tables
            .notifications
            .values()
            .filter(|n| {
                n.user_id == user_id
                    && n.appointment_id == appointment_id
                    && n.trigger_code == trigger_code
                    && n.created_at >= since
                    && matches!(n.status, NotificationStatus::Pending | NotificationStatus::Failed)
            })
            .max_by_key(|n| n.created_at)
            .cloned();
        Ok(found)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        let mut tables = self.tables.write().await;

        let mut due: Vec<NotificationRequest> = tables
            .notifications
            .values()
            .filter(|n| n.is_due(now) && !n.is_claimed(now))
            .cloned()
            .collect();
        sort_for_delivery(&mut due);
        due.truncate(limit);

        for candidate in due.iter_mut() {
            candidate.claimed_by = Some(worker_id.to_string());
            candidate.claimed_until = Some(now + lease);
            tables.notifications.insert(candidate.id, candidate.clone());
        }

        Ok(due)
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(notification) = tables.notifications.get_mut(&id) else {
            return Ok(false);
        };

        let free = notification.status == NotificationStatus::Pending && !notification.is_claimed(now);
        if !held_by(notification, worker_id) && !free {
            return Ok(false);
        }

        notification.claimed_by = Some(worker_id.to_string());
        notification.claimed_until = Some(now + lease);
        Ok(true)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        Ok(self
            .update_if(id, NotificationStatus::Sent, |n| held_by(n, worker_id), |n| apply_sent(n, sent_at))
            .await)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        update: &FailureUpdate,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        Ok(self
            .update_if(id, update.status, |n| held_by(n, worker_id), |n| apply_failure(n, update))
            .await)
    }

    async fn reset_for_retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        Ok(self
            .update_if(
                id,
                NotificationStatus::Pending,
                |n| n.status == NotificationStatus::Failed,
                |n| apply_reset(n, now),
            )
            .await)
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRequest>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<NotificationRequest> = tables
            .notifications
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .audit
            .entry(entry.notification_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn audit_for(&self, notification_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.audit.get(&notification_id).cloned().unwrap_or_default())
    }

    async fn get_preferences(&self, user_id: Uuid) -> Result<Option<NotificationPreferences>, StoreError> {
        Ok(self.tables.read().await.preferences.get(&user_id).cloned())
    }

    async fn upsert_preferences(&self, preferences: &NotificationPreferences) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.preferences.insert(preferences.user_id, preferences.clone());
        Ok(())
    }

    async fn purge_closed_before(
        &self,
        sent_cutoff: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;

        let expired: Vec<(Uuid, Option<String>)> = tables
            .notifications
            .values()
            .filter(|n| match n.status {
                NotificationStatus::Sent => n.sent_at.map_or(false, |t| t < sent_cutoff),
                NotificationStatus::Failed => n.updated_at < failed_cutoff,
                NotificationStatus::Pending => false,
            })
            .map(|n| (n.id, n.unique_key()))
            .collect();

        for (id, key) in &expired {
            tables.notifications.remove(id);
            tables.audit.remove(id);
            if let Some(key) = key {
                tables.unique_index.remove(key);
            }
        }

        Ok(expired.len() as u64)
    }
}
