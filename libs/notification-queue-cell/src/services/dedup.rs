use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{NotificationRequest, TriggerCode};
use crate::services::store::NotificationStore;

/// Suppresses a trigger that already produced a pending or failed row within the
/// trailing window. The store's uniqueness key still backs this up under races.
pub struct DeduplicationGuard {
    store: Arc<dyn NotificationStore>,
    window: Duration,
}

impl DeduplicationGuard {
    pub fn new(store: Arc<dyn NotificationStore>, window_minutes: i64) -> Self {
        Self {
            store,
            window: Duration::minutes(window_minutes),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    #[instrument(skip(self))]
    pub async fn find_duplicate(
        &self,
        user_id: Uuid,
        appointment_id: Option<Uuid>,
        trigger_code: TriggerCode,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let since = Utc::now() - self.window;
        let existing = self
            .store
            .find_recent_duplicate(user_id, appointment_id, trigger_code, since)
            .await?;

        if let Some(existing) = &existing {
            debug!(
                "Found {} notification {} for {} created at {}",
                existing.status, existing.id, trigger_code, existing.created_at
            );
        }

        Ok(existing)
    }

    pub async fn is_duplicate(
        &self,
        user_id: Uuid,
        appointment_id: Option<Uuid>,
        trigger_code: TriggerCode,
    ) -> Result<bool, StoreError> {
        Ok(self
            .find_duplicate(user_id, appointment_id, trigger_code)
            .await?
            .is_some())
    }
}
