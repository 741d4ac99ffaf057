use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{NotificationError, StoreError};
use crate::models::{
    AppointmentReminders, AuditEntry, AuditEvent, NotificationPreferences, NotificationRequest,
    Participant, PreferencesUpdate, ScheduleOutcome, ScheduleRequest, TriggerCode,
};
use crate::services::dedup::DeduplicationGuard;
use crate::services::store::NotificationStore;

/// One reminder of an appointment. `outcome` is `None` when its send time had already passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderOutcome {
    pub trigger_code: TriggerCode,
    pub user_id: Uuid,
    pub send_at: DateTime<Utc>,
    pub outcome: Option<ScheduleOutcome>,
}

pub struct NotificationSchedulerService {
    store: Arc<dyn NotificationStore>,
    dedup: DeduplicationGuard,
}

impl NotificationSchedulerService {
    pub fn new(store: Arc<dyn NotificationStore>, dedup_window_minutes: i64) -> Self {
        let dedup = DeduplicationGuard::new(Arc::clone(&store), dedup_window_minutes);
        Self { store, dedup }
    }

    #[instrument(skip(self, request), fields(user_id = %request.user_id, trigger = %request.trigger_code))]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduleOutcome, NotificationError> {
        let merge_data = object_or_empty("merge_data", request.merge_data)?;
        let metadata = object_or_empty("metadata", request.metadata)?;

        let preferences = self.preferences(request.user_id).await?;
        let channel = request.trigger_code.channel();

        if !preferences.allows(channel) {
            info!("{} disabled for user {}, {} not scheduled", channel, request.user_id, request.trigger_code);
            return Ok(ScheduleOutcome::ChannelDisabled { channel });
        }

        if request.trigger_code.is_appointment_reminder() && !preferences.appointment_reminders_enabled {
            info!("Appointment reminders disabled for user {}, {} not scheduled", request.user_id, request.trigger_code);
            return Ok(ScheduleOutcome::RemindersDisabled);
        }

        let Some(recipient) = request.contact.address_for(channel) else {
            warn!("No {} address for user {}, {} not scheduled", channel, request.user_id, request.trigger_code);
            return Ok(ScheduleOutcome::NoRecipient { channel });
        };

        if let Some(existing) = self
            .dedup
            .find_duplicate(request.user_id, request.appointment_id, request.trigger_code)
            .await?
        {
            info!(
                "Suppressed duplicate {} for user {}: notification {} is {}",
                request.trigger_code, request.user_id, existing.id, existing.status
            );
            self.audit(&existing, AuditEvent::Suppressed, Some("duplicate trigger inside dedup window".to_string()))
                .await;
            return Ok(ScheduleOutcome::Suppressed {
                existing_id: existing.id,
                existing_status: existing.status,
            });
        }

        let requested_at = request.scheduled_for.unwrap_or_else(Utc::now);
        let send_at = if request.trigger_code.respects_quiet_hours() {
            preferences.next_send_time(requested_at)
        } else {
            requested_at
        };
        if send_at != requested_at {
            debug!("{} for user {} deferred to {} by quiet hours", request.trigger_code, request.user_id, send_at);
        }

        let notification = NotificationRequest::new(
            request.user_id,
            request.appointment_id,
            request.trigger_code,
            recipient.to_string(),
            send_at,
        )
        .with_merge_data(merge_data)
        .with_metadata(metadata);

        match self.store.insert(&notification).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation { key }) => {
                info!("Notification {} already scheduled, insert skipped", key);
                return Ok(ScheduleOutcome::AlreadyScheduled);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Scheduled {} notification {} for user {} at {}",
            notification.trigger_code, notification.id, notification.user_id, notification.scheduled_for
        );
        self.audit(&notification, AuditEvent::Scheduled, None).await;

        Ok(ScheduleOutcome::Scheduled { notification })
    }

    /// 24h patient reminder, 1h doctor reminder and 5m patient reminder.
    #[instrument(skip(self, reminders), fields(appointment_id = %reminders.appointment_id))]
    pub async fn schedule_appointment_reminders(
        &self,
        reminders: AppointmentReminders,
    ) -> Result<Vec<ReminderOutcome>, NotificationError> {
        let now = Utc::now();
        let at = reminders.appointment_time;

        let mut plan: Vec<(TriggerCode, &Participant, DateTime<Utc>)> = vec![
            (TriggerCode::Rem24h, &reminders.patient, at - Duration::hours(24)),
        ];
        if let Some(doctor) = &reminders.doctor {
            plan.push((TriggerCode::Rem1hDoc, doctor, at - Duration::hours(1)));
        }
        plan.push((TriggerCode::Rem5mPat, &reminders.patient, at - Duration::minutes(5)));

        let mut outcomes = Vec::with_capacity(plan.len());
        for (trigger_code, participant, send_at) in plan {
            if send_at <= now {
                debug!("{} for appointment {} skipped, send time {} has passed", trigger_code, reminders.appointment_id, send_at);
                outcomes.push(ReminderOutcome {
                    trigger_code,
                    user_id: participant.user_id,
                    send_at,
                    outcome: None,
                });
                continue;
            }

            let mut request = ScheduleRequest::new(
                participant.user_id,
                Some(reminders.appointment_id),
                trigger_code,
                participant.contact.clone(),
            );
            request.scheduled_for = Some(send_at);
            request.merge_data = reminders.merge_data.clone();

            let outcome = self.schedule(request).await?;
            outcomes.push(ReminderOutcome {
                trigger_code,
                user_id: participant.user_id,
                send_at,
                outcome: Some(outcome),
            });
        }

        Ok(outcomes)
    }

    /// Stored preferences, creating the default row on first use.
    pub async fn preferences(&self, user_id: Uuid) -> Result<NotificationPreferences, NotificationError> {
        if let Some(preferences) = self.store.get_preferences(user_id).await? {
            return Ok(preferences);
        }

        let preferences = NotificationPreferences::default_for(user_id);
        self.store.upsert_preferences(&preferences).await?;
        debug!("Created default notification preferences for user {}", user_id);
        Ok(preferences)
    }

    pub async fn update_preferences(
        &self,
        user_id: Uuid,
        update: PreferencesUpdate,
    ) -> Result<NotificationPreferences, NotificationError> {
        let mut preferences = self.preferences(user_id).await?;

        if let Some(enabled) = update.email_enabled {
            preferences.email_enabled = enabled;
        }
        if let Some(enabled) = update.sms_enabled {
            preferences.sms_enabled = enabled;
        }
        if let Some(enabled) = update.push_enabled {
            preferences.push_enabled = enabled;
        }
        if let Some(enabled) = update.appointment_reminders_enabled {
            preferences.appointment_reminders_enabled = enabled;
        }
        if let Some(quiet_hours) = update.quiet_hours {
            preferences.quiet_hours = (quiet_hours.start != quiet_hours.end).then_some(quiet_hours);
        }
        if let Some(timezone) = update.timezone {
            let timezone = timezone.trim();
            if timezone.parse::<Tz>().is_err() {
                return Err(NotificationError::ValidationError(format!("unknown timezone: {}", timezone)));
            }
            preferences.timezone = timezone.to_string();
        }
        if let Some(locale) = update.locale {
            if locale.trim().is_empty() {
                return Err(NotificationError::ValidationError("locale must not be empty".to_string()));
            }
            preferences.locale = locale.trim().to_string();
        }
        preferences.updated_at = Utc::now();

        self.store.upsert_preferences(&preferences).await?;
        info!("Updated notification preferences for user {}", user_id);
        Ok(preferences)
    }

    async fn audit(&self, notification: &NotificationRequest, event: AuditEvent, detail: Option<String>) {
        let entry = AuditEntry::new(notification, event, detail);
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!("Failed to record audit entry for notification {}: {}", notification.id, e);
        }
    }
}

fn object_or_empty(field: &str, value: Option<Value>) -> Result<Value, NotificationError> {
    match value {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(NotificationError::ValidationError(format!("{} must be a JSON object", field))),
    }
}
