use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use shared_config::AppConfig;

/// Event that caused a notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerCode {
    BookConf,
    #[serde(rename = "REM_24H")]
    Rem24h,
    #[serde(rename = "REM_1H_DOC")]
    Rem1hDoc,
    #[serde(rename = "REM_10M_DOC")]
    Rem10mDoc,
    #[serde(rename = "REM_5M_PAT")]
    Rem5mPat,
    Resched,
    Cancel,
    Survey,
    NoShow,
    FreeCredit,
    ProfileNeeded,
}

impl TriggerCode {
    pub const ALL: [TriggerCode; 11] = [
        TriggerCode::BookConf,
        TriggerCode::Rem24h,
        TriggerCode::Rem1hDoc,
        TriggerCode::Rem10mDoc,
        TriggerCode::Rem5mPat,
        TriggerCode::Resched,
        TriggerCode::Cancel,
        TriggerCode::Survey,
        TriggerCode::NoShow,
        TriggerCode::FreeCredit,
        TriggerCode::ProfileNeeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCode::BookConf => "BOOK_CONF",
            TriggerCode::Rem24h => "REM_24H",
            TriggerCode::Rem1hDoc => "REM_1H_DOC",
            TriggerCode::Rem10mDoc => "REM_10M_DOC",
            TriggerCode::Rem5mPat => "REM_5M_PAT",
            TriggerCode::Resched => "RESCHED",
            TriggerCode::Cancel => "CANCEL",
            TriggerCode::Survey => "SURVEY",
            TriggerCode::NoShow => "NO_SHOW",
            TriggerCode::FreeCredit => "FREE_CREDIT",
            TriggerCode::ProfileNeeded => "PROFILE_NEEDED",
        }
    }

    /// Higher sends first within a processing batch.
    pub fn priority(&self) -> i32 {
        match self {
            TriggerCode::Survey => 100,
            TriggerCode::BookConf => 90,
            TriggerCode::Rem24h => 80,
            TriggerCode::Rem1hDoc => 70,
            TriggerCode::Rem10mDoc => 60,
            TriggerCode::Rem5mPat => 50,
            TriggerCode::Resched => 40,
            TriggerCode::Cancel => 30,
            TriggerCode::NoShow => 20,
            TriggerCode::FreeCredit => 10,
            TriggerCode::ProfileNeeded => 5,
        }
    }

    pub fn template_key(&self) -> &'static str {
        match self {
            TriggerCode::BookConf => "booking_confirmation",
            TriggerCode::Rem24h => "booking_reminder_24h",
            TriggerCode::Rem1hDoc => "doctor_upcoming_1h",
            TriggerCode::Rem10mDoc => "sms_doctor_10m",
            TriggerCode::Rem5mPat => "push_patient_5m",
            TriggerCode::Resched => "reschedule_confirmation",
            TriggerCode::Cancel => "cancellation_confirmation",
            TriggerCode::Survey => "post_call_survey",
            TriggerCode::NoShow => "doctor_no_show_patient",
            TriggerCode::FreeCredit => "welcome_free_credit",
            TriggerCode::ProfileNeeded => "profile_reminder",
        }
    }

    pub fn channel(&self) -> ChannelKind {
        match self {
            TriggerCode::Rem1hDoc | TriggerCode::Rem5mPat => ChannelKind::Push,
            TriggerCode::Rem10mDoc => ChannelKind::Sms,
            _ => ChannelKind::Email,
        }
    }

    pub fn is_appointment_reminder(&self) -> bool {
        matches!(
            self,
            TriggerCode::Rem24h | TriggerCode::Rem1hDoc | TriggerCode::Rem10mDoc | TriggerCode::Rem5mPat
        )
    }

    /// Non-urgent sends wait for the end of the recipient's quiet hours. Confirmations
    /// and the short-notice reminders go out regardless.
    pub fn respects_quiet_hours(&self) -> bool {
        matches!(
            self,
            TriggerCode::Rem24h | TriggerCode::Survey | TriggerCode::FreeCredit | TriggerCode::ProfileNeeded
        )
    }
}

impl fmt::Display for TriggerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown trigger code: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Sms,
    Push,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Sms => "sms",
            ChannelKind::Push => "push",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, target: &NotificationStatus) -> bool {
        use NotificationStatus::*;
        match (self, target) {
            (Pending, Sent) => true,
            (Pending, Failed) => true,
            // retry bump keeps the row pending
            (Pending, Pending) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(NotificationStatus::Pending),
            "sent" => Ok(NotificationStatus::Sent),
            "failed" => Ok(NotificationStatus::Failed),
            other => Err(format!("Unknown notification status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub trigger_code: TriggerCode,
    pub channel: ChannelKind,
    pub recipient: String,
    pub template_key: String,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub merge_data: Value,
    pub metadata: Value,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl NotificationRequest {
    pub fn new(
        user_id: Uuid,
        appointment_id: Option<Uuid>,
        trigger_code: TriggerCode,
        recipient: String,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            appointment_id,
            trigger_code,
            channel: trigger_code.channel(),
            recipient,
            template_key: trigger_code.template_key().to_string(),
            priority: trigger_code.priority(),
            scheduled_for,
            status: NotificationStatus::Pending,
            retry_count: 0,
            error_message: None,
            failure_kind: None,
            merge_data: Value::Object(Default::default()),
            metadata: Value::Object(Default::default()),
            claimed_by: None,
            claimed_until: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        }
    }

    pub fn with_merge_data(mut self, merge_data: Value) -> Self {
        self.merge_data = merge_data;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Key of the partial uniqueness constraint; `None` when no appointment is attached.
    pub fn unique_key(&self) -> Option<String> {
        self.appointment_id
            .map(|appointment_id| unique_key(appointment_id, self.trigger_code, self.user_id))
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Pending && self.scheduled_for <= now
    }

    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.claimed_until, Some(until) if until > now)
    }

    pub fn is_permanently_failed(&self, max_attempts: u32) -> bool {
        self.status == NotificationStatus::Failed
            && (self.failure_kind == Some(FailureKind::Permanent) || self.retry_count >= max_attempts)
    }

    pub fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }
}

pub fn unique_key(appointment_id: Uuid, trigger_code: TriggerCode, user_id: Uuid) -> String {
    format!("{}:{}:{}", appointment_id, trigger_code.as_str(), user_id)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactDetails {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
}

impl ContactDetails {
    pub fn address_for(&self, channel: ChannelKind) -> Option<&str> {
        let address = match channel {
            ChannelKind::Email => self.email.as_deref(),
            ChannelKind::Sms => self.phone.as_deref(),
            ChannelKind::Push => self.push_token.as_deref(),
        };
        address.map(str::trim).filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub user_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub trigger_code: TriggerCode,
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub contact: ContactDetails,
    #[serde(default)]
    pub merge_data: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ScheduleRequest {
    pub fn new(user_id: Uuid, appointment_id: Option<Uuid>, trigger_code: TriggerCode, contact: ContactDetails) -> Self {
        Self {
            user_id,
            appointment_id,
            trigger_code,
            scheduled_for: None,
            contact,
            merge_data: None,
            metadata: None,
        }
    }
}

/// What happened to a schedule call. None of these are errors for the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled { notification: NotificationRequest },
    Suppressed { existing_id: Uuid, existing_status: NotificationStatus },
    AlreadyScheduled,
    ChannelDisabled { channel: ChannelKind },
    NoRecipient { channel: ChannelKind },
    RemindersDisabled,
}

impl ScheduleOutcome {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, ScheduleOutcome::Scheduled { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: Uuid,
    #[serde(default)]
    pub contact: ContactDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentReminders {
    /// Taken from the route when scheduled over HTTP.
    #[serde(default)]
    pub appointment_id: Uuid,
    pub appointment_time: DateTime<Utc>,
    pub patient: Participant,
    pub doctor: Option<Participant>,
    #[serde(default)]
    pub merge_data: Option<Value>,
}

pub const DEFAULT_TIMEZONE: &str = "Europe/Paris";

/// Local-time window in which non-urgent sends are held back. Wraps midnight when
/// `start > end`; `start == end` is an empty window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub push_enabled: bool,
    #[serde(default = "default_true")]
    pub appointment_reminders_enabled: bool,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    pub locale: String,
    /// IANA zone name used to read `quiet_hours`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub updated_at: DateTime<Utc>,
}

impl NotificationPreferences {
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            email_enabled: true,
            sms_enabled: false,
            push_enabled: false,
            appointment_reminders_enabled: true,
            quiet_hours: None,
            locale: "en".to_string(),
            timezone: default_timezone(),
            updated_at: Utc::now(),
        }
    }

    pub fn time_zone(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            warn!("Unknown timezone {} for user {}, using UTC", self.timezone, self.user_id);
            chrono_tz::UTC
        })
    }

    /// `send_at`, or the end of the quiet hours it falls into.
    pub fn next_send_time(&self, send_at: DateTime<Utc>) -> DateTime<Utc> {
        let Some(quiet) = self.quiet_hours else {
            return send_at;
        };

        let tz = self.time_zone();
        let local = send_at.with_timezone(&tz);
        if !quiet.contains(local.time()) {
            return send_at;
        }

        let mut date = local.date_naive();
        if quiet.start > quiet.end && local.time() >= quiet.start {
            date = date.succ_opt().unwrap_or(date);
        }

        let wake = date.and_time(quiet.end);
        tz.from_local_datetime(&wake)
            .earliest()
            // quiet hours ending inside a DST gap
            .or_else(|| tz.from_local_datetime(&(wake + Duration::hours(1))).earliest())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(send_at)
    }

    pub fn allows(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Email => self.email_enabled,
            ChannelKind::Sms => self.sms_enabled,
            ChannelKind::Push => self.push_enabled,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferencesUpdate {
    pub email_enabled: Option<bool>,
    pub sms_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub appointment_reminders_enabled: Option<bool>,
    /// Set `start == end` to switch quiet hours off.
    pub quiet_hours: Option<QuietHours>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Scheduled,
    Suppressed,
    Sent,
    AttemptFailed,
    Failed,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub user_id: Uuid,
    pub trigger_code: TriggerCode,
    pub event: AuditEvent,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(notification: &NotificationRequest, event: AuditEvent, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id: notification.id,
            user_id: notification.user_id,
            trigger_code: notification.trigger_code,
            event,
            detail,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub user_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub trigger_code: Option<TriggerCode>,
    pub limit: Option<usize>,
}

impl NotificationFilter {
    pub fn matches(&self, notification: &NotificationRequest) -> bool {
        self.status.map_or(true, |s| notification.status == s)
            && self.user_id.map_or(true, |u| notification.user_id == u)
            && self.appointment_id.map_or(true, |a| notification.appointment_id == Some(a))
            && self.trigger_code.map_or(true, |t| notification.trigger_code == t)
    }
}

/// Status/attempt update applied after a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct FailureUpdate {
    pub status: NotificationStatus,
    pub retry_count: u32,
    pub failure_kind: FailureKind,
    pub error_message: String,
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationStats {
    pub pending: u64,
    pub overdue: u64,
    pub sent: u64,
    pub failed: u64,
    pub permanently_failed: u64,
    pub oldest_overdue_at: Option<DateTime<Utc>>,
    pub queue_health: QueueHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Degraded { reason: String },
    Critical { reason: String },
}

impl NotificationStats {
    /// Overdue means due for longer than `stall_after`; the processor should have picked it up.
    pub fn from_notifications(
        notifications: &[NotificationRequest],
        now: DateTime<Utc>,
        max_attempts: u32,
        stall_after: Duration,
    ) -> Self {
        let mut stats = NotificationStats {
            pending: 0,
            overdue: 0,
            sent: 0,
            failed: 0,
            permanently_failed: 0,
            oldest_overdue_at: None,
            queue_health: QueueHealth::Healthy,
        };

        for n in notifications {
            match n.status {
                NotificationStatus::Pending => {
                    stats.pending += 1;
                    if n.scheduled_for + stall_after < now {
                        stats.overdue += 1;
                        stats.oldest_overdue_at = Some(match stats.oldest_overdue_at {
                            Some(oldest) if oldest <= n.scheduled_for => oldest,
                            _ => n.scheduled_for,
                        });
                    }
                }
                NotificationStatus::Sent => stats.sent += 1,
                NotificationStatus::Failed => {
                    stats.failed += 1;
                    if n.is_permanently_failed(max_attempts) {
                        stats.permanently_failed += 1;
                    }
                }
            }
        }

        stats.queue_health = if stats.overdue > 0 {
            QueueHealth::Critical {
                reason: format!("{} notifications overdue, processor may be stalled", stats.overdue),
            }
        } else if stats.failed > 0 {
            QueueHealth::Degraded {
                reason: format!("{} notifications failed", stats.failed),
            }
        } else {
            QueueHealth::Healthy
        };

        stats
    }
}

/// Counts for one processor pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub worker_id: String,
    pub poll_interval_seconds: u64,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_backoff_seconds: u64,
    pub lease_seconds: u64,
    pub delivery_timeout_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub sent_retention_days: i64,
    pub failed_retention_days: i64,
    pub dedup_window_minutes: i64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("notifier-{}", Uuid::new_v4()),
            poll_interval_seconds: 120,
            batch_size: 50,
            max_attempts: 3,
            retry_backoff_seconds: 120,
            lease_seconds: 300,
            delivery_timeout_seconds: 30,
            cleanup_interval_seconds: 3600,
            sent_retention_days: 7,
            failed_retention_days: 30,
            dedup_window_minutes: 30,
        }
    }
}

impl ProcessorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            poll_interval_seconds: config.notification_poll_interval_seconds,
            batch_size: config.notification_batch_size,
            max_attempts: config.notification_max_attempts,
            retry_backoff_seconds: config.notification_retry_backoff_seconds,
            delivery_timeout_seconds: config.notification_delivery_timeout_seconds,
            dedup_window_minutes: config.notification_dedup_window_minutes,
            ..Self::default()
        }
    }

    /// Lease taken on a row; always outlives one delivery attempt.
    pub fn lease_duration(&self) -> Duration {
        let seconds = self.lease_seconds.max(self.delivery_timeout_seconds + 1);
        Duration::seconds(seconds as i64)
    }
}
