use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::StoreError;
use crate::models::{
    AuditEntry, FailureUpdate, NotificationFilter, NotificationPreferences, NotificationRequest,
    NotificationStatus, TriggerCode,
};
use crate::services::store::{
    apply_failure, apply_reset, apply_sent, sort_for_delivery, NotificationStore,
};

// ARGV: id, data, status, scheduled_ms, created_ms, unique_key ('' when none)
const INSERT_SCRIPT: &str = r#"
if ARGV[6] ~= '' then
  if not redis.call('SET', ARGV[6], ARGV[1], 'NX') then
    return 0
  end
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'status', ARGV[3], 'created_at', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[5], ARGV[1])
return 1
"#;

// Lease a row only while it is still pending; returns the fresh data or nil.
const LEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'pending' then
  return false
end
if not redis.call('SET', KEYS[2], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return false
end
return redis.call('HGET', KEYS[1], 'data')
"#;

// Extend the caller's lease, or take it over if it lapsed and nobody else holds it.
const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'pending' then
  return 0
end
local holder = redis.call('GET', KEYS[2])
if holder == ARGV[1] then
  redis.call('PEXPIRE', KEYS[2], ARGV[2])
  return 1
end
if not holder and redis.call('SET', KEYS[2], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 1
end
return 0
"#;

// ARGV: expected_status, worker ('' skips the lease check), data, new_status, id, pending_score ('' removes)
const GUARDED_WRITE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[1] then
  return 0
end
if ARGV[2] ~= '' and redis.call('GET', KEYS[2]) ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[3], 'status', ARGV[4])
if ARGV[6] == '' then
  redis.call('ZREM', KEYS[3], ARGV[5])
else
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[5])
end
redis.call('DEL', KEYS[2])
return 1
"#;

pub struct RedisNotificationStore {
    pool: Pool,
    prefix: String,
    insert_script: Script,
    lease_script: Script,
    renew_script: Script,
    guarded_write_script: Script,
}

impl RedisNotificationStore {
    pub async fn new(config: &AppConfig) -> Result<Self, StoreError> {
        Self::with_prefix(config, "").await
    }

    /// Namespaces every key under `prefix`; tests use this for isolation.
    pub async fn with_prefix(config: &AppConfig, prefix: &str) -> Result<Self, StoreError> {
        let redis_url = config.redis_url.clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::PoolError(format!("Pool creation error: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::PoolError(format!("Connection error: {}", e)))?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis notification store initialized successfully");

        Ok(Self {
            pool,
            prefix: prefix.to_string(),
            insert_script: Script::new(INSERT_SCRIPT),
            lease_script: Script::new(LEASE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            guarded_write_script: Script::new(GUARDED_WRITE_SCRIPT),
        })
    }

    // Key layout

    fn notification_key(&self, id: Uuid) -> String {
        format!("{}notification:{}", self.prefix, id)
    }

    fn unique_key(&self, key: &str) -> String {
        format!("{}notification_unique:{}", self.prefix, key)
    }

    fn lease_key(&self, id: Uuid) -> String {
        format!("{}notification_lease:{}", self.prefix, id)
    }

    fn pending_key(&self) -> String {
        format!("{}notification_queue:pending", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}notification_index:created", self.prefix)
    }

    fn dedup_key(&self, user_id: Uuid, trigger_code: TriggerCode) -> String {
        format!("{}notification_dedup:{}:{}", self.prefix, user_id, trigger_code.as_str())
    }

    fn audit_key(&self, id: Uuid) -> String {
        format!("{}notification_audit:{}", self.prefix, id)
    }

    fn preferences_key(&self, user_id: Uuid) -> String {
        format!("{}notification_prefs:{}", self.prefix, user_id)
    }

    async fn get_connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::PoolError(e.to_string()))
    }

    async fn load_many(
        &self,
        conn: &mut Connection,
        ids: &[String],
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in ids {
            pipe.hget(format!("{}notification:{}", self.prefix, id), "data");
        }
        let rows: Vec<Option<String>> = pipe.query_async(conn).await?;

        let mut notifications = Vec::with_capacity(rows.len());
        for data in rows.into_iter().flatten() {
            notifications.push(serde_json::from_str(&data)?);
        }
        Ok(notifications)
    }

    async fn guarded_write(
        &self,
        conn: &mut Connection,
        notification: &NotificationRequest,
        expected: NotificationStatus,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(&notification.status) {
            debug!(
                "Refusing {} -> {} for notification {}",
                expected, notification.status, notification.id
            );
            return Ok(false);
        }

        let data = serde_json::to_string(notification)?;
        let pending_score = if notification.status == NotificationStatus::Pending {
            notification.scheduled_for.timestamp_millis().to_string()
        } else {
            String::new()
        };

        let written: i64 = self
            .guarded_write_script
            .key(self.notification_key(notification.id))
            .key(self.lease_key(notification.id))
            .key(self.pending_key())
            .arg(expected.as_str())
            .arg(worker_id)
            .arg(data)
            .arg(notification.status.as_str())
            .arg(notification.id.to_string())
            .arg(pending_score)
            .invoke_async(conn)
            .await?;

        Ok(written == 1)
    }
}

#[async_trait]
impl NotificationStore for RedisNotificationStore {
    async fn insert(&self, notification: &NotificationRequest) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let data = serde_json::to_string(notification)?;
        let unique = notification
            .unique_key()
            .map(|key| self.unique_key(&key))
            .unwrap_or_default();

        let inserted: i64 = self
            .insert_script
            .key(self.notification_key(notification.id))
            .key(self.pending_key())
            .key(self.dedup_key(notification.user_id, notification.trigger_code))
            .key(self.index_key())
            .arg(notification.id.to_string())
            .arg(data)
            .arg(notification.status.as_str())
            .arg(notification.scheduled_for.timestamp_millis())
            .arg(notification.created_at.timestamp_millis())
            .arg(unique)
            .invoke_async(&mut conn)
            .await?;

        if inserted == 0 {
            return Err(StoreError::UniqueViolation {
                key: notification.unique_key().unwrap_or_default(),
            });
        }

        debug!("Notification {} stored", notification.id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NotificationRequest>, StoreError> {
        let mut conn = self.get_connection().await?;
        let data: Option<String> = conn.hget(self.notification_key(id), "data").await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn find_recent_duplicate(
        &self,
        user_id: Uuid,
        appointment_id: Option<Uuid>,
        trigger_code: TriggerCode,
        since: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn
            .zrevrangebyscore(self.dedup_key(user_id, trigger_code), "+inf", since.timestamp_millis())
            .await?;

        let candidates = self.load_many(&mut conn, &ids).await?;
        Ok(candidates.into_iter().find(|n| {
            n.appointment_id == appointment_id
                && matches!(n.status, NotificationStatus::Pending | NotificationStatus::Failed)
        }))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        let mut conn = self.get_connection().await?;

        // Over-fetch so priority ordering can pick across more than one batch worth of rows.
        let scan = (limit.max(1) * 4) as isize;
        let ids: Vec<String> = conn
            .zrangebyscore_limit(self.pending_key(), "-inf", now.timestamp_millis(), 0, scan)
            .await?;

        let mut candidates = self.load_many(&mut conn, &ids).await?;
        candidates.retain(|n| n.is_due(now));
        sort_for_delivery(&mut candidates);

        let mut claimed = Vec::new();
        for candidate in candidates {
            if claimed.len() >= limit {
                break;
            }

            let fresh: Option<String> = self
                .lease_script
                .key(self.notification_key(candidate.id))
                .key(self.lease_key(candidate.id))
                .arg(worker_id)
                .arg(lease.num_milliseconds())
                .invoke_async(&mut conn)
                .await?;

            let Some(data) = fresh else {
                continue;
            };

            let mut notification: NotificationRequest = serde_json::from_str(&data)?;
            if !notification.is_due(now) {
                // rescheduled between the scan and the lease
                let _: () = conn.del(self.lease_key(notification.id)).await?;
                continue;
            }

            notification.claimed_by = Some(worker_id.to_string());
            notification.claimed_until = Some(now + lease);
            claimed.push(notification);
        }

        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        id: Uuid,
        worker_id: &str,
        _now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.get_connection().await?;
        let renewed: i64 = self
            .renew_script
            .key(self.notification_key(id))
            .key(self.lease_key(id))
            .arg(worker_id)
            .arg(lease.num_milliseconds())
            .invoke_async(&mut conn)
            .await?;

        Ok(renewed == 1)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        worker_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let Some(mut notification) = self.get(id).await? else {
            return Ok(None);
        };
        apply_sent(&mut notification, sent_at);

        let mut conn = self.get_connection().await?;
        let written = self
            .guarded_write(&mut conn, &notification, NotificationStatus::Pending, worker_id)
            .await?;
        Ok(written.then_some(notification))
    }

    async fn record_failure(
        &self,
        id: Uuid,
        worker_id: &str,
        update: &FailureUpdate,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let Some(mut notification) = self.get(id).await? else {
            return Ok(None);
        };
        apply_failure(&mut notification, update);

        let mut conn = self.get_connection().await?;
        let written = self
            .guarded_write(&mut conn, &notification, NotificationStatus::Pending, worker_id)
            .await?;
        Ok(written.then_some(notification))
    }

    async fn reset_for_retry(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let Some(mut notification) = self.get(id).await? else {
            return Ok(None);
        };
        if notification.status != NotificationStatus::Failed {
            return Ok(None);
        }
        apply_reset(&mut notification, now);

        let mut conn = self.get_connection().await?;
        let written = self
            .guarded_write(&mut conn, &notification, NotificationStatus::Failed, "")
            .await?;
        Ok(written.then_some(notification))
    }

    async fn list(&self, filter: &NotificationFilter) -> Result<Vec<NotificationRequest>, StoreError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.zrevrange(self.index_key(), 0, -1).await?;

        let mut rows: Vec<NotificationRequest> = self
            .load_many(&mut conn, &ids)
            .await?
            .into_iter()
            .filter(|n| filter.matches(n))
            .collect();

        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .rpush(self.audit_key(entry.notification_id), serde_json::to_string(entry)?)
            .await?;
        Ok(())
    }

    async fn audit_for(&self, notification_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let mut conn = self.get_connection().await?;
        let raw: Vec<String> = conn.lrange(self.audit_key(notification_id), 0, -1).await?;

        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StoreError::from))
            .collect()
    }

    async fn get_preferences(&self, user_id: Uuid) -> Result<Option<NotificationPreferences>, StoreError> {
        let mut conn = self.get_connection().await?;
        let data: Option<String> = conn.get(self.preferences_key(user_id)).await?;

        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn upsert_preferences(&self, preferences: &NotificationPreferences) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn
            .set(self.preferences_key(preferences.user_id), serde_json::to_string(preferences)?)
            .await?;
        Ok(())
    }

    async fn purge_closed_before(
        &self,
        sent_cutoff: DateTime<Utc>,
        failed_cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.zrange(self.index_key(), 0, -1).await?;
        let notifications = self.load_many(&mut conn, &ids).await?;

        let mut purged = 0;
        for notification in notifications {
            let expired = match notification.status {
                NotificationStatus::Sent => notification.sent_at.map_or(false, |t| t < sent_cutoff),
                NotificationStatus::Failed => notification.updated_at < failed_cutoff,
                NotificationStatus::Pending => false,
            };
            if !expired {
                continue;
            }

            let id = notification.id.to_string();
            let mut pipe = redis::pipe();
            pipe.del(self.notification_key(notification.id)).ignore()
                .del(self.audit_key(notification.id)).ignore()
                .zrem(self.index_key(), &id).ignore()
                .zrem(self.dedup_key(notification.user_id, notification.trigger_code), &id).ignore();
            if let Some(key) = notification.unique_key() {
                pipe.del(self.unique_key(&key)).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
            purged += 1;
        }

        if purged > 0 {
            info!(
                "Purged {} closed notifications (sent before {}, failed before {})",
                purged, sent_cutoff, failed_cutoff
            );
        } else {
            debug!("No closed notifications found to purge");
        }

        Ok(purged)
    }
}
