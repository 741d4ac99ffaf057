use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use notification_queue_cell::*;
use super::RedisTestUtils;

macro_rules! redis_or_skip {
    () => {
        match RedisTestUtils::new().await {
            Some(utils) => utils,
            None => {
                eprintln!("REDIS_TEST_URL not set or unreachable, skipping");
                return;
            }
        }
    };
}

fn booking(user: Uuid, appointment: Option<Uuid>) -> NotificationRequest {
    NotificationRequest::new(user, appointment, TriggerCode::BookConf, "p@example.com".into(), Utc::now())
}

fn transient_failure(retry_count: u32) -> FailureUpdate {
    FailureUpdate {
        status: NotificationStatus::Pending,
        retry_count,
        failure_kind: FailureKind::Transient,
        error_message: "503".to_string(),
        next_attempt_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_redis_insert_and_get() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;

    let notification = booking(Uuid::new_v4(), Some(Uuid::new_v4()));
    store.insert(&notification).await.unwrap();

    let stored = store.get(notification.id).await.unwrap().unwrap();
    assert_eq!(stored.id, notification.id);
    assert_eq!(stored.status, NotificationStatus::Pending);
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_unique_key_holds_under_concurrency() {
    let test_utils = redis_or_skip!();
    let store = Arc::new(test_utils.store().await);
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());

    let inserts = (0..10).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.insert(&booking(user, appointment)).await })
    });
    let results: Vec<Result<(), StoreError>> = join_all(inserts).await.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert_matches!(result, Err(StoreError::UniqueViolation { .. }));
    }

    let rows = store
        .list(&NotificationFilter {
            appointment_id: appointment,
            ..NotificationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_find_recent_duplicate() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;
    let user = Uuid::new_v4();

    let notification = booking(user, None);
    store.insert(&notification).await.unwrap();

    let since = Utc::now() - Duration::minutes(30);
    let found = store.find_recent_duplicate(user, None, TriggerCode::BookConf, since).await.unwrap();
    assert_eq!(found.map(|n| n.id), Some(notification.id));

    let other_appointment = store
        .find_recent_duplicate(user, Some(Uuid::new_v4()), TriggerCode::BookConf, since)
        .await
        .unwrap();
    assert!(other_appointment.is_none());

    let outside_window = store
        .find_recent_duplicate(user, None, TriggerCode::BookConf, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert!(outside_window.is_none());

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_claim_lease_and_transitions() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;

    let notification = booking(Uuid::new_v4(), Some(Uuid::new_v4()));
    store.insert(&notification).await.unwrap();

    let claimed = store.claim_due(Utc::now(), 10, "w1", Duration::minutes(5)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("w1"));
    assert!(store.claim_due(Utc::now(), 10, "w2", Duration::minutes(5)).await.unwrap().is_empty());

    // only the lease holder may write
    assert!(store.record_failure(notification.id, "w2", &transient_failure(1)).await.unwrap().is_none());
    let retried = store.record_failure(notification.id, "w1", &transient_failure(1)).await.unwrap().unwrap();
    assert_eq!(retried.retry_count, 1);

    let reclaimed = store.claim_due(Utc::now(), 10, "w2", Duration::minutes(5)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);

    let sent = store.mark_sent(notification.id, "w2", Utc::now()).await.unwrap().unwrap();
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert!(store.mark_sent(notification.id, "w2", Utc::now()).await.unwrap().is_none());
    assert!(store.reset_for_retry(notification.id, Utc::now()).await.unwrap().is_none());

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_reset_and_purge() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());

    let notification = booking(user, appointment);
    store.insert(&notification).await.unwrap();
    store.claim_due(Utc::now(), 1, "w1", Duration::minutes(5)).await.unwrap();

    let failed = FailureUpdate {
        status: NotificationStatus::Failed,
        retry_count: 1,
        failure_kind: FailureKind::Permanent,
        error_message: "400".to_string(),
        next_attempt_at: Utc::now(),
    };
    store.record_failure(notification.id, "w1", &failed).await.unwrap().unwrap();
    assert!(store.claim_due(Utc::now(), 10, "w1", Duration::minutes(5)).await.unwrap().is_empty());

    let reset = store.reset_for_retry(notification.id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(reset.status, NotificationStatus::Pending);
    assert_eq!(reset.retry_count, 0);

    store.claim_due(Utc::now(), 1, "w1", Duration::minutes(5)).await.unwrap();
    store
        .mark_sent(notification.id, "w1", Utc::now() - Duration::days(8))
        .await
        .unwrap()
        .unwrap();

    let purged = store
        .purge_closed_before(Utc::now() - Duration::days(7), Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.get(notification.id).await.unwrap().is_none());
    assert!(store.insert(&booking(user, appointment)).await.is_ok());

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_purges_failed_rows_past_retention() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;

    let failed = booking(Uuid::new_v4(), Some(Uuid::new_v4()));
    let pending = booking(Uuid::new_v4(), Some(Uuid::new_v4()));
    store.insert(&failed).await.unwrap();
    store.insert(&pending).await.unwrap();
    store.claim_due(Utc::now(), 10, "w1", Duration::minutes(5)).await.unwrap();

    let update = FailureUpdate {
        status: NotificationStatus::Failed,
        retry_count: 1,
        failure_kind: FailureKind::Permanent,
        error_message: "400".to_string(),
        next_attempt_at: Utc::now(),
    };
    store.record_failure(failed.id, "w1", &update).await.unwrap().unwrap();

    let kept = store
        .purge_closed_before(Utc::now(), Utc::now() - Duration::days(30))
        .await
        .unwrap();
    assert_eq!(kept, 0);

    let purged = store
        .purge_closed_before(Utc::now(), Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.get(failed.id).await.unwrap().is_none());
    assert!(store.get(pending.id).await.unwrap().is_some());

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_lease_renewal() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;

    let notification = booking(Uuid::new_v4(), None);
    store.insert(&notification).await.unwrap();
    store.claim_due(Utc::now(), 1, "w1", Duration::milliseconds(300)).await.unwrap();

    assert!(store.renew_lease(notification.id, "w1", Utc::now(), Duration::minutes(5)).await.unwrap());
    assert!(!store.renew_lease(notification.id, "w2", Utc::now(), Duration::minutes(5)).await.unwrap());

    // the renewed lease outlives the original 300ms one
    tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    assert!(store.claim_due(Utc::now(), 10, "w2", Duration::minutes(5)).await.unwrap().is_empty());

    store.mark_sent(notification.id, "w1", Utc::now()).await.unwrap().unwrap();
    assert!(!store.renew_lease(notification.id, "w1", Utc::now(), Duration::minutes(5)).await.unwrap());
    assert!(store.reset_for_retry(notification.id, Utc::now()).await.unwrap().is_none());

    test_utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_preferences_and_audit() {
    let test_utils = redis_or_skip!();
    let store = test_utils.store().await;
    let user = Uuid::new_v4();

    assert!(store.get_preferences(user).await.unwrap().is_none());
    let mut preferences = NotificationPreferences::default_for(user);
    preferences.sms_enabled = true;
    store.upsert_preferences(&preferences).await.unwrap();
    assert_eq!(store.get_preferences(user).await.unwrap(), Some(preferences));

    let notification = booking(user, None);
    store.insert(&notification).await.unwrap();
    store.append_audit(&AuditEntry::new(&notification, AuditEvent::Scheduled, None)).await.unwrap();
    store
        .append_audit(&AuditEntry::new(&notification, AuditEvent::Sent, Some("log accepted".to_string())))
        .await
        .unwrap();

    let events: Vec<AuditEvent> = store.audit_for(notification.id).await.unwrap().iter().map(|e| e.event).collect();
    assert_eq!(events, vec![AuditEvent::Scheduled, AuditEvent::Sent]);

    test_utils.cleanup().await;
}
