use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use notification_queue_cell::*;
use super::{booking_request, memory_service};

#[tokio::test]
async fn test_duplicate_booking_within_window_is_suppressed() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());

    let first = service.schedule(booking_request(user, appointment)).await.unwrap();
    let ScheduleOutcome::Scheduled { notification } = first else {
        panic!("first request should schedule, got {:?}", first);
    };

    let second = service.schedule(booking_request(user, appointment)).await.unwrap();
    assert_eq!(
        second,
        ScheduleOutcome::Suppressed {
            existing_id: notification.id,
            existing_status: NotificationStatus::Pending,
        }
    );
    assert_eq!(store.len().await, 1);

    let audit = service.audit(notification.id).await.unwrap();
    let events: Vec<AuditEvent> = audit.iter().map(|e| e.event).collect();
    assert_eq!(events, vec![AuditEvent::Scheduled, AuditEvent::Suppressed]);
}

async fn seed_booking(store: &InMemoryNotificationStore, user: Uuid, age: Duration) -> NotificationRequest {
    let mut existing = NotificationRequest::new(user, None, TriggerCode::BookConf, "patient@example.com".into(), Utc::now());
    existing.created_at = Utc::now() - age;
    store.insert(&existing).await.unwrap();
    existing
}

#[tokio::test]
async fn test_row_older_than_window_does_not_suppress() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    seed_booking(&store, user, Duration::minutes(31)).await;

    let outcome = service.schedule(booking_request(user, None)).await.unwrap();
    assert_matches!(outcome, ScheduleOutcome::Scheduled { .. });
    assert_eq!(store.len().await, 2);
}

#[tokio::test]
async fn test_row_inside_window_suppresses() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    let existing = seed_booking(&store, user, Duration::minutes(29)).await;

    let outcome = service.schedule(booking_request(user, None)).await.unwrap();
    assert_eq!(
        outcome,
        ScheduleOutcome::Suppressed {
            existing_id: existing.id,
            existing_status: NotificationStatus::Pending,
        }
    );
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_requests_leave_one_row() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = Arc::new(memory_service(Arc::clone(&store), &[]));
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());

    let attempts = (0..20).map(|_| {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.schedule(booking_request(user, appointment)).await })
    });

    let outcomes: Vec<ScheduleOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let scheduled = outcomes.iter().filter(|o| o.is_scheduled()).count();
    assert_eq!(scheduled, 1);
    for outcome in outcomes.iter().filter(|o| !o.is_scheduled()) {
        assert_matches!(outcome, ScheduleOutcome::Suppressed { .. } | ScheduleOutcome::AlreadyScheduled);
    }
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_missing_appointment_still_deduplicates() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();

    let mut request = booking_request(user, None);
    request.trigger_code = TriggerCode::FreeCredit;
    assert!(service.schedule(request.clone()).await.unwrap().is_scheduled());

    let second = service.schedule(request).await.unwrap();
    assert_matches!(second, ScheduleOutcome::Suppressed { .. });
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_other_appointment_or_trigger_is_not_a_duplicate() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());

    assert!(service.schedule(booking_request(user, appointment)).await.unwrap().is_scheduled());
    assert!(service.schedule(booking_request(user, Some(Uuid::new_v4()))).await.unwrap().is_scheduled());

    let mut cancel = booking_request(user, appointment);
    cancel.trigger_code = TriggerCode::Cancel;
    assert!(service.schedule(cancel).await.unwrap().is_scheduled());

    assert!(service.schedule(booking_request(Uuid::new_v4(), appointment)).await.unwrap().is_scheduled());
    assert_eq!(store.len().await, 4);
}

#[tokio::test]
async fn test_sent_notification_blocks_reinsert_via_unique_key() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());

    assert!(service.schedule(booking_request(user, appointment)).await.unwrap().is_scheduled());
    let report = service.process_now().await.unwrap();
    assert_eq!(report.sent, 1);

    // sent rows are outside the dedup guard; the uniqueness key catches them
    let again = service.schedule(booking_request(user, appointment)).await.unwrap();
    assert_eq!(again, ScheduleOutcome::AlreadyScheduled);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_failed_notification_inside_window_suppresses() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();

    // no merge data: rendering fails permanently on the first cycle
    let mut request = booking_request(user, None);
    request.merge_data = None;
    assert!(service.schedule(request.clone()).await.unwrap().is_scheduled());
    assert_eq!(service.process_now().await.unwrap().failed, 1);

    let again = service.schedule(request).await.unwrap();
    assert_matches!(
        again,
        ScheduleOutcome::Suppressed { existing_status: NotificationStatus::Failed, .. }
    );
}
