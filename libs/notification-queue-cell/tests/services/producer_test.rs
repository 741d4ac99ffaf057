use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, NaiveTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use notification_queue_cell::*;
use super::{booking_merge_data, booking_request, enable_all_channels, full_contact, memory_service};

fn reminders_for(patient: Uuid, doctor: Uuid, starts_in: Duration) -> AppointmentReminders {
    AppointmentReminders {
        appointment_id: Uuid::new_v4(),
        appointment_time: Utc::now() + starts_in,
        patient: Participant {
            user_id: patient,
            contact: full_contact(),
        },
        doctor: Some(Participant {
            user_id: doctor,
            contact: ContactDetails {
                email: Some("doctor@example.com".to_string()),
                phone: None,
                push_token: Some("doctor-push-token".to_string()),
            },
        }),
        merge_data: Some(booking_merge_data()),
    }
}

#[tokio::test]
async fn test_schedule_sets_derived_fields() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    let appointment = Some(Uuid::new_v4());
    let at = Utc::now() + Duration::hours(3);

    let mut request = booking_request(user, appointment);
    request.scheduled_for = Some(at);
    request.metadata = Some(json!({ "source": "booking" }));

    let outcome = service.schedule(request).await.unwrap();
    let ScheduleOutcome::Scheduled { notification } = outcome else {
        panic!("expected a scheduled notification");
    };

    assert_eq!(notification.status, NotificationStatus::Pending);
    assert_eq!(notification.channel, ChannelKind::Email);
    assert_eq!(notification.recipient, "patient@example.com");
    assert_eq!(notification.template_key, "booking_confirmation");
    assert_eq!(notification.priority, 90);
    assert_eq!(notification.retry_count, 0);
    assert_eq!(notification.scheduled_for, at);
    assert_eq!(notification.metadata["source"], "booking");

    let stored = service.get(notification.id).await.unwrap();
    assert_eq!(stored, notification);
}

#[tokio::test]
async fn test_default_preferences_disable_sms() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();

    let mut request = booking_request(user, Some(Uuid::new_v4()));
    request.trigger_code = TriggerCode::Rem10mDoc;

    let outcome = service.schedule(request).await.unwrap();
    assert_eq!(outcome, ScheduleOutcome::ChannelDisabled { channel: ChannelKind::Sms });
    assert!(store.is_empty().await);

    let preferences = service.preferences(user).await.unwrap();
    assert!(preferences.email_enabled);
    assert!(!preferences.sms_enabled);
    assert!(!preferences.push_enabled);
    assert_eq!(preferences.locale, "en");
}

#[tokio::test]
async fn test_enabled_channel_schedules_with_matching_address() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    enable_all_channels(&service, user).await;

    let mut request = booking_request(user, Some(Uuid::new_v4()));
    request.trigger_code = TriggerCode::Rem10mDoc;

    let outcome = service.schedule(request).await.unwrap();
    let ScheduleOutcome::Scheduled { notification } = outcome else {
        panic!("expected a scheduled notification");
    };
    assert_eq!(notification.channel, ChannelKind::Sms);
    assert_eq!(notification.recipient, "+33600000000");
}

#[tokio::test]
async fn test_missing_address_is_reported() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);

    let mut request = booking_request(Uuid::new_v4(), None);
    request.contact.email = None;

    let outcome = service.schedule(request).await.unwrap();
    assert_eq!(outcome, ScheduleOutcome::NoRecipient { channel: ChannelKind::Email });
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_merge_data_must_be_an_object() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);

    let mut request = booking_request(Uuid::new_v4(), None);
    request.merge_data = Some(json!(["not", "an", "object"]));

    let result = service.schedule(request).await;
    assert_matches!(result, Err(NotificationError::ValidationError(_)));
}

#[tokio::test]
async fn test_update_preferences_rejects_blank_locale() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();

    let updated = service
        .update_preferences(
            user,
            PreferencesUpdate {
                email_enabled: Some(false),
                sms_enabled: None,
                push_enabled: Some(true),
                locale: Some("fr".to_string()),
                ..PreferencesUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(!updated.email_enabled);
    assert!(updated.push_enabled);
    assert_eq!(updated.locale, "fr");

    let blank = service
        .update_preferences(
            user,
            PreferencesUpdate {
                email_enabled: None,
                sms_enabled: None,
                push_enabled: None,
                locale: Some("  ".to_string()),
                ..PreferencesUpdate::default()
            },
        )
        .await;
    assert_matches!(blank, Err(NotificationError::ValidationError(_)));
    assert_eq!(service.preferences(user).await.unwrap().locale, "fr");
}

#[tokio::test]
async fn test_appointment_reminders_are_staggered() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let patient = Uuid::new_v4();
    let doctor = Uuid::new_v4();
    enable_all_channels(&service, patient).await;
    enable_all_channels(&service, doctor).await;

    let reminders = reminders_for(patient, doctor, Duration::days(2));
    let at = reminders.appointment_time;
    let outcomes = service.schedule_appointment_reminders(reminders).await.unwrap();

    let plan: Vec<(TriggerCode, Uuid, chrono::DateTime<Utc>)> = outcomes
        .iter()
        .map(|o| (o.trigger_code, o.user_id, o.send_at))
        .collect();
    assert_eq!(
        plan,
        vec![
            (TriggerCode::Rem24h, patient, at - Duration::hours(24)),
            (TriggerCode::Rem1hDoc, doctor, at - Duration::hours(1)),
            (TriggerCode::Rem5mPat, patient, at - Duration::minutes(5)),
        ]
    );
    assert!(outcomes.iter().all(|o| matches!(&o.outcome, Some(outcome) if outcome.is_scheduled())));
    assert_eq!(store.len().await, 3);

    let doctor_rows = service
        .list(&NotificationFilter {
            user_id: Some(doctor),
            ..NotificationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(doctor_rows.len(), 1);
    assert_eq!(doctor_rows[0].recipient, "doctor-push-token");
}

#[tokio::test]
async fn test_reminders_already_due_are_skipped() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let patient = Uuid::new_v4();
    let doctor = Uuid::new_v4();
    enable_all_channels(&service, patient).await;

    let outcomes = service
        .schedule_appointment_reminders(reminders_for(patient, doctor, Duration::minutes(30)))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].outcome.is_none());
    assert!(outcomes[1].outcome.is_none());
    assert_matches!(&outcomes[2].outcome, Some(ScheduleOutcome::Scheduled { .. }));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_repeated_reminder_request_creates_nothing_new() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let patient = Uuid::new_v4();
    let doctor = Uuid::new_v4();
    enable_all_channels(&service, patient).await;
    enable_all_channels(&service, doctor).await;

    let reminders = reminders_for(patient, doctor, Duration::days(2));
    service.schedule_appointment_reminders(reminders.clone()).await.unwrap();
    let again = service.schedule_appointment_reminders(reminders).await.unwrap();

    for outcome in again {
        assert_matches!(outcome.outcome, Some(ScheduleOutcome::Suppressed { .. }));
    }
    assert_eq!(store.len().await, 3);
}

#[tokio::test]
async fn test_reminders_respect_opt_out() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let patient = Uuid::new_v4();
    let doctor = Uuid::new_v4();
    enable_all_channels(&service, patient).await;
    enable_all_channels(&service, doctor).await;
    service
        .update_preferences(
            patient,
            PreferencesUpdate {
                appointment_reminders_enabled: Some(false),
                ..PreferencesUpdate::default()
            },
        )
        .await
        .unwrap();

    let outcomes = service
        .schedule_appointment_reminders(reminders_for(patient, doctor, Duration::days(2)))
        .await
        .unwrap();

    for outcome in &outcomes {
        if outcome.user_id == patient {
            assert_eq!(outcome.outcome, Some(ScheduleOutcome::RemindersDisabled));
        } else {
            assert_matches!(outcome.outcome, Some(ScheduleOutcome::Scheduled { .. }));
        }
    }
    assert_eq!(store.len().await, 1);

    // confirmations are not reminders
    let booking = service.schedule(booking_request(patient, None)).await.unwrap();
    assert!(booking.is_scheduled());
}

#[tokio::test]
async fn test_quiet_hours_defer_non_urgent_sends() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();
    service
        .update_preferences(
            user,
            PreferencesUpdate {
                quiet_hours: Some(QuietHours {
                    start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                }),
                timezone: Some("UTC".to_string()),
                ..PreferencesUpdate::default()
            },
        )
        .await
        .unwrap();

    let day = (Utc::now() + Duration::days(2)).date_naive();
    let late_evening = Utc.from_utc_datetime(&day.and_hms_opt(23, 0, 0).unwrap());
    let next_morning = Utc.from_utc_datetime(&day.succ_opt().unwrap().and_hms_opt(8, 0, 0).unwrap());

    let mut survey = ScheduleRequest::new(user, Some(Uuid::new_v4()), TriggerCode::Survey, full_contact());
    survey.scheduled_for = Some(late_evening);
    let ScheduleOutcome::Scheduled { notification } = service.schedule(survey).await.unwrap() else {
        panic!("expected the survey to be scheduled");
    };
    assert_eq!(notification.scheduled_for, next_morning);

    let mut booking = booking_request(user, Some(Uuid::new_v4()));
    booking.scheduled_for = Some(late_evening);
    let ScheduleOutcome::Scheduled { notification } = service.schedule(booking).await.unwrap() else {
        panic!("expected the confirmation to be scheduled");
    };
    assert_eq!(notification.scheduled_for, late_evening);
}

#[tokio::test]
async fn test_update_preferences_rejects_unknown_timezone() {
    let store = Arc::new(InMemoryNotificationStore::new());
    let service = memory_service(Arc::clone(&store), &[]);
    let user = Uuid::new_v4();

    let result = service
        .update_preferences(
            user,
            PreferencesUpdate {
                timezone: Some("Mars/Olympus".to_string()),
                ..PreferencesUpdate::default()
            },
        )
        .await;
    assert_matches!(result, Err(NotificationError::ValidationError(_)));
    assert_eq!(service.preferences(user).await.unwrap().timezone, "Europe/Paris");
}
