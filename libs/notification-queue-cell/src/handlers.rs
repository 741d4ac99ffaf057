use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Extension,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::{auth::User, error::AppError};
use shared_utils::extractor::require_admin;

use crate::models::{AppointmentReminders, NotificationFilter, PreferencesUpdate, ScheduleRequest};
use crate::services::consumer::NotificationService;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub force: bool,
}

fn user_uuid(user: &User) -> Result<Uuid, AppError> {
    Uuid::parse_str(&user.id).map_err(|_| AppError::BadRequest("Invalid user ID format".to_string()))
}

/// Admins may act for anyone; other callers only for themselves.
fn require_self_or_admin(user: &User, target: Uuid) -> Result<(), AppError> {
    if user.is_admin() || user_uuid(user)? == target {
        Ok(())
    } else {
        Err(AppError::Forbidden("Cannot manage notifications of another user".to_string()))
    }
}

/// Schedule one notification
pub async fn schedule_notification(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Json(request): Json<ScheduleRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    require_self_or_admin(&user, request.user_id)?;
    info!("Schedule {} for user {} requested by {}", request.trigger_code, request.user_id, user.id);

    let outcome = service.schedule(request).await?;
    let status = if outcome.is_scheduled() { StatusCode::CREATED } else { StatusCode::OK };

    Ok((status, Json(json!({
        "success": true,
        "result": outcome
    }))))
}

/// Schedule the reminder set of an appointment. Including the doctor needs admin.
pub async fn schedule_reminders(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Path(appointment_id): Path<Uuid>,
    Json(mut reminders): Json<AppointmentReminders>,
) -> Result<Json<Value>, AppError> {
    require_self_or_admin(&user, reminders.patient.user_id)?;
    // reminders addressed to the doctor are issued by the platform, not the patient
    if reminders.doctor.is_some() {
        require_admin(&user)?;
    }
    reminders.appointment_id = appointment_id;
    info!("Reminders for appointment {} requested by {}", appointment_id, user.id);

    let outcomes = service.schedule_appointment_reminders(reminders).await?;

    Ok(Json(json!({
        "success": true,
        "appointment_id": appointment_id,
        "reminders": outcomes
    })))
}

/// List notifications (admin only)
pub async fn list_notifications(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Query(mut filter): Query<NotificationFilter>,
) -> Result<Json<Value>, AppError> {
    require_admin(&user)?;
    filter.limit = Some(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT));

    let notifications = service.list(&filter).await?;

    Ok(Json(json!({
        "count": notifications.len(),
        "notifications": notifications
    })))
}

/// Queue statistics (admin only)
pub async fn get_queue_stats(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    require_admin(&user)?;
    info!("Queue stats request from user: {}", user.id);

    let stats = service.stats().await?;
    Ok(Json(json!(stats)))
}

/// One notification (admin or its recipient)
pub async fn get_notification(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let notification = service.get(id).await?;

    if !user.is_admin() && user_uuid(&user)? != notification.user_id {
        return Err(AppError::Forbidden("Access denied".to_string()));
    }

    Ok(Json(json!(notification)))
}

/// Audit trail of one notification (admin only)
pub async fn get_notification_audit(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    require_admin(&user)?;

    let entries = service.audit(id).await?;
    Ok(Json(json!({
        "notification_id": id,
        "entries": entries
    })))
}

/// Reset a failed notification to pending (admin only)
pub async fn retry_notification(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    require_admin(&user)?;

    let request: RetryRequest = if body.is_empty() {
        RetryRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid retry request: {}", e)))?
    };
    info!("Retry of notification {} requested by {} (force={})", id, user.id, request.force);

    let notification = service.retry(id, request.force).await?;

    Ok(Json(json!({
        "success": true,
        "notification": notification
    })))
}

/// Run one delivery cycle now (admin only)
pub async fn process_now(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    require_admin(&user)?;
    info!("Manual delivery cycle requested by {}", user.id);

    let report = service.process_now().await?;
    Ok(Json(json!(report)))
}

/// Caller's channel preferences
pub async fn get_preferences(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let preferences = service.preferences(user_uuid(&user)?).await?;
    Ok(Json(json!(preferences)))
}

/// Update the caller's channel preferences
pub async fn update_preferences(
    State(service): State<Arc<NotificationService>>,
    Extension(user): Extension<User>,
    Json(update): Json<PreferencesUpdate>,
) -> Result<Json<Value>, AppError> {
    let preferences = service.update_preferences(user_uuid(&user)?, update).await?;
    Ok(Json(json!(preferences)))
}
