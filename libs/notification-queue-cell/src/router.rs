use std::sync::Arc;
use axum::{
    Router,
    routing::{get, post},
    middleware,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;
use crate::handlers::{
    get_notification,
    get_notification_audit,
    get_preferences,
    get_queue_stats,
    list_notifications,
    process_now,
    retry_notification,
    schedule_notification,
    schedule_reminders,
    update_preferences,
};
use crate::services::consumer::NotificationService;

pub fn create_notification_router(config: Arc<AppConfig>, service: Arc<NotificationService>) -> Router {
    let protected_routes = Router::new()
        .route("/", post(schedule_notification).get(list_notifications))
        .route("/stats", get(get_queue_stats))
        .route("/process", post(process_now))
        .route("/preferences", get(get_preferences).put(update_preferences))
        .route("/appointments/{appointment_id}/reminders", post(schedule_reminders))
        .route("/{id}", get(get_notification))
        .route("/{id}/audit", get(get_notification_audit))
        .route("/{id}/retry", post(retry_notification))
        .layer(middleware::from_fn_with_state(config, auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(service)
}
