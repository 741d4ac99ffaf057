use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use notification_queue_cell::{create_notification_router, NotificationService};
use shared_config::AppConfig;

pub fn create_router(config: Arc<AppConfig>, service: Arc<NotificationService>) -> Router {
    Router::new()
        .route("/", get(|| async { "Notification API is running!" }))
        .route("/healthz", get(|| async { "ok" }))
        .nest("/notifications", create_notification_router(config, service))
}
