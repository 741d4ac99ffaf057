use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub store_backend: String,
    pub port: u16,

    // Delivery providers
    pub mailgun_api_key: String,
    pub mailgun_domain: String,
    pub mailgun_base_url: String,
    pub mail_from: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_from_number: String,
    pub twilio_base_url: String,
    pub push_gateway_url: String,
    pub push_gateway_token: String,

    // Notification processing
    pub notification_poll_interval_seconds: u64,
    pub notification_batch_size: usize,
    pub notification_max_attempts: u32,
    pub notification_retry_backoff_seconds: u64,
    pub notification_dedup_window_minutes: i64,
    pub notification_delivery_timeout_seconds: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok(),
            store_backend: env::var("NOTIFICATION_STORE")
                .unwrap_or_else(|_| "redis".to_string()),
            port: parse_or("PORT", 3000),
            mailgun_api_key: env::var("MAILGUN_API_KEY")
                .unwrap_or_else(|_| {
                    warn!("MAILGUN_API_KEY not set, email will only be logged");
                    String::new()
                }),
            mailgun_domain: env::var("MAILGUN_DOMAIN").unwrap_or_default(),
            mailgun_base_url: env::var("MAILGUN_BASE_URL")
                .unwrap_or_else(|_| "https://api.eu.mailgun.net".to_string()),
            mail_from: env::var("MAIL_FROM")
                .unwrap_or_else(|_| "Clinic <noreply@clinic.local>".to_string()),
            twilio_account_sid: env::var("TWILIO_ACCOUNT_SID")
                .unwrap_or_else(|_| {
                    warn!("TWILIO_ACCOUNT_SID not set, SMS will only be logged");
                    String::new()
                }),
            twilio_auth_token: env::var("TWILIO_AUTH_TOKEN").unwrap_or_default(),
            twilio_from_number: env::var("TWILIO_FROM_NUMBER").unwrap_or_default(),
            twilio_base_url: env::var("TWILIO_BASE_URL")
                .unwrap_or_else(|_| "https://api.twilio.com".to_string()),
            push_gateway_url: env::var("PUSH_GATEWAY_URL")
                .unwrap_or_else(|_| {
                    warn!("PUSH_GATEWAY_URL not set, push will only be logged");
                    String::new()
                }),
            push_gateway_token: env::var("PUSH_GATEWAY_TOKEN").unwrap_or_default(),
            notification_poll_interval_seconds: parse_or("NOTIFICATION_POLL_INTERVAL_SECONDS", 120),
            notification_batch_size: parse_or("NOTIFICATION_BATCH_SIZE", 50),
            notification_max_attempts: parse_or("NOTIFICATION_MAX_ATTEMPTS", 3),
            notification_retry_backoff_seconds: parse_or("NOTIFICATION_RETRY_BACKOFF_SECONDS", 120),
            notification_dedup_window_minutes: parse_or("NOTIFICATION_DEDUP_WINDOW_MINUTES", 30),
            notification_delivery_timeout_seconds: parse_or("NOTIFICATION_DELIVERY_TIMEOUT_SECONDS", 30),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.jwt_secret.is_empty()
            && (self.store_backend == "memory" || self.redis_url.is_some())
    }

    pub fn is_email_configured(&self) -> bool {
        !self.mailgun_api_key.is_empty() && !self.mailgun_domain.is_empty()
    }

    pub fn is_sms_configured(&self) -> bool {
        !self.twilio_account_sid.is_empty()
            && !self.twilio_auth_token.is_empty()
            && !self.twilio_from_number.is_empty()
    }

    pub fn is_push_configured(&self) -> bool {
        !self.push_gateway_url.is_empty()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            redis_url: None,
            store_backend: "memory".to_string(),
            port: 3000,
            mailgun_api_key: String::new(),
            mailgun_domain: String::new(),
            mailgun_base_url: "https://api.eu.mailgun.net".to_string(),
            mail_from: "Clinic <noreply@clinic.local>".to_string(),
            twilio_account_sid: String::new(),
            twilio_auth_token: String::new(),
            twilio_from_number: String::new(),
            twilio_base_url: "https://api.twilio.com".to_string(),
            push_gateway_url: String::new(),
            push_gateway_token: String::new(),
            notification_poll_interval_seconds: 120,
            notification_batch_size: 50,
            notification_max_attempts: 3,
            notification_retry_backoff_seconds: 120,
            notification_dedup_window_minutes: 30,
            notification_delivery_timeout_seconds: 30,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
