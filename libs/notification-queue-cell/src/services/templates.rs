use std::collections::HashMap;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ChannelKind, NotificationRequest, TriggerCode};
use crate::services::calendar::{Attachment, CalendarEvent};

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}";

/// Rendering errors are never retried: the same input renders the same way next time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Template {template} is missing variable {variable}")]
    MissingVariable { template: String, variable: String },

    #[error("Template {template} has an invalid {variable}: {reason}")]
    InvalidVariable { template: String, variable: String, reason: String },

    #[error("Invalid template pattern: {0}")]
    InvalidPattern(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub key: String,
    pub subject: String,
    pub body: String,
}

impl MessageTemplate {
    pub fn new(key: &str, subject: &str, body: &str) -> Self {
        Self {
            key: key.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        }
    }
}

/// A message ready for a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedMessage {
    pub notification_id: uuid::Uuid,
    pub channel: ChannelKind,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

pub struct TemplateRegistry {
    templates: HashMap<String, MessageTemplate>,
    placeholder: Regex,
}

impl TemplateRegistry {
    pub fn new() -> Result<Self, TemplateError> {
        let placeholder = Regex::new(PLACEHOLDER_PATTERN)
            .map_err(|e| TemplateError::InvalidPattern(e.to_string()))?;

        Ok(Self {
            templates: HashMap::new(),
            placeholder,
        })
    }

    /// Registry preloaded with one template per trigger code.
    pub fn with_defaults() -> Result<Self, TemplateError> {
        let mut registry = Self::new()?;
        for template in default_templates() {
            registry.register(template);
        }
        Ok(registry)
    }

    pub fn register(&mut self, template: MessageTemplate) {
        self.templates.insert(template.key.clone(), template);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.templates.contains_key(key)
    }

    pub fn render(&self, notification: &NotificationRequest) -> Result<RenderedMessage, TemplateError> {
        let template = self
            .templates
            .get(&notification.template_key)
            .ok_or_else(|| TemplateError::UnknownTemplate(notification.template_key.clone()))?;

        Ok(RenderedMessage {
            notification_id: notification.id,
            channel: notification.channel,
            recipient: notification.recipient.clone(),
            subject: self.fill(&template.key, &template.subject, &notification.merge_data)?,
            body: self.fill(&template.key, &template.body, &notification.merge_data)?,
            attachments: calendar_attachments(&template.key, notification)?,
        })
    }

    fn fill(&self, template_key: &str, text: &str, merge_data: &Value) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(text.len());
        let mut last = 0;

        for captures in self.placeholder.captures_iter(text) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };

            let value = merge_data
                .get(name.as_str())
                .and_then(value_as_text)
                .ok_or_else(|| TemplateError::MissingVariable {
                    template: template_key.to_string(),
                    variable: name.as_str().to_string(),
                })?;

            rendered.push_str(&text[last..whole.start()]);
            rendered.push_str(&value);
            last = whole.end();
        }

        rendered.push_str(&text[last..]);
        Ok(rendered)
    }
}

/// Booking confirmations carry the appointment as an `.ics` invitation when its start is known.
fn calendar_attachments(
    template_key: &str,
    notification: &NotificationRequest,
) -> Result<Vec<Attachment>, TemplateError> {
    if notification.trigger_code != TriggerCode::BookConf || notification.channel != ChannelKind::Email {
        return Ok(Vec::new());
    }

    match CalendarEvent::for_appointment(notification) {
        None => Ok(Vec::new()),
        Some(Ok(event)) => Ok(vec![event.to_attachment(Utc::now())]),
        Some(Err(reason)) => Err(TemplateError::InvalidVariable {
            template: template_key.to_string(),
            variable: "appointment_start".to_string(),
            reason,
        }),
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn default_templates() -> Vec<MessageTemplate> {
    vec![
        MessageTemplate::new(
            "booking_confirmation",
            "Your consultation is confirmed",
            "Dear {{patient_first_name}}, your consultation with {{doctor_name}} on {{appointment_datetime_local}} is confirmed. Join here: {{join_link}}",
        ),
        MessageTemplate::new(
            "booking_reminder_24h",
            "Reminder: your consultation is tomorrow",
            "Dear {{patient_first_name}}, this is a reminder of your consultation with {{doctor_name}} on {{appointment_datetime_local}}. Join here: {{join_link}}",
        ),
        MessageTemplate::new(
            "doctor_upcoming_1h",
            "Upcoming consultation",
            "You have a consultation with {{patient_name}} in 1 hour.",
        ),
        MessageTemplate::new(
            "sms_doctor_10m",
            "",
            "Reminder: your consultation starts in 10 minutes. Please join: {{short_link}}",
        ),
        MessageTemplate::new(
            "push_patient_5m",
            "Consultation starting soon",
            "Your consultation with {{doctor_name}} starts in 5 minutes. Tap to join.",
        ),
        MessageTemplate::new(
            "reschedule_confirmation",
            "Your consultation has been rescheduled",
            "Dear {{patient_first_name}}, your consultation with {{doctor_name}} has moved to {{new_appointment_datetime_local}}. Join here: {{join_link}}",
        ),
        MessageTemplate::new(
            "cancellation_confirmation",
            "Your consultation has been cancelled",
            "Dear {{patient_first_name}}, your consultation with {{doctor_name}} scheduled for {{appointment_datetime_local}} has been cancelled.",
        ),
        MessageTemplate::new(
            "post_call_survey",
            "How was your consultation with {{doctor_name}}?",
            "Dear {{patient_first_name}}, thank you for your consultation with {{doctor_name}}. Tell us how it went for appointment {{appointment_id}}.",
        ),
        MessageTemplate::new(
            "doctor_no_show_patient",
            "We're sorry, your doctor was unable to join",
            "Dear {{patient_first_name}}, we apologize that {{doctor_name}} was unable to join your consultation. Your credit has been restored.",
        ),
        MessageTemplate::new(
            "welcome_free_credit",
            "Welcome, your first consultation is on us",
            "Welcome {{first_name}}! A free consultation credit has been added to your account.",
        ),
        MessageTemplate::new(
            "profile_reminder",
            "Complete your profile",
            "Hi {{first_name}}, please complete your health profile before your next consultation.",
        ),
    ]
}
