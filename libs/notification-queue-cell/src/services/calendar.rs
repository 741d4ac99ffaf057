//! iCalendar invitations attached to booking confirmations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::NotificationRequest;

const ICS_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const DEFAULT_DURATION_MINUTES: i64 = 30;

/// File sent alongside a message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub uid: String,
    pub summary: String,
    pub description: String,
    pub location: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub url: Option<String>,
}

impl CalendarEvent {
    /// Event for the appointment of a notification. Needs `appointment_start` (RFC 3339)
    /// in the merge data; `duration_minutes`, `doctor_name` and `join_link` are optional.
    pub fn for_appointment(notification: &NotificationRequest) -> Option<Result<Self, String>> {
        let appointment_id = notification.appointment_id?;
        let data = &notification.merge_data;
        let raw_start = data.get("appointment_start")?.as_str()?;

        let starts_at = match DateTime::parse_from_rfc3339(raw_start) {
            Ok(starts_at) => starts_at.with_timezone(&Utc),
            Err(e) => return Some(Err(format!("appointment_start {:?}: {}", raw_start, e))),
        };
        let minutes = data
            .get("duration_minutes")
            .and_then(Value::as_i64)
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_DURATION_MINUTES);

        let doctor = data.get("doctor_name").and_then(Value::as_str).unwrap_or("your doctor");
        let join_link = data.get("join_link").and_then(Value::as_str).map(str::to_string);
        let location = match &join_link {
            Some(link) => format!("Video consultation: {}", link),
            None => "Video consultation".to_string(),
        };

        Some(Ok(Self {
            uid: format!("appointment-{}@clinic", appointment_id),
            summary: format!("Consultation with {}", doctor),
            description: format!("Video consultation with {}. Please join a few minutes early.", doctor),
            location,
            starts_at,
            ends_at: starts_at + Duration::minutes(minutes),
            url: join_link,
        }))
    }

    pub fn to_ics(&self, stamp: DateTime<Utc>) -> String {
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            "PRODID:-//Clinic Notifications//EN".to_string(),
            "METHOD:REQUEST".to_string(),
            "CALSCALE:GREGORIAN".to_string(),
            "BEGIN:VEVENT".to_string(),
            format!("UID:{}", self.uid),
            format!("DTSTAMP:{}", stamp.format(ICS_DATE_FORMAT)),
            format!("DTSTART:{}", self.starts_at.format(ICS_DATE_FORMAT)),
            format!("DTEND:{}", self.ends_at.format(ICS_DATE_FORMAT)),
            format!("SUMMARY:{}", escape(&self.summary)),
            format!("DESCRIPTION:{}", escape(&self.description)),
            format!("LOCATION:{}", escape(&self.location)),
            "STATUS:CONFIRMED".to_string(),
        ];
        if let Some(url) = &self.url {
            lines.push(format!("URL:{}", url));
        }
        lines.extend(
            [
                "BEGIN:VALARM",
                "TRIGGER:-PT15M",
                "DESCRIPTION:Appointment reminder",
                "ACTION:DISPLAY",
                "END:VALARM",
                "END:VEVENT",
                "END:VCALENDAR",
            ]
            .map(str::to_string),
        );

        lines.join("\r\n")
    }

    pub fn to_attachment(&self, stamp: DateTime<Utc>) -> Attachment {
        Attachment {
            filename: "appointment.ics".to_string(),
            content_type: "text/calendar".to_string(),
            content: self.to_ics(stamp),
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace("\r\n", "\\n")
        .replace('\n', "\\n")
}
