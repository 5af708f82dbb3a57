use crate::meeting::{MeetingRecord, RECURRENCE_NONE};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

/// A meeting as the provider's REST API returns it. `id` is the only field
/// every response carries; everything else is optional and applied only when
/// present. Durations travel in minutes on the wire, start times as RFC-3339
/// strings.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiMeetingResponse {
    pub id: i64,
    pub topic: Option<String>,
    pub agenda: Option<String>,
    pub start_url: Option<String>,
    pub join_url: Option<String>,
    pub created_at: Option<String>,
    pub timezone: Option<String>,
    pub start_time: Option<String>,
    pub duration: Option<i64>,
    #[serde(default)]
    pub settings: ApiMeetingSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiMeetingSettings {
    pub alternative_hosts: Option<String>,
    pub host_video: Option<bool>,
    pub audio: Option<String>,
}

impl ApiMeetingResponse {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value.clone())
            .map_err(|e| format!("provider meeting response: {}", e))
    }
}

/// Outbound create/update payload in the provider's format. Scheduled-only
/// fields (`start_time`, `duration`) are omitted for recurring meetings with
/// no fixed time.
#[derive(Debug, Clone, Serialize)]
pub struct ApiMeetingRequest {
    pub topic: String,
    #[serde(rename = "type")]
    pub meeting_type: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agenda: Option<String>,
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub settings: ApiRequestSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiRequestSettings {
    pub host_video: bool,
    pub audio: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_hosts: Option<String>,
}

// Provider meeting types: scheduled with a fixed start, or recurring with no
// fixed time.
const API_TYPE_SCHEDULED: i64 = 2;
const API_TYPE_RECURRING_NO_TIME: i64 = 3;

fn parse_wire_time(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp())
}

fn format_wire_time(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

impl MeetingRecord {
    /// Fold a provider lookup response into the stored record. Each field is
    /// copied by name; missing wire fields leave the stored value alone.
    pub fn apply_api_response(&mut self, resp: &ApiMeetingResponse) {
        self.provider_meeting_id = Some(resp.id);
        if let Some(topic) = &resp.topic {
            self.name = topic.clone();
        }
        if let Some(agenda) = &resp.agenda {
            self.description = Some(agenda.clone());
        }
        if let Some(url) = &resp.start_url {
            self.start_url = Some(url.clone());
        }
        if let Some(url) = &resp.join_url {
            self.join_url = Some(url.clone());
        }
        if let Some(created) = &resp.created_at {
            if let Some(ts) = parse_wire_time(created) {
                self.created_at = Some(ts);
            }
        }
        if let Some(tz) = &resp.timezone {
            self.timezone = Some(tz.clone());
        }
        if let Some(start) = &resp.start_time {
            if let Some(ts) = parse_wire_time(start) {
                self.start_time = ts;
            }
        }
        // Wire duration is minutes; the store keeps seconds.
        if let Some(minutes) = resp.duration {
            self.duration = minutes * 60;
        }
        if let Some(alt) = &resp.settings.alternative_hosts {
            self.alternative_hosts = Some(alt.clone());
        }
        if let Some(hv) = resp.settings.host_video {
            self.host_video = hv;
        }
        if let Some(audio) = &resp.settings.audio {
            self.audio = audio.clone();
        }
    }

    /// Build the outbound provider payload for this record.
    pub fn to_api_request(&self, default_timezone: &str) -> ApiMeetingRequest {
        let scheduled = self.recurrence_type == RECURRENCE_NONE;
        ApiMeetingRequest {
            topic: self.name.clone(),
            meeting_type: if scheduled {
                API_TYPE_SCHEDULED
            } else {
                API_TYPE_RECURRING_NO_TIME
            },
            agenda: self.description.clone(),
            timezone: self
                .timezone
                .clone()
                .unwrap_or_else(|| default_timezone.to_string()),
            password: self.password.clone(),
            start_time: scheduled.then(|| format_wire_time(self.start_time)),
            // Seconds back to whole minutes, rounding partial minutes up.
            duration: scheduled.then(|| (self.duration + 59) / 60),
            settings: ApiRequestSettings {
                host_video: self.host_video,
                audio: self.audio.clone(),
                alternative_hosts: self.alternative_hosts.clone(),
            },
        }
    }

    /// Host-calendar event for this meeting. `new` events additionally carry
    /// the course/instance linkage the calendar needs at creation time.
    pub fn to_calendar_event(&self, new: bool) -> CalendarEvent {
        CalendarEvent {
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            time_start: self.start_time,
            time_duration: self.duration,
            visible: self.recurrence_type == RECURRENCE_NONE,
            course_id: new.then_some(self.course_id),
            instance: new.then(|| self.id.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub name: String,
    pub description: String,
    pub time_start: i64,
    pub time_duration: i64,
    pub visible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// An error the host adapter got back from the provider API.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderError {
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

// Provider error codes that mean the meeting is permanently gone rather than
// momentarily unreachable.
const ERR_MEETING_NOT_FOUND: i64 = 3001;
const ERR_USER_NOT_FOUND: i64 = 1001;

impl ProviderError {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("provider error: {}", e))
    }

    pub fn is_meeting_gone(&self) -> bool {
        matches!(self.code, Some(ERR_MEETING_NOT_FOUND) | Some(ERR_USER_NOT_FOUND))
    }
}

/// Claim set of the meeting SDK join signature.
#[derive(Debug, Serialize, Deserialize)]
pub struct SdkSignatureClaims {
    #[serde(rename = "appKey")]
    pub app_key: String,
    #[serde(rename = "sdkKey")]
    pub sdk_key: String,
    pub mn: i64,
    pub role: i64,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "tokenExp")]
    pub token_exp: i64,
}

pub const ROLE_PARTICIPANT: i64 = 0;
pub const ROLE_HOST: i64 = 1;

/// HS256 join signature for the embedded meeting client. Issued slightly in
/// the past so small clock skew between us and the provider does not reject
/// a fresh token.
pub fn sdk_signature(
    sdk_key: &str,
    sdk_secret: &str,
    meeting_number: i64,
    role: i64,
    now: i64,
    ttl_seconds: i64,
) -> Result<String, String> {
    let iat = now - 30;
    let exp = iat + ttl_seconds;
    let claims = SdkSignatureClaims {
        app_key: sdk_key.to_string(),
        sdk_key: sdk_key.to_string(),
        mn: meeting_number,
        role,
        iat,
        exp,
        token_exp: exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(sdk_secret.as_bytes()),
    )
    .map_err(|e| format!("sdk signature: {}", e))
}
