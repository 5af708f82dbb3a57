use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::meeting::{self, MeetingRecord};
use crate::provider::{ApiMeetingResponse, ProviderError};
use rusqlite::Connection;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::config;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn now_epoch(params: &serde_json::Value) -> i64 {
    if let Some(now) = params.get("now").and_then(|v| v.as_i64()) {
        return now;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn validate_audio(raw: &str) -> Result<String, HandlerErr> {
    match raw {
        "both" | "telephony" | "voip" => Ok(raw.to_string()),
        other => Err(HandlerErr::new(
            "bad_params",
            format!("audio must be one of: both, telephony, voip (got {})", other),
        )),
    }
}

fn load_meeting_or_err(conn: &Connection, meeting_id: &str) -> Result<MeetingRecord, HandlerErr> {
    meeting::load_meeting(conn, meeting_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "meeting not found"))
}

fn meeting_payloads(
    conn: &Connection,
    rec: &MeetingRecord,
    new: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let cfg = config::provider_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({
        "meeting": rec,
        "apiRequest": rec.to_api_request(&cfg.api_timezone),
        "calendarEvent": rec.to_calendar_event(new),
    }))
}

fn meetings_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_i64(params, "courseId")?;
    let name = get_required_str(params, "name")?;
    let start_time = get_required_i64(params, "startTime")?;
    let duration = get_required_i64(params, "duration")?;
    if duration < 0 {
        return Err(HandlerErr::new("bad_params", "duration must be >= 0"));
    }
    let audio = match get_opt_str(params, "audio") {
        Some(raw) => validate_audio(&raw)?,
        None => "both".to_string(),
    };
    let recurrence_type = params
        .get("recurrenceType")
        .and_then(|v| v.as_i64())
        .unwrap_or(meeting::RECURRENCE_NONE);
    if !(0..=3).contains(&recurrence_type) {
        return Err(HandlerErr::new("bad_params", "recurrenceType must be 0..=3"));
    }
    let now = now_epoch(params);

    let rec = MeetingRecord {
        id: Uuid::new_v4().to_string(),
        course_id,
        name,
        description: get_opt_str(params, "description"),
        start_time,
        duration,
        host_id: get_opt_str(params, "hostId"),
        provider_meeting_id: None,
        password: get_opt_str(params, "password"),
        join_url: None,
        start_url: None,
        timezone: get_opt_str(params, "timezone"),
        alternative_hosts: get_opt_str(params, "alternativeHosts"),
        host_video: params
            .get("hostVideo")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        audio,
        recurrence_type,
        created_at: Some(now),
        time_modified: Some(now),
        exists_on_provider: true,
    };
    meeting::insert_meeting(conn, &rec)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let mut result = meeting_payloads(conn, &rec, true)?;
    if let Some(obj) = result.as_object_mut() {
        obj.insert("meetingId".to_string(), json!(rec.id));
    }
    Ok(result)
}

fn meetings_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = get_required_str(params, "meetingId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "patch must be an object"));
    };

    let mut rec = load_meeting_or_err(conn, &meeting_id)?;
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                rec.name = v
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| HandlerErr::new("bad_params", "name must be string"))?;
            }
            "description" => rec.description = v.as_str().map(str::to_string),
            "startTime" => {
                rec.start_time = v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::new("bad_params", "startTime must be integer"))?;
            }
            "duration" => {
                let d = v
                    .as_i64()
                    .ok_or_else(|| HandlerErr::new("bad_params", "duration must be integer"))?;
                if d < 0 {
                    return Err(HandlerErr::new("bad_params", "duration must be >= 0"));
                }
                rec.duration = d;
            }
            "hostId" => rec.host_id = v.as_str().map(str::to_string),
            "password" => rec.password = v.as_str().map(str::to_string),
            "timezone" => rec.timezone = v.as_str().map(str::to_string),
            "alternativeHosts" => rec.alternative_hosts = v.as_str().map(str::to_string),
            "hostVideo" => {
                rec.host_video = v
                    .as_bool()
                    .ok_or_else(|| HandlerErr::new("bad_params", "hostVideo must be boolean"))?;
            }
            "audio" => {
                let raw = v
                    .as_str()
                    .ok_or_else(|| HandlerErr::new("bad_params", "audio must be string"))?;
                rec.audio = validate_audio(raw)?;
            }
            "recurrenceType" => {
                let r = v.as_i64().ok_or_else(|| {
                    HandlerErr::new("bad_params", "recurrenceType must be integer")
                })?;
                if !(0..=3).contains(&r) {
                    return Err(HandlerErr::new("bad_params", "recurrenceType must be 0..=3"));
                }
                rec.recurrence_type = r;
            }
            other => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("unknown meeting field: {}", other),
                ));
            }
        }
    }
    rec.time_modified = Some(now_epoch(params));
    meeting::update_meeting(conn, &rec)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    meeting_payloads(conn, &rec, false)
}

fn meetings_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = get_required_str(params, "meetingId")?;
    let rec = load_meeting_or_err(conn, &meeting_id)?;
    Ok(json!({ "meeting": rec }))
}

fn meetings_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_i64(params, "courseId")?;
    let meetings = meeting::load_course_meetings(conn, course_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({ "meetings": meetings }))
}

/// Fold the host adapter's provider lookup outcome into the store. A
/// successful response refreshes the record; a permanent "gone" error flips
/// the expired flag so the view switches to the recreate notice; transient
/// errors are logged and the stored record stands.
fn meetings_provider_sync(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = get_required_str(params, "meetingId")?;
    let mut rec = load_meeting_or_err(conn, &meeting_id)?;

    if let Some(raw) = params.get("response") {
        let resp = ApiMeetingResponse::from_json(raw)
            .map_err(|msg| HandlerErr::new("bad_params", msg))?;
        rec.apply_api_response(&resp);
        rec.exists_on_provider = true;
        meeting::update_meeting(conn, &rec)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        return Ok(json!({ "meeting": rec, "showRecreate": false, "transient": false }));
    }

    if let Some(raw) = params.get("error") {
        let provider_err =
            ProviderError::from_json(raw).map_err(|msg| HandlerErr::new("bad_params", msg))?;
        if provider_err.is_meeting_gone() {
            meeting::mark_gone_on_provider(conn, &rec.id)
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            rec.exists_on_provider = false;
            return Ok(json!({ "meeting": rec, "showRecreate": true, "transient": false }));
        }
        tracing::warn!(
            meeting_id = %rec.id,
            code = provider_err.code,
            message = %provider_err.message,
            "transient provider lookup failure; keeping stored record"
        );
        return Ok(json!({ "meeting": rec, "showRecreate": false, "transient": true }));
    }

    Err(HandlerErr::new(
        "bad_params",
        "either response or error is required",
    ))
}

fn meetings_calendar_event(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = get_required_str(params, "meetingId")?;
    let new = params.get("new").and_then(|v| v.as_bool()).unwrap_or(false);
    let rec = load_meeting_or_err(conn, &meeting_id)?;
    Ok(json!({ "event": rec.to_calendar_event(new) }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "meetings.create" => Some(with_conn(state, req, meetings_create)),
        "meetings.update" => Some(with_conn(state, req, meetings_update)),
        "meetings.get" => Some(with_conn(state, req, meetings_get)),
        "meetings.list" => Some(with_conn(state, req, meetings_list)),
        "meetings.providerSync" => Some(with_conn(state, req, meetings_provider_sync)),
        "meetings.calendarEvent" => Some(with_conn(state, req, meetings_calendar_event)),
        _ => None,
    }
}
