use crate::ingest::{self, SessionInput};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::meeting;
use rusqlite::Connection;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

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

fn report_time(params: &serde_json::Value) -> i64 {
    if let Some(t) = params.get("reportTime").and_then(|v| v.as_i64()) {
        return t;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Scheduled ingestion entry point: the host's provider-report fetch hands
/// over the occurrences it pulled for one meeting.
fn sessions_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = params
        .get("meetingId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing meetingId"))?;
    let rec = meeting::load_meeting(conn, meeting_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "meeting not found"))?;

    let sessions_raw = params
        .get("sessions")
        .cloned()
        .ok_or_else(|| HandlerErr::new("bad_params", "missing sessions"))?;
    let sessions: Vec<SessionInput> = serde_json::from_value(sessions_raw).map_err(|e| {
        HandlerErr {
            code: "bad_params",
            message: format!("sessions: {}", e),
            details: None,
        }
    })?;
    for session in &sessions {
        if session.uuid.trim().is_empty() {
            return Err(HandlerErr::new("bad_params", "session uuid must not be empty"));
        }
        for p in &session.participants {
            if p.status.trim().is_empty() {
                return Err(HandlerErr::new("bad_params", "participant status must not be empty"));
            }
        }
    }

    let recorded = ingest::record_sessions(
        conn,
        &rec.id,
        rec.course_id,
        &sessions,
        report_time(params),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({
        "meetingId": rec.id,
        "sessions": sessions.len(),
        "participants": recorded,
    }))
}

/// Manual catch-up path: place a dashboard QoS CSV export into the session
/// store. Mirrors the operator workflow of downloading the file and feeding
/// it in when the scheduled fetch missed an occurrence.
fn import_qos_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let path = params
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing path"))?;
    let text = std::fs::read_to_string(path).map_err(|e| HandlerErr {
        code: "file_read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": path })),
    })?;

    let (rows, rejects) =
        ingest::parse_qos_csv(&text).map_err(|msg| HandlerErr::new("bad_csv", msg))?;
    for reason in &rejects {
        tracing::warn!(path, %reason, "qos csv row rejected");
    }

    let stats = ingest::apply_qos_rows(conn, &rows, rejects.len(), report_time(params))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({
        "total": stats.total,
        "skipped": stats.skipped,
        "added": stats.added,
        "notAdded": stats.not_added,
    }))
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
        "sessions.record" => Some(with_conn(state, req, sessions_record)),
        "report.importQosCsv" => Some(with_conn(state, req, import_qos_csv)),
        _ => None,
    }
}
