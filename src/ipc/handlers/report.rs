use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, SortKey};
use rusqlite::Connection;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

struct HandlerErr {
    code: String,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn from_report(e: crate::report::ReportError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn parse_sort_key(params: &serde_json::Value) -> Result<SortKey, HandlerErr> {
    match params.get("sortKey").and_then(|v| v.as_str()) {
        None => Ok(SortKey::Duration),
        Some(raw) => SortKey::parse(raw).ok_or_else(|| HandlerErr {
            code: "bad_params".to_string(),
            message: "sortKey must be one of: duration, startTime".to_string(),
            details: Some(json!({ "sortKey": raw })),
        }),
    }
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

fn require_unmasked(conn: &Connection) -> Result<(), HandlerErr> {
    let masked = super::config::mask_participant_data(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if masked {
        // Site policy hides participation data entirely; refuse before any fetch.
        return Err(HandlerErr::new(
            "participant_data_masked",
            "participant data is not available on this site",
        ));
    }
    Ok(())
}

/// Per-user course report: the merged attendance detail plus course totals.
/// A viewer may always ask for their own report; someone else's requires the
/// manager capability asserted by the host platform.
fn report_course_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_i64(params, "courseId")?;
    let requester_id = get_required_i64(params, "requesterId")?;
    let requester_is_manager = params
        .get("requesterIsManager")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let user_id = params
        .get("userId")
        .and_then(|v| v.as_i64())
        .unwrap_or(requester_id);
    let sort_key = parse_sort_key(params)?;
    let now = now_epoch(params);

    require_unmasked(conn)?;
    if user_id != requester_id && !requester_is_manager {
        return Err(HandlerErr::new(
            "no_permission",
            "viewing another user's report requires the manager capability",
        ));
    }

    let cfg = super::config::report_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let report_last_update = db::report_last_update(conn, course_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let model = report::build_course_report(
        conn,
        course_id,
        user_id,
        now,
        report_last_update,
        sort_key,
        &cfg,
    )
    .map_err(HandlerErr::from_report)?;

    let mut payload = json!(model);
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("courseId".to_string(), json!(course_id));
        obj.insert("userId".to_string(), json!(user_id));
        obj.insert("now".to_string(), json!(now));
    }
    Ok(payload)
}

/// Raw aggregator output over every user in the course's sessions. Manager
/// capability required: this is the teacher-facing participants view.
fn report_course_aggregate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_i64(params, "courseId")?;
    let requester_is_manager = params
        .get("requesterIsManager")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let sort_key = parse_sort_key(params)?;
    let only_user = params.get("userId").and_then(|v| v.as_i64());

    require_unmasked(conn)?;
    if !requester_is_manager {
        return Err(HandlerErr::new(
            "no_permission",
            "the course aggregate requires the manager capability",
        ));
    }

    let cfg = super::config::report_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let summaries =
        report::aggregate_course(conn, course_id, sort_key, only_user, &cfg.counted_statuses)
            .map_err(HandlerErr::from_report)?;
    let report_last_update = db::report_last_update(conn, course_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({
        "courseId": course_id,
        "reportLastUpdate": report_last_update,
        "meetings": summaries,
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
        "report.courseModel" => Some(with_conn(state, req, report_course_model)),
        "report.courseAggregate" => Some(with_conn(state, req, report_course_aggregate)),
        _ => None,
    }
}
