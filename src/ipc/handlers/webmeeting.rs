use crate::embed::{
    self, CleanupPlan, EmbedMeetingParams, EmbedUserParams, InitMessage, LifecycleMessage,
    StorageSnapshot,
};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::meeting::{self, MeetingRecord};
use crate::provider;
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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_opt_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
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

fn resolve_is_host(rec: &MeetingRecord, params: &serde_json::Value) -> bool {
    meeting::user_is_host(
        rec,
        get_opt_str(params, "providerUserId"),
        get_opt_str(params, "apiIdentifier"),
    )
}

fn str_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must be an array of strings", key),
        ));
    };
    Ok(arr
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect())
}

/// Decide what the meeting page shows: the embedded client with join
/// credentials, the gone-meeting recreate notice, or the availability note.
/// Provider lookups happen host-side; run `meetings.providerSync` first so
/// the stored expired flag reflects the latest lookup.
fn webmeeting_view_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = get_required_str(params, "meetingId")?;
    let rec = meeting::load_meeting(conn, &meeting_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "meeting not found"))?;

    let is_manager = params
        .get("isManager")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let debugging = params
        .get("debugging")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let user_is_host = resolve_is_host(&rec, params);
    let now = now_epoch(params);

    if !rec.exists_on_provider {
        return Ok(json!({
            "view": "recreate",
            "meeting": rec,
            "userIsHost": user_is_host,
            "canRecreate": is_manager,
        }));
    }

    let cfg = super::config::provider_config(conn)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let state = meeting::meeting_state(&rec, now, cfg.first_able_to_join_minutes * 60);

    if !state.available || state.finished {
        let reason = if state.finished {
            "finished"
        } else {
            "not_started"
        };
        return Ok(json!({
            "view": "unavailable",
            "meeting": rec,
            "userIsHost": user_is_host,
            "state": state,
            "reason": reason,
        }));
    }

    let Some(user) = params.get("user") else {
        return Err(HandlerErr::new("bad_params", "missing user"));
    };
    let fullname = get_required_str(user, "fullname")?;
    let email = get_required_str(user, "email")?;
    let lang = get_opt_str(user, "lang").unwrap_or("");

    let Some(meeting_number) = rec.provider_meeting_id else {
        return Err(HandlerErr::new(
            "not_provisioned",
            "meeting has no provider id yet",
        ));
    };
    if cfg.sdk_key.is_empty() || cfg.sdk_secret.is_empty() {
        return Err(HandlerErr::new(
            "provider_not_configured",
            "meeting SDK credentials are not configured",
        ));
    }

    let role = if user_is_host {
        provider::ROLE_HOST
    } else {
        provider::ROLE_PARTICIPANT
    };
    let signature = provider::sdk_signature(
        &cfg.sdk_key,
        &cfg.sdk_secret,
        meeting_number,
        role,
        now,
        cfg.signature_ttl_seconds,
    )
    .map_err(|msg| HandlerErr::new("signature_failed", msg))?;

    let init = InitMessage::new(
        EmbedMeetingParams {
            userishost: user_is_host,
            signature,
            sdk_key: cfg.sdk_key.clone(),
            meeting_id: meeting_number,
            password: rec.password.clone(),
            zak: user_is_host
                .then(|| get_opt_str(params, "zak").map(str::to_string))
                .flatten(),
            tk: (!user_is_host)
                .then(|| get_opt_str(params, "tk").map(str::to_string))
                .flatten(),
            leave_url: get_required_str(params, "leaveUrl")?,
        },
        EmbedUserParams {
            fullname,
            email,
            lang: embed::normalize_locale(lang),
        },
        cfg.sdk_version.clone(),
        debugging,
    );

    Ok(json!({
        "view": "embed",
        "meeting": rec,
        "userIsHost": user_is_host,
        "state": state,
        "init": init,
    }))
}

/// The `zoomLeave` message the embed page posts to its parent frame.
fn webmeeting_leave_model(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let meeting_id = get_required_str(params, "meetingId")?;
    let redirect_url = get_required_str(params, "redirectUrl")?;
    let rec = meeting::load_meeting(conn, &meeting_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "meeting not found"))?;
    let debugging = params
        .get("debugging")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let message = LifecycleMessage::Leave {
        userishost: resolve_is_host(&rec, params),
        redirect_url,
        debugging,
    };
    serde_json::to_value(&message)
        .map_err(|e| HandlerErr::new("server_error", e.to_string()))
}

fn handle_track_keys(req: &Request) -> serde_json::Value {
    let before = match str_list(&req.params, "before") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let current = match str_list(&req.params, "current") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let existing = req.params.get("existing").and_then(|v| v.as_str());

    let snapshot = StorageSnapshot::capture(before);
    let added = snapshot.added_since(current.iter().map(String::as_str));
    let record = embed::record_tracked_keys(existing, &added);
    ok(
        &req.id,
        json!({
            "added": added,
            "record": record,
            "trackerKey": embed::TRACKER_KEY,
        }),
    )
}

fn handle_cleanup_plan(req: &Request) -> serde_json::Value {
    let recorded = req.params.get("recorded").and_then(|v| v.as_str());
    let plan = CleanupPlan::from_record(recorded);
    ok(&req.id, json!(plan))
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
        "webmeeting.viewModel" => Some(with_conn(state, req, webmeeting_view_model)),
        "webmeeting.leaveModel" => Some(with_conn(state, req, webmeeting_leave_model)),
        "webmeeting.trackKeys" => Some(handle_track_keys(req)),
        "webmeeting.cleanupPlan" => Some(handle_cleanup_plan(req)),
        _ => None,
    }
}
