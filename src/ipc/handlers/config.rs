use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::report::ReportConfig;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

#[derive(Clone, Copy)]
enum ConfigSection {
    Report,
    Provider,
}

impl ConfigSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "report" => Some(Self::Report),
            "provider" => Some(Self::Provider),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Report => "config.report",
            Self::Provider => "config.provider",
        }
    }
}

fn default_section(section: ConfigSection) -> Value {
    match section {
        ConfigSection::Report => json!({
            "expectedCourseDuration": 0,
            "maxAllowedAbsence": 0,
            "countedStatuses": ["in_meeting"],
            "maskParticipantData": false,
            "passThreshold": 0.8
        }),
        ConfigSection::Provider => json!({
            "sdkKey": "",
            "sdkSecret": "",
            "sdkVersion": "3.1.6",
            "firstAbleToJoinMinutes": 15,
            "signatureTtlSeconds": 7200,
            "apiTimezone": "UTC"
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal config object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_status_list(v: &Value, key: &str) -> Result<Vec<String>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("{} entries must be non-empty strings", key))?;
        if !out.iter().any(|existing| existing == s) {
            out.push(s.to_string());
        }
    }
    if out.is_empty() {
        return Err(format!("{} must keep at least one status", key));
    }
    Ok(out)
}

fn merge_section_patch(
    section: ConfigSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            ConfigSection::Report => match k.as_str() {
                "expectedCourseDuration" | "maxAllowedAbsence" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, i64::MAX)?));
                }
                "countedStatuses" => {
                    obj.insert(k.clone(), Value::from(parse_status_list(v, k)?));
                }
                "maskParticipantData" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "passThreshold" => {
                    let t = v.as_f64().ok_or("passThreshold must be a number")?;
                    if !(0.0..=1.0).contains(&t) {
                        return Err("passThreshold must be in 0.0..=1.0".into());
                    }
                    obj.insert(k.clone(), json!(t));
                }
                _ => return Err(format!("unknown report field: {}", k)),
            },
            ConfigSection::Provider => match k.as_str() {
                "sdkKey" | "sdkSecret" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 256)?));
                }
                "sdkVersion" => {
                    let s = parse_string_max(v, k, 32)?;
                    if s.is_empty() {
                        return Err("sdkVersion must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "firstAbleToJoinMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 60)?));
                }
                "signatureTtlSeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 60, 86_400)?));
                }
                "apiTimezone" => {
                    let s = parse_string_max(v, k, 64)?;
                    if s.is_empty() {
                        return Err("apiTimezone must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown provider field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: ConfigSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block config reads.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Typed report knobs for the aggregation core.
pub fn report_config(conn: &rusqlite::Connection) -> anyhow::Result<ReportConfig> {
    let section = load_section(conn, ConfigSection::Report)?;
    let counted: HashSet<String> = section
        .get("countedStatuses")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(ReportConfig {
        expected_course_duration: section
            .get("expectedCourseDuration")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        max_allowed_absence: section
            .get("maxAllowedAbsence")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        counted_statuses: counted,
        pass_threshold: section
            .get("passThreshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.8),
    })
}

pub fn mask_participant_data(conn: &rusqlite::Connection) -> anyhow::Result<bool> {
    let section = load_section(conn, ConfigSection::Report)?;
    Ok(section
        .get("maskParticipantData")
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

/// Typed provider/embed knobs for the webmeeting handlers.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub sdk_key: String,
    pub sdk_secret: String,
    pub sdk_version: String,
    pub first_able_to_join_minutes: i64,
    pub signature_ttl_seconds: i64,
    pub api_timezone: String,
}

pub fn provider_config(conn: &rusqlite::Connection) -> anyhow::Result<ProviderConfig> {
    let section = load_section(conn, ConfigSection::Provider)?;
    let get_str = |key: &str, fallback: &str| {
        section
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or(fallback)
            .to_string()
    };
    Ok(ProviderConfig {
        sdk_key: get_str("sdkKey", ""),
        sdk_secret: get_str("sdkSecret", ""),
        sdk_version: get_str("sdkVersion", "3.1.6"),
        first_able_to_join_minutes: section
            .get("firstAbleToJoinMinutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(15),
        signature_ttl_seconds: section
            .get("signatureTtlSeconds")
            .and_then(|v| v.as_i64())
            .unwrap_or(7200),
        api_timezone: get_str("apiTimezone", "UTC"),
    })
}

fn handle_config_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let report = match load_section(conn, ConfigSection::Report) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let provider = match load_section(conn, ConfigSection::Provider) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "report": report,
            "provider": provider
        }),
    )
}

fn handle_config_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = ConfigSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "config.get" => Some(handle_config_get(state, req)),
        "config.update" => Some(handle_config_update(state, req)),
        _ => None,
    }
}
