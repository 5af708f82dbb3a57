use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::db;
use crate::meeting;

/// One participant span parsed out of a dashboard QoS CSV export.
#[derive(Debug, Clone, PartialEq)]
pub struct QosRow {
    pub provider_meeting_id: i64,
    pub session_uuid: String,
    pub user_id: Option<i64>,
    pub display_name: Option<String>,
    pub join_time: i64,
    pub leave_time: i64,
    pub status: String,
}

/// Outcome counters, reported back to the operator exactly as counted:
/// data rows seen, rows we could not place, participant records inserted,
/// and records that were already present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub total: usize,
    pub skipped: usize,
    pub added: usize,
    pub not_added: usize,
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn normalize_header(s: &str) -> String {
    s.trim()
        .trim_start_matches('\u{feff}')
        .to_ascii_lowercase()
        .replace(['_', '-'], " ")
}

fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Dashboard exports write meeting ids with grouping separators
/// ("933 3240 3193"); keep digits only.
fn parse_meeting_id(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Times arrive either as epoch seconds or as a wall-clock string; the
/// dashboard uses "YYYY-MM-DD HH:MM:SS" (UTC), API exports RFC-3339.
fn parse_time(raw: &str) -> Option<i64> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(epoch) = t.parse::<i64>() {
        return Some(epoch);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp());
    }
    chrono::DateTime::parse_from_rfc3339(t)
        .ok()
        .map(|dt| dt.timestamp())
}

struct HeaderIndex {
    meeting_id: usize,
    session_uuid: usize,
    join_time: usize,
    leave_time: usize,
    user_id: Option<usize>,
    display_name: Option<usize>,
    status: Option<usize>,
}

fn map_header(fields: &[String]) -> Result<HeaderIndex, String> {
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (i, f) in fields.iter().enumerate() {
        by_name.entry(normalize_header(f)).or_insert(i);
    }
    let find = |names: &[&str]| names.iter().find_map(|n| by_name.get(*n).copied());

    let meeting_id = find(&["meeting id", "meeting number"])
        .ok_or("missing 'meeting id' column")?;
    let session_uuid = find(&["session uuid", "uuid", "session id"])
        .ok_or("missing 'session uuid' column")?;
    let join_time = find(&["join time"]).ok_or("missing 'join time' column")?;
    let leave_time = find(&["leave time"]).ok_or("missing 'leave time' column")?;
    Ok(HeaderIndex {
        meeting_id,
        session_uuid,
        join_time,
        leave_time,
        user_id: find(&["user id"]),
        display_name: find(&["participant", "name", "display name"]),
        status: find(&["status"]),
    })
}

/// Parse a QoS CSV export. Rows whose key columns do not parse come back in
/// the second list with a reason, so the caller can count and log them
/// without aborting the import.
pub fn parse_qos_csv(text: &str) -> Result<(Vec<QosRow>, Vec<String>), String> {
    let mut lines = text.lines();
    let header_line = loop {
        match lines.next() {
            Some(l) if l.trim().is_empty() => continue,
            Some(l) => break l,
            None => return Err("empty csv".to_string()),
        }
    };
    let header = map_header(&parse_csv_record(header_line))?;

    let mut rows = Vec::new();
    let mut rejects = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_record(line);
        let get = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");

        let Some(provider_meeting_id) = parse_meeting_id(get(header.meeting_id)) else {
            rejects.push(format!("line {}: bad meeting id", lineno + 2));
            continue;
        };
        let Some(session_uuid) = non_empty_trimmed(get(header.session_uuid)) else {
            rejects.push(format!("line {}: missing session uuid", lineno + 2));
            continue;
        };
        let Some(join_time) = parse_time(get(header.join_time)) else {
            rejects.push(format!("line {}: bad join time", lineno + 2));
            continue;
        };
        let Some(leave_time) = parse_time(get(header.leave_time)) else {
            rejects.push(format!("line {}: bad leave time", lineno + 2));
            continue;
        };

        let user_id = header
            .user_id
            .and_then(|i| non_empty_trimmed(get(i)))
            .and_then(|s| s.parse::<i64>().ok());
        let display_name = header.display_name.and_then(|i| non_empty_trimmed(get(i)));
        let status = header
            .status
            .and_then(|i| non_empty_trimmed(get(i)))
            .unwrap_or_else(|| "in_meeting".to_string());

        rows.push(QosRow {
            provider_meeting_id,
            session_uuid,
            user_id,
            display_name,
            join_time,
            leave_time,
            status,
        });
    }
    Ok((rows, rejects))
}

/// Place parsed rows into the session store. Rows referencing a provider
/// meeting id we do not know are skipped; exact duplicates of an existing
/// record are counted but not inserted. Touched courses get their report
/// freshness stamp bumped to `report_time`.
pub fn apply_qos_rows(
    conn: &Connection,
    rows: &[QosRow],
    rejects: usize,
    report_time: i64,
) -> anyhow::Result<ImportStats> {
    let mut stats = ImportStats {
        total: rows.len() + rejects,
        skipped: rejects,
        ..Default::default()
    };

    let tx = conn.unchecked_transaction()?;
    let mut meeting_cache: HashMap<i64, Option<(String, i64)>> = HashMap::new();
    let mut touched_courses: HashSet<i64> = HashSet::new();

    for row in rows {
        let cached = match meeting_cache.get(&row.provider_meeting_id) {
            Some(v) => v.clone(),
            None => {
                let looked_up = meeting::load_meeting_by_provider_id(&tx, row.provider_meeting_id)?
                    .map(|m| (m.id, m.course_id));
                meeting_cache.insert(row.provider_meeting_id, looked_up.clone());
                looked_up
            }
        };
        let Some((meeting_id, course_id)) = cached else {
            tracing::warn!(
                provider_meeting_id = row.provider_meeting_id,
                "qos row references unknown meeting; skipping"
            );
            stats.skipped += 1;
            continue;
        };
        touched_courses.insert(course_id);

        tx.execute(
            "INSERT OR IGNORE INTO meeting_sessions(uuid, meeting_id) VALUES(?, ?)",
            (&row.session_uuid, &meeting_id),
        )?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM session_participants
                 WHERE session_uuid = ? AND user_id IS ? AND join_time = ?
                   AND leave_time = ? AND status = ?",
                rusqlite::params![
                    row.session_uuid,
                    row.user_id,
                    row.join_time,
                    row.leave_time,
                    row.status
                ],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_some() {
            stats.not_added += 1;
            continue;
        }

        tx.execute(
            "INSERT INTO session_participants(
                id, session_uuid, user_id, display_name, join_time, leave_time, status
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                row.session_uuid,
                row.user_id,
                row.display_name,
                row.join_time,
                row.leave_time,
                row.status
            ],
        )?;
        stats.added += 1;
    }

    for course_id in touched_courses {
        db::bump_report_last_update(&tx, course_id, report_time)?;
    }
    tx.commit()?;
    Ok(stats)
}

/// Participant span in a `sessions.record` request.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInput {
    pub user_id: Option<i64>,
    pub display_name: Option<String>,
    pub join: i64,
    pub leave: i64,
    pub status: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    pub uuid: String,
    #[serde(default)]
    pub participants: Vec<ParticipantInput>,
}

/// Bulk upsert used by the scheduled provider-report fetch: each incoming
/// session replaces its stored participant rows wholesale (the provider's
/// report is the authoritative record for an occurrence).
pub fn record_sessions(
    conn: &Connection,
    meeting_id: &str,
    course_id: i64,
    sessions: &[SessionInput],
    report_time: i64,
) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut recorded = 0usize;
    for session in sessions {
        tx.execute(
            "INSERT OR IGNORE INTO meeting_sessions(uuid, meeting_id) VALUES(?, ?)",
            (&session.uuid, meeting_id),
        )?;
        tx.execute(
            "DELETE FROM session_participants WHERE session_uuid = ?",
            [&session.uuid],
        )?;
        for p in &session.participants {
            tx.execute(
                "INSERT INTO session_participants(
                    id, session_uuid, user_id, display_name, join_time, leave_time, status
                 ) VALUES(?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    session.uuid,
                    p.user_id,
                    p.display_name,
                    p.join,
                    p.leave,
                    p.status
                ],
            )?;
            recorded += 1;
        }
    }
    db::bump_report_last_update(&tx, course_id, report_time)?;
    tx.commit()?;
    Ok(recorded)
}
