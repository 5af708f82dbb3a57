use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

// Recurrence values stored in `meetings.recurrence_type`.
pub const RECURRENCE_NONE: i64 = 0;
#[allow(dead_code)]
pub const RECURRENCE_DAILY: i64 = 1;
#[allow(dead_code)]
pub const RECURRENCE_WEEKLY: i64 = 2;
#[allow(dead_code)]
pub const RECURRENCE_MONTHLY: i64 = 3;

/// A scheduled meeting definition within a course.
///
/// One row in `meetings`; the provider-side occurrence records live in
/// `meeting_sessions` / `session_participants` and are joined at report time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    pub id: String,
    pub course_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub start_time: i64,
    pub duration: i64,
    pub host_id: Option<String>,
    pub provider_meeting_id: Option<i64>,
    pub password: Option<String>,
    pub join_url: Option<String>,
    pub start_url: Option<String>,
    pub timezone: Option<String>,
    pub alternative_hosts: Option<String>,
    pub host_video: bool,
    pub audio: String,
    pub recurrence_type: i64,
    pub created_at: Option<i64>,
    pub time_modified: Option<i64>,
    pub exists_on_provider: bool,
}

const MEETING_COLUMNS: &str = "id, course_id, name, description, start_time, duration, host_id,
     provider_meeting_id, password, join_url, start_url, timezone, alternative_hosts,
     host_video, audio, recurrence_type, created_at, time_modified, exists_on_provider";

fn meeting_from_row(row: &Row) -> rusqlite::Result<MeetingRecord> {
    Ok(MeetingRecord {
        id: row.get(0)?,
        course_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        start_time: row.get(4)?,
        duration: row.get(5)?,
        host_id: row.get(6)?,
        provider_meeting_id: row.get(7)?,
        password: row.get(8)?,
        join_url: row.get(9)?,
        start_url: row.get(10)?,
        timezone: row.get(11)?,
        alternative_hosts: row.get(12)?,
        host_video: row.get::<_, i64>(13)? != 0,
        audio: row.get(14)?,
        recurrence_type: row.get(15)?,
        created_at: row.get(16)?,
        time_modified: row.get(17)?,
        exists_on_provider: row.get::<_, i64>(18)? != 0,
    })
}

pub fn load_meeting(conn: &Connection, id: &str) -> anyhow::Result<Option<MeetingRecord>> {
    let sql = format!("SELECT {} FROM meetings WHERE id = ?", MEETING_COLUMNS);
    let rec = conn
        .query_row(&sql, [id], meeting_from_row)
        .optional()?;
    Ok(rec)
}

pub fn load_meeting_by_provider_id(
    conn: &Connection,
    provider_meeting_id: i64,
) -> anyhow::Result<Option<MeetingRecord>> {
    let sql = format!(
        "SELECT {} FROM meetings WHERE provider_meeting_id = ? ORDER BY id LIMIT 1",
        MEETING_COLUMNS
    );
    let rec = conn
        .query_row(&sql, [provider_meeting_id], meeting_from_row)
        .optional()?;
    Ok(rec)
}

pub fn load_course_meetings(
    conn: &Connection,
    course_id: i64,
) -> anyhow::Result<Vec<MeetingRecord>> {
    let sql = format!(
        "SELECT {} FROM meetings WHERE course_id = ? ORDER BY start_time, id",
        MEETING_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course_id], meeting_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_meeting(conn: &Connection, rec: &MeetingRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO meetings(
            id, course_id, name, description, start_time, duration, host_id,
            provider_meeting_id, password, join_url, start_url, timezone, alternative_hosts,
            host_video, audio, recurrence_type, created_at, time_modified, exists_on_provider
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            rec.id,
            rec.course_id,
            rec.name,
            rec.description,
            rec.start_time,
            rec.duration,
            rec.host_id,
            rec.provider_meeting_id,
            rec.password,
            rec.join_url,
            rec.start_url,
            rec.timezone,
            rec.alternative_hosts,
            rec.host_video as i64,
            rec.audio,
            rec.recurrence_type,
            rec.created_at,
            rec.time_modified,
            rec.exists_on_provider as i64,
        ],
    )?;
    Ok(())
}

pub fn update_meeting(conn: &Connection, rec: &MeetingRecord) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE meetings SET
            course_id = ?, name = ?, description = ?, start_time = ?, duration = ?,
            host_id = ?, provider_meeting_id = ?, password = ?, join_url = ?, start_url = ?,
            timezone = ?, alternative_hosts = ?, host_video = ?, audio = ?,
            recurrence_type = ?, created_at = ?, time_modified = ?, exists_on_provider = ?
         WHERE id = ?",
        rusqlite::params![
            rec.course_id,
            rec.name,
            rec.description,
            rec.start_time,
            rec.duration,
            rec.host_id,
            rec.provider_meeting_id,
            rec.password,
            rec.join_url,
            rec.start_url,
            rec.timezone,
            rec.alternative_hosts,
            rec.host_video as i64,
            rec.audio,
            rec.recurrence_type,
            rec.created_at,
            rec.time_modified,
            rec.exists_on_provider as i64,
            rec.id,
        ],
    )?;
    Ok(())
}

pub fn mark_gone_on_provider(conn: &Connection, id: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE meetings SET exists_on_provider = 0 WHERE id = ?",
        [id],
    )?;
    Ok(())
}

/// Timing state of a meeting relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingState {
    pub in_progress: bool,
    pub available: bool,
    pub finished: bool,
}

/// A recurring meeting has no single occurrence window: it is always joinable
/// and never finished. Scheduled meetings open `join_lead_in` seconds before
/// the start time and close at start + duration.
pub fn meeting_state(rec: &MeetingRecord, now: i64, join_lead_in: i64) -> MeetingState {
    if rec.recurrence_type != RECURRENCE_NONE {
        return MeetingState {
            in_progress: false,
            available: true,
            finished: false,
        };
    }
    let end = rec.start_time + rec.duration;
    let in_progress = rec.start_time <= now && now < end;
    let finished = now >= end;
    let available = now >= rec.start_time - join_lead_in && !finished;
    MeetingState {
        in_progress,
        available,
        finished,
    }
}

/// Alternative hosts arrive from the provider as one string, separated by
/// commas or semicolons.
pub fn alternative_host_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether a viewer counts as host of the meeting: either the real host
/// (provider user id match) or listed among the alternative hosts (provider
/// api identifier match).
pub fn user_is_host(
    rec: &MeetingRecord,
    provider_user_id: Option<&str>,
    api_identifier: Option<&str>,
) -> bool {
    if let (Some(uid), Some(host)) = (provider_user_id, rec.host_id.as_deref()) {
        if uid == host {
            return true;
        }
    }
    if let Some(ident) = api_identifier {
        return alternative_host_list(rec.alternative_hosts.as_deref())
            .iter()
            .any(|h| h == ident);
    }
    false
}
