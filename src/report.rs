use crate::meeting::{self, MeetingRecord};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// One join/leave span for one remote participant within one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub user_id: Option<i64>,
    pub display_name: Option<String>,
    pub join_time: i64,
    pub leave_time: i64,
    pub status: String,
}

/// One provider-reported occurrence of a meeting, with its raw participation
/// records in join order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub uuid: String,
    pub participants: Vec<ParticipantRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Duration,
    StartTime,
}

impl SortKey {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "duration" => Some(Self::Duration),
            "startTime" => Some(Self::StartTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAttendance {
    pub merged_duration: i64,
}

/// Per-meeting slice of the course report: the meeting record, its raw
/// sessions, and the merged per-user attendance (capped at the nominal
/// meeting duration).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingSummary {
    pub meeting: MeetingRecord,
    pub sessions: Vec<SessionDetail>,
    pub users: BTreeMap<i64, UserAttendance>,
    pub no_instances: bool,
}

/// Total non-overlapping seconds `user_id` spent in counted statuses across
/// all sessions of one meeting.
///
/// Records with `leave <= join` contribute nothing; a negative span is a
/// data-quality signal and gets logged. Overlapping and adjacent spans are
/// merged so reconnects and parallel devices are not double-counted. The
/// result is NOT capped here; the caller caps against the meeting's nominal
/// duration.
pub fn merge_attended_seconds(
    sessions: &[SessionDetail],
    user_id: i64,
    counted_statuses: &HashSet<String>,
) -> i64 {
    let mut intervals: Vec<(i64, i64)> = Vec::new();
    for session in sessions {
        for p in &session.participants {
            if p.user_id != Some(user_id) {
                continue;
            }
            if !counted_statuses.contains(&p.status) {
                continue;
            }
            if p.leave_time <= p.join_time {
                if p.leave_time < p.join_time {
                    tracing::warn!(
                        session = %session.uuid,
                        user_id,
                        join = p.join_time,
                        leave = p.leave_time,
                        "participant record leaves before joining; counting zero"
                    );
                }
                continue;
            }
            intervals.push((p.join_time, p.leave_time));
        }
    }
    if intervals.is_empty() {
        return 0;
    }
    intervals.sort_unstable();

    let mut total: i64 = 0;
    let (mut cur_start, mut cur_end) = intervals[0];
    for &(start, end) in &intervals[1..] {
        if start <= cur_end {
            if end > cur_end {
                cur_end = end;
            }
        } else {
            total += cur_end - cur_start;
            cur_start = start;
            cur_end = end;
        }
    }
    total += cur_end - cur_start;
    total
}

fn load_sessions(
    conn: &Connection,
    meeting_id: &str,
    only_user: Option<i64>,
) -> Result<Vec<SessionDetail>, ReportError> {
    let mut stmt = conn
        .prepare("SELECT uuid FROM meeting_sessions WHERE meeting_id = ? ORDER BY uuid")
        .map_err(ReportError::db)?;
    let uuids: Vec<String> = stmt
        .query_map([meeting_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?;

    let mut part_stmt = conn
        .prepare(
            "SELECT user_id, display_name, join_time, leave_time, status
             FROM session_participants
             WHERE session_uuid = ?
             ORDER BY join_time, leave_time",
        )
        .map_err(ReportError::db)?;

    let mut out = Vec::with_capacity(uuids.len());
    for uuid in uuids {
        let mut participants = part_stmt
            .query_map([&uuid], |r| {
                Ok(ParticipantRecord {
                    user_id: r.get(0)?,
                    display_name: r.get(1)?,
                    join_time: r.get(2)?,
                    leave_time: r.get(3)?,
                    status: r.get(4)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(ReportError::db)?;
        if let Some(uid) = only_user {
            participants.retain(|p| p.user_id == Some(uid));
        }
        out.push(SessionDetail { uuid, participants });
    }
    Ok(out)
}

/// Enumerate the course's meetings and compute per-user merged attendance for
/// each. Meetings with no reported sessions still get a summary so the view
/// can render a "no instances yet" entry.
///
/// With `only_user` set, session participant lists are restricted to that
/// user and the users mapping carries exactly that one entry (zero when the
/// user never appears; absence of data is not an error).
pub fn aggregate_course(
    conn: &Connection,
    course_id: i64,
    sort_key: SortKey,
    only_user: Option<i64>,
    counted_statuses: &HashSet<String>,
) -> Result<Vec<MeetingSummary>, ReportError> {
    let meetings = meeting::load_course_meetings(conn, course_id).map_err(ReportError::db)?;

    let mut summaries = Vec::with_capacity(meetings.len());
    for rec in meetings {
        let sessions = load_sessions(conn, &rec.id, only_user)?;

        let user_ids: BTreeSet<i64> = match only_user {
            Some(uid) => std::iter::once(uid).collect(),
            None => sessions
                .iter()
                .flat_map(|s| s.participants.iter())
                .filter_map(|p| p.user_id)
                .collect(),
        };

        let mut users = BTreeMap::new();
        for uid in user_ids {
            let merged = merge_attended_seconds(&sessions, uid, counted_statuses);
            users.insert(
                uid,
                UserAttendance {
                    merged_duration: merged.min(rec.duration),
                },
            );
        }

        let no_instances = sessions.is_empty();
        summaries.push(MeetingSummary {
            meeting: rec,
            sessions,
            users,
            no_instances,
        });
    }

    match sort_key {
        SortKey::Duration => summaries.sort_by(|a, b| {
            (a.meeting.duration, &a.meeting.id).cmp(&(b.meeting.duration, &b.meeting.id))
        }),
        SortKey::StartTime => summaries.sort_by(|a, b| {
            (a.meeting.start_time, &a.meeting.id).cmp(&(b.meeting.start_time, &b.meeting.id))
        }),
    }
    Ok(summaries)
}

/// Course-level report knobs, injected from settings by the handler layer.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub expected_course_duration: i64,
    pub max_allowed_absence: i64,
    pub counted_statuses: HashSet<String>,
    pub pass_threshold: f64,
}

/// One row of the per-meeting detail table: counted-status spans for the
/// report's user, sorted by join time. Presentation data, computed once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailRow {
    pub join_time: i64,
    pub leave_time: i64,
    pub duration: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingReportEntry {
    pub meeting: MeetingRecord,
    pub sessions: Vec<SessionDetail>,
    pub users: BTreeMap<i64, UserAttendance>,
    pub started: bool,
    pub ended: bool,
    pub no_instances: bool,
    pub user_duration: i64,
    pub percent_duration: f64,
    pub passed: bool,
    pub rows: Vec<DetailRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseReportTotals {
    pub expected_total: i64,
    pub total_provided: i64,
    pub total_attended: i64,
    pub absence_subtract: i64,
    pub absence: i64,
    pub max_allowed_absence: i64,
    pub last_ended: i64,
    pub negative_absence_clamped: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseReport {
    pub report_last_update: i64,
    pub meetings: Vec<MeetingReportEntry>,
    pub totals: CourseReportTotals,
    pub no_meetings: bool,
}

/// Build the per-user course attendance report.
///
/// Totals policy: a meeting contributes its nominal duration to "provided"
/// once it has ended by `now`. Meetings that ended after the last report
/// refresh additionally feed the absence-subtract bucket, so attendance data
/// the store has not seen yet is not billed as absence. Attended time counts
/// toward the user regardless of meeting state, already capped per meeting.
pub fn build_course_report(
    conn: &Connection,
    course_id: i64,
    user_id: i64,
    now: i64,
    report_last_update: i64,
    sort_key: SortKey,
    cfg: &ReportConfig,
) -> Result<CourseReport, ReportError> {
    let summaries = aggregate_course(
        conn,
        course_id,
        sort_key,
        Some(user_id),
        &cfg.counted_statuses,
    )?;

    let mut total_provided: i64 = 0;
    let mut total_attended: i64 = 0;
    let mut absence_subtract: i64 = 0;
    let mut last_ended: i64 = 0;

    let no_meetings = summaries.is_empty();
    let mut entries = Vec::with_capacity(summaries.len());

    for summary in summaries {
        let MeetingSummary {
            meeting,
            sessions,
            users,
            no_instances,
        } = summary;

        let started = meeting.start_time <= now;
        let ended = started && meeting.start_time + meeting.duration <= now;
        if ended {
            total_provided += meeting.duration;
            last_ended = last_ended.max(meeting.start_time + meeting.duration);
            if report_last_update < meeting.start_time {
                absence_subtract += meeting.duration;
            }
        }

        let user_duration = users
            .get(&user_id)
            .map(|u| u.merged_duration)
            .unwrap_or(0);
        total_attended += user_duration;

        let percent_duration = if meeting.duration > 0 {
            (user_duration as f64 / meeting.duration as f64).min(1.0)
        } else {
            0.0
        };

        let mut rows: Vec<DetailRow> = sessions
            .iter()
            .flat_map(|s| s.participants.iter())
            .filter(|p| cfg.counted_statuses.contains(&p.status))
            .map(|p| DetailRow {
                join_time: p.join_time,
                leave_time: p.leave_time,
                duration: p.leave_time - p.join_time,
                status: p.status.clone(),
            })
            .collect();
        rows.sort_by_key(|r| (r.join_time, r.leave_time));

        entries.push(MeetingReportEntry {
            passed: percent_duration >= cfg.pass_threshold,
            meeting,
            sessions,
            users,
            started,
            ended,
            no_instances,
            user_duration,
            percent_duration,
            rows,
        });
    }

    let raw_absence = total_provided - total_attended - absence_subtract;
    let negative_absence_clamped = raw_absence < 0;
    if negative_absence_clamped {
        tracing::warn!(
            course_id,
            user_id,
            raw_absence,
            "attended exceeds provided; clamping absence to zero"
        );
    }

    Ok(CourseReport {
        report_last_update,
        meetings: entries,
        totals: CourseReportTotals {
            expected_total: cfg.expected_course_duration,
            total_provided,
            total_attended,
            absence_subtract,
            absence: raw_absence.max(0),
            max_allowed_absence: cfg.max_allowed_absence,
            last_ended,
            negative_absence_clamped,
        },
        no_meetings,
    })
}
