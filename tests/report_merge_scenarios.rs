use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_webmeetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn webmeetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

const T: i64 = 2_000_000;

/// Open a workspace, create one meeting of `duration` seconds starting at T,
/// record the given participant spans, and return the user's report entry.
fn entry_for_spans(
    prefix: &str,
    duration: i64,
    spans: serde_json::Value,
) -> (serde_json::Value, Child, PathBuf) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "mk",
        "meetings.create",
        json!({
            "courseId": 1,
            "name": "Lesson",
            "startTime": T,
            "duration": duration,
            "now": T - 86_400
        }),
    );
    let meeting_id = created
        .get("meetingId")
        .and_then(|v| v.as_str())
        .expect("meetingId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "rec",
        "sessions.record",
        json!({
            "meetingId": meeting_id,
            "reportTime": T + duration + 100,
            "sessions": [{ "uuid": "occ-1", "participants": spans }]
        }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "rep",
        "report.courseModel",
        json!({ "courseId": 1, "requesterId": 7, "now": T + duration }),
    );
    drop(stdin);
    (model["meetings"][0].clone(), child, workspace)
}

fn finish(mut child: Child, workspace: PathBuf) {
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn raw_merge_above_nominal_duration_is_capped() {
    let (entry, child, ws) = entry_for_spans(
        "webmeet-merge-cap",
        600,
        json!([
            { "userId": 7, "join": T, "leave": T + 300, "status": "in_meeting" },
            { "userId": 7, "join": T + 250, "leave": T + 950, "status": "in_meeting" }
        ]),
    );
    // Raw merged interval is 950s against a 600s meeting.
    assert_eq!(entry["users"]["7"]["mergedDuration"].as_i64(), Some(600));
    assert_eq!(entry["userDuration"].as_i64(), Some(600));
    assert_eq!(entry["percentDuration"].as_f64(), Some(1.0));
    finish(child, ws);
}

#[test]
fn waiting_room_spans_do_not_count_but_still_merge_rows() {
    let (entry, child, ws) = entry_for_spans(
        "webmeet-merge-status",
        3_600,
        json!([
            { "userId": 7, "join": T, "leave": T + 1_000, "status": "in_waiting_room" },
            { "userId": 7, "join": T + 100, "leave": T + 200, "status": "in_meeting" },
            { "userId": 7, "join": T + 300, "leave": T + 300, "status": "in_meeting" },
            { "userId": 7, "join": T + 500, "leave": T + 400, "status": "in_meeting" }
        ]),
    );
    // Only the real 100s span counts; the zero and negative spans are inert.
    assert_eq!(entry["userDuration"].as_i64(), Some(100));
    // Detail rows keep every counted-status record, join-ordered; the
    // waiting-room span is filtered out of the table.
    let rows = entry["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 3);
    assert!(rows
        .iter()
        .all(|r| r["status"].as_str() == Some("in_meeting")));
    assert_eq!(rows[0]["joinTime"].as_i64(), Some(T + 100));
    finish(child, ws);
}

#[test]
fn merge_result_does_not_depend_on_record_order() {
    let spans_forward = json!([
        { "userId": 7, "join": T, "leave": T + 1_800, "status": "in_meeting" },
        { "userId": 7, "join": T + 1_700, "leave": T + 2_500, "status": "in_meeting" },
        { "userId": 7, "join": T + 3_000, "leave": T + 3_100, "status": "in_meeting" }
    ]);
    let spans_shuffled = json!([
        { "userId": 7, "join": T + 3_000, "leave": T + 3_100, "status": "in_meeting" },
        { "userId": 7, "join": T, "leave": T + 1_800, "status": "in_meeting" },
        { "userId": 7, "join": T + 1_700, "leave": T + 2_500, "status": "in_meeting" }
    ]);
    let (a, child_a, ws_a) = entry_for_spans("webmeet-merge-order-a", 3_600, spans_forward);
    let (b, child_b, ws_b) = entry_for_spans("webmeet-merge-order-b", 3_600, spans_shuffled);
    assert_eq!(a["userDuration"].as_i64(), b["userDuration"].as_i64());
    assert_eq!(a["userDuration"].as_i64(), Some(2_600));
    finish(child_a, ws_a);
    finish(child_b, ws_b);
}

#[test]
fn reconnects_across_sessions_of_one_meeting_do_not_double_count() {
    let workspace = temp_dir("webmeet-merge-sessions");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "mk",
        "meetings.create",
        json!({
            "courseId": 1,
            "name": "Lesson",
            "startTime": T,
            "duration": 3_600,
            "now": T - 86_400
        }),
    );
    let meeting_id = created
        .get("meetingId")
        .and_then(|v| v.as_str())
        .expect("meetingId");

    // Two provider occurrences for one meeting: a dropped call and the
    // rejoin, overlapping across the session boundary.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "rec",
        "sessions.record",
        json!({
            "meetingId": meeting_id,
            "reportTime": T + 4_000,
            "sessions": [
                {
                    "uuid": "occ-a",
                    "participants": [
                        { "userId": 7, "join": T, "leave": T + 1_800, "status": "in_meeting" }
                    ]
                },
                {
                    "uuid": "occ-b",
                    "participants": [
                        { "userId": 7, "join": T + 1_700, "leave": T + 3_600, "status": "in_meeting" }
                    ]
                }
            ]
        }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "rep",
        "report.courseModel",
        json!({ "courseId": 1, "requesterId": 7, "now": T + 3_600 }),
    );
    let entry = &model["meetings"][0];
    assert_eq!(entry["userDuration"].as_i64(), Some(3_600));
    let sessions = entry["sessions"].as_array().expect("sessions");
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["uuid"].as_str(), Some("occ-a"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
