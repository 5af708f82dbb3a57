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

// 2023-11-14T22:13:20Z
const T: i64 = 1_700_000_000;

fn open_workspace(prefix: &str) -> (Child, ChildStdin, BufReader<ChildStdout>, PathBuf) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    (child, stdin, reader, workspace)
}

#[test]
fn create_emits_api_request_and_calendar_event() {
    let (mut child, mut stdin, mut reader, workspace) = open_workspace("webmeet-create");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "meetings.create",
        json!({
            "courseId": 42,
            "name": "Algebra",
            "description": "Weekly session",
            "startTime": T,
            "duration": 3_660,
            "password": "pw",
            "now": T - 86_400
        }),
    );

    let meeting_id = created["meetingId"].as_str().expect("meetingId");
    assert_eq!(created["meeting"]["id"].as_str(), Some(meeting_id));
    assert_eq!(created["meeting"]["existsOnProvider"].as_bool(), Some(true));

    let api = &created["apiRequest"];
    assert_eq!(api["topic"].as_str(), Some("Algebra"));
    assert_eq!(api["type"].as_i64(), Some(2));
    // 3660 seconds is 61 whole minutes on the wire.
    assert_eq!(api["duration"].as_i64(), Some(61));
    assert_eq!(api["start_time"].as_str(), Some("2023-11-14T22:13:20Z"));
    assert_eq!(api["timezone"].as_str(), Some("UTC"));
    assert_eq!(api["settings"]["audio"].as_str(), Some("both"));

    let event = &created["calendarEvent"];
    assert_eq!(event["courseId"].as_i64(), Some(42));
    assert_eq!(event["instance"].as_str(), Some(meeting_id));
    assert_eq!(event["timeStart"].as_i64(), Some(T));
    assert_eq!(event["timeDuration"].as_i64(), Some(3_660));

    // Updates produce the same payloads without the creation-only linkage.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "meetings.update",
        json!({
            "meetingId": meeting_id,
            "patch": { "name": "Algebra II", "duration": 3_600 },
            "now": T
        }),
    );
    assert_eq!(updated["apiRequest"]["topic"].as_str(), Some("Algebra II"));
    assert_eq!(updated["apiRequest"]["duration"].as_i64(), Some(60));
    assert!(updated["calendarEvent"]["courseId"].is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn provider_sync_applies_wire_fields_by_name() {
    let (mut child, mut stdin, mut reader, workspace) = open_workspace("webmeet-sync");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "meetings.create",
        json!({
            "courseId": 42,
            "name": "Algebra",
            "startTime": T,
            "duration": 3_600,
            "now": T - 86_400
        }),
    );
    let meeting_id = created["meetingId"].as_str().expect("meetingId").to_string();

    let synced = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "meetings.providerSync",
        json!({
            "meetingId": meeting_id,
            "response": {
                "id": 987654321,
                "topic": "Algebra (provider title)",
                "duration": 90,
                "join_url": "https://provider.example/j/987654321",
                "settings": { "alternative_hosts": "alt@example.org" }
            }
        }),
    );
    assert_eq!(synced["showRecreate"].as_bool(), Some(false));
    assert_eq!(
        synced["meeting"]["providerMeetingId"].as_i64(),
        Some(987654321)
    );
    // Wire minutes landed as stored seconds.
    assert_eq!(synced["meeting"]["duration"].as_i64(), Some(5_400));

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "meetings.get",
        json!({ "meetingId": meeting_id }),
    );
    assert_eq!(fetched["meeting"]["name"].as_str(), Some("Algebra (provider title)"));
    assert_eq!(
        fetched["meeting"]["joinUrl"].as_str(),
        Some("https://provider.example/j/987654321")
    );
    assert_eq!(
        fetched["meeting"]["alternativeHosts"].as_str(),
        Some("alt@example.org")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn gone_errors_flag_recreate_and_transient_errors_do_not() {
    let (mut child, mut stdin, mut reader, workspace) = open_workspace("webmeet-gone");
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "meetings.create",
        json!({
            "courseId": 42,
            "name": "Algebra",
            "startTime": T,
            "duration": 3_600,
            "now": T - 86_400
        }),
    );
    let meeting_id = created["meetingId"].as_str().expect("meetingId").to_string();

    let transient = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "meetings.providerSync",
        json!({
            "meetingId": meeting_id,
            "error": { "code": 429, "message": "rate limited" }
        }),
    );
    assert_eq!(transient["showRecreate"].as_bool(), Some(false));
    assert_eq!(transient["transient"].as_bool(), Some(true));
    assert_eq!(
        transient["meeting"]["existsOnProvider"].as_bool(),
        Some(true)
    );

    let gone = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "meetings.providerSync",
        json!({
            "meetingId": meeting_id,
            "error": { "code": 3001, "message": "Meeting does not exist" }
        }),
    );
    assert_eq!(gone["showRecreate"].as_bool(), Some(true));
    assert_eq!(gone["meeting"]["existsOnProvider"].as_bool(), Some(false));

    // The meeting page now offers recreation, to managers only.
    let manager_view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "webmeeting.viewModel",
        json!({
            "meetingId": meeting_id,
            "isManager": true,
            "leaveUrl": "https://lms.example/leave",
            "user": { "fullname": "Pat Teacher", "email": "pat@example.org" },
            "now": T
        }),
    );
    assert_eq!(manager_view["view"].as_str(), Some("recreate"));
    assert_eq!(manager_view["canRecreate"].as_bool(), Some(true));

    let student_view = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "webmeeting.viewModel",
        json!({
            "meetingId": meeting_id,
            "leaveUrl": "https://lms.example/leave",
            "user": { "fullname": "Sam Student", "email": "sam@example.org" },
            "now": T
        }),
    );
    assert_eq!(student_view["view"].as_str(), Some("recreate"));
    assert_eq!(student_view["canRecreate"].as_bool(), Some(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
