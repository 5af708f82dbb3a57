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

fn request(
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("webmeet-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(&mut stdin, &mut reader, "3", "config.get", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "config.update",
        json!({ "section": "report", "patch": { "expectedCourseDuration": 36_000 } }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "5",
        "meetings.create",
        json!({
            "courseId": 1,
            "name": "Smoke lesson",
            "startTime": 1_000_000,
            "duration": 600,
            "now": 900_000
        }),
    );
    let meeting_id = created
        .get("result")
        .and_then(|v| v.get("meetingId"))
        .and_then(|v| v.as_str())
        .expect("meetingId")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "meetings.list",
        json!({ "courseId": 1 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "meetings.get",
        json!({ "meetingId": meeting_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "meetings.calendarEvent",
        json!({ "meetingId": meeting_id, "new": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "meetings.providerSync",
        json!({ "meetingId": meeting_id, "response": { "id": 123456 } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "sessions.record",
        json!({
            "meetingId": meeting_id,
            "reportTime": 1_000_700,
            "sessions": [{
                "uuid": "occ-smoke",
                "participants": [
                    { "userId": 7, "join": 1_000_000, "leave": 1_000_600, "status": "in_meeting" }
                ]
            }]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "report.importQosCsv",
        json!({ "path": workspace.join("missing.csv").to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "report.courseModel",
        json!({ "courseId": 1, "requesterId": 7, "now": 1_000_600 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "report.courseAggregate",
        json!({ "courseId": 1, "requesterIsManager": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "webmeeting.viewModel",
        json!({
            "meetingId": meeting_id,
            "leaveUrl": "https://lms.example/leave",
            "user": { "fullname": "Smoke", "email": "smoke@example.org" },
            "now": 2_000_000
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "webmeeting.leaveModel",
        json!({ "meetingId": meeting_id, "redirectUrl": "https://lms.example/back" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "webmeeting.trackKeys",
        json!({ "before": [], "current": ["zm_1"], "existing": null }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "webmeeting.cleanupPlan",
        json!({ "recorded": "zm_1" }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
