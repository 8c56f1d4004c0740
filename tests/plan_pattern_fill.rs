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
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn seed_post(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> (String, String) {
    let inst = request_ok(
        stdin,
        reader,
        "s1",
        "installations.create",
        json!({ "name": "Central Plaza" }),
    );
    let installation_id = str_field(&inst, "installationId");
    let guard = request_ok(
        stdin,
        reader,
        "s2",
        "guards.create",
        json!({ "displayName": "Rojas, Miguel" }),
    );
    let guard_id = str_field(&guard, "guardId");
    let post = request_ok(
        stdin,
        reader,
        "s3",
        "posts.create",
        json!({
            "installationId": installation_id,
            "displayName": "Main Gate",
            "boundGuardId": guard_id,
            "patternCode": "4x4"
        }),
    );
    (installation_id, str_field(&post, "postId"))
}

fn day_states(month_grid: &serde_json::Value, post_id: &str) -> Vec<String> {
    month_grid
        .get("posts")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("postId").and_then(|v| v.as_str()) == Some(post_id))
        })
        .and_then(|row| row.get("days").and_then(|v| v.as_array()))
        .map(|days| {
            days.iter()
                .map(|d| d.as_str().unwrap_or("").to_string())
                .collect()
        })
        .expect("post row with days")
}

#[test]
fn four_by_four_fill_from_day_one() {
    let workspace = temp_dir("rosterd-pattern-4x4");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (installation_id, post_id) = seed_post(&mut stdin, &mut reader);

    let begin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "plan.editBegin",
        json!({ "installationId": installation_id, "year": 2025, "month": 7 }),
    );
    let session_id = str_field(&begin, "sessionId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "plan.editFillPattern",
        json!({
            "sessionId": session_id,
            "postId": post_id,
            "patternCode": "4x4",
            "anchorDay": 1,
            "fromDay": 1
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "plan.editSave",
        json!({ "sessionId": session_id }),
    );

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "plan.monthOpen",
        json!({ "installationId": installation_id, "year": 2025, "month": 7 }),
    );
    let days = day_states(&grid, &post_id);
    assert_eq!(days.len(), 31);
    for (i, state) in days.iter().enumerate() {
        let expected = if (i % 8) < 4 { "scheduled" } else { "off" };
        assert_eq!(state, expected, "day {}", i + 1);
    }
}

#[test]
fn five_by_two_fill_matches_work_week() {
    let workspace = temp_dir("rosterd-pattern-5x2");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (installation_id, post_id) = seed_post(&mut stdin, &mut reader);

    let begin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "plan.editBegin",
        json!({ "installationId": installation_id, "year": 2025, "month": 6 }),
    );
    let session_id = str_field(&begin, "sessionId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "plan.editFillPattern",
        json!({
            "sessionId": session_id,
            "postId": post_id,
            "patternCode": "5x2",
            "anchorDay": 1,
            "fromDay": 1
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "plan.editSave",
        json!({ "sessionId": session_id }),
    );

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "plan.monthOpen",
        json!({ "installationId": installation_id, "year": 2025, "month": 6 }),
    );
    let days = day_states(&grid, &post_id);
    assert_eq!(&days[0..5], &["scheduled"; 5]);
    assert_eq!(&days[5..7], &["off"; 2]);
    assert_eq!(&days[7..12], &["scheduled"; 5]);
}

#[test]
fn partial_fill_preserves_earlier_days() {
    let workspace = temp_dir("rosterd-pattern-partial");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let (installation_id, post_id) = seed_post(&mut stdin, &mut reader);

    let begin = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "plan.editBegin",
        json!({ "installationId": installation_id, "year": 2025, "month": 7 }),
    );
    let session_id = str_field(&begin, "sessionId");

    // Hand-set the first three days, then fill the rest from day 10.
    for (i, (day, state)) in [(1, "off"), (2, "scheduled"), (3, "off")].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("set{}", i),
            "plan.editSetDay",
            json!({
                "sessionId": session_id,
                "postId": post_id,
                "day": day,
                "state": state
            }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "plan.editFillPattern",
        json!({
            "sessionId": session_id,
            "postId": post_id,
            "patternCode": "7x7",
            "anchorDay": 1,
            "fromDay": 10
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "plan.editSave",
        json!({ "sessionId": session_id }),
    );

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "plan.monthOpen",
        json!({ "installationId": installation_id, "year": 2025, "month": 7 }),
    );
    let days = day_states(&grid, &post_id);
    assert_eq!(days[0], "off");
    assert_eq!(days[1], "scheduled");
    assert_eq!(days[2], "off");
    assert_eq!(&days[3..9], &["unset"; 6], "untouched gap before fromDay");
    // Cycle restarts at day 10: seven on, seven off.
    assert_eq!(&days[9..16], &["scheduled"; 7]);
    assert_eq!(&days[16..23], &["off"; 7]);
}
