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

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn post_row(day: &serde_json::Value, post_id: &str) -> serde_json::Value {
    day.get("posts")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("postId").and_then(|v| v.as_str()) == Some(post_id))
        })
        .cloned()
        .expect("post row")
}

#[test]
fn explicit_reassignment_moves_the_guard_and_reverses_the_old_entry() {
    let workspace = temp_dir("rosterd-reassign");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let inst = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "installations.create",
        json!({ "name": "Business Park" }),
    );
    let installation_id = str_field(&inst, "installationId");
    let guard = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "guards.create",
        json!({ "displayName": "Jimenez, Pablo" }),
    );
    let guard_id = str_field(&guard, "guardId");
    let post_a = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "posts.create",
        json!({ "installationId": installation_id, "displayName": "Tower A" }),
    );
    let post_a = str_field(&post_a, "postId");
    let post_b = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "posts.create",
        json!({ "installationId": installation_id, "displayName": "Tower B" }),
    );
    let post_b = str_field(&post_b, "postId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "rates.set",
        json!({
            "installationId": installation_id,
            "kind": "vacant_fill",
            "baseAmount": 20000.0
        }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "daily.fillVacant",
        json!({
            "postId": post_a,
            "date": "2025-07-20",
            "coveringGuardId": guard_id
        }),
    );
    let first_entry = str_field(&first, "ledgerEntryId");

    // Same guard, same date, another post: blocked without the explicit flag.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "daily.fillVacant",
        json!({
            "postId": post_b,
            "date": "2025-07-20",
            "coveringGuardId": guard_id
        }),
    );
    assert_eq!(str_field(&e, "code"), "conflict");

    // With replaceExisting the old assignment is dropped and its ledger
    // entry reversed; the new one is created in the same request.
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "daily.fillVacant",
        json!({
            "postId": post_b,
            "date": "2025-07-20",
            "coveringGuardId": guard_id,
            "replaceExisting": true
        }),
    );
    assert_eq!(
        moved.get("reversedEntryId").and_then(|v| v.as_str()),
        Some(first_entry.as_str())
    );

    let day = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "daily.dateOpen",
        json!({ "installationId": installation_id, "date": "2025-07-20" }),
    );
    let row_a = post_row(&day, &post_a);
    assert!(row_a.get("assignment").map(|v| v.is_null()).unwrap_or(true));
    assert_eq!(row_a.get("displayState").and_then(|v| v.as_str()), Some("off"));
    let row_b = post_row(&day, &post_b);
    assert_eq!(
        row_b.get("displayState").and_then(|v| v.as_str()),
        Some("vacantCovered")
    );

    // One live entry, one reversed entry.
    let ledger = request_ok(&mut stdin, &mut reader, "11", "ledger.list", json!({}));
    let entries = ledger
        .get("entries")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("entries");
    assert_eq!(entries.len(), 2);
    let statuses: Vec<&str> = entries
        .iter()
        .filter_map(|r| r.get("status").and_then(|v| v.as_str()))
        .collect();
    assert!(statuses.contains(&"unpaid"));
    assert!(statuses.contains(&"reversed"));
}
