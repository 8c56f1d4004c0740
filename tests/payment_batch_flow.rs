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

/// Three vacant fills on consecutive days, 18000 each.
fn seed_three_entries(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> Vec<String> {
    let inst = request_ok(
        stdin,
        reader,
        "s1",
        "installations.create",
        json!({ "name": "Logistics Hub" }),
    );
    let installation_id = str_field(&inst, "installationId");
    let guard = request_ok(
        stdin,
        reader,
        "s2",
        "guards.create",
        json!({ "displayName": "Soto, Andrea" }),
    );
    let guard_id = str_field(&guard, "guardId");
    let post = request_ok(
        stdin,
        reader,
        "s3",
        "posts.create",
        json!({ "installationId": installation_id, "displayName": "Dock 4" }),
    );
    let post_id = str_field(&post, "postId");
    let _ = request_ok(
        stdin,
        reader,
        "s4",
        "rates.set",
        json!({
            "installationId": installation_id,
            "kind": "vacant_fill",
            "baseAmount": 18000.0
        }),
    );

    let mut entry_ids = Vec::new();
    for (i, date) in ["2025-05-05", "2025-05-06", "2025-05-07"].iter().enumerate() {
        let filled = request_ok(
            stdin,
            reader,
            &format!("s5-{}", i),
            "daily.fillVacant",
            json!({
                "postId": post_id,
                "date": date,
                "coveringGuardId": guard_id
            }),
        );
        entry_ids.push(str_field(&filled, "ledgerEntryId"));
    }
    entry_ids
}

#[test]
fn batch_groups_entries_and_payment_is_terminal() {
    let workspace = temp_dir("rosterd-batch-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let entry_ids = seed_three_entries(&mut stdin, &mut reader);

    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "ledger.createBatch",
        json!({ "entryIds": entry_ids, "note": "May first week" }),
    );
    let batch_id = str_field(&batch, "batchId");
    assert_eq!(
        batch.get("totalAmount").and_then(|v| v.as_f64()),
        Some(54000.0)
    );
    assert_eq!(batch.get("entryCount").and_then(|v| v.as_i64()), Some(3));

    // Every member is batched under the same id.
    let ledger = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "ledger.list",
        json!({ "status": "batched" }),
    );
    let entries = ledger
        .get("entries")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("entries");
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(
            entry.get("batchId").and_then(|v| v.as_str()),
            Some(batch_id.as_str())
        );
    }

    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "ledger.batchGet",
        json!({ "batchId": batch_id }),
    );
    assert_eq!(
        detail.get("entries").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(3)
    );

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "ledger.markBatchPaid",
        json!({ "batchId": batch_id, "operator": "supervisor.ml" }),
    );
    assert_eq!(paid.get("entriesPaid").and_then(|v| v.as_i64()), Some(3));

    let ledger = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "ledger.list",
        json!({ "status": "paid" }),
    );
    let entries = ledger
        .get("entries")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("entries");
    assert_eq!(entries.len(), 3);
    for entry in &entries {
        assert_eq!(
            entry.get("paidBy").and_then(|v| v.as_str()),
            Some("supervisor.ml")
        );
        assert!(entry.get("paidAt").and_then(|v| v.as_str()).is_some());
    }

    // Paid is terminal: no re-pay, no re-batch.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "ledger.markBatchPaid",
        json!({ "batchId": batch_id, "operator": "supervisor.ml" }),
    );
    assert_eq!(str_field(&e, "code"), "invalid_transition");
    let first = ledger
        .get("entries")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .and_then(|entry| entry.get("id"))
        .and_then(|v| v.as_str())
        .expect("first paid entry id")
        .to_string();
    let e = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "ledger.createBatch",
        json!({ "entryIds": [first] }),
    );
    assert_eq!(str_field(&e, "code"), "partial_batch_failure");
}

#[test]
fn direct_entry_payment_skips_batching() {
    let workspace = temp_dir("rosterd-direct-pay");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let entry_ids = seed_three_entries(&mut stdin, &mut reader);

    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "ledger.markEntriesPaid",
        json!({
            "entryIds": [entry_ids[0]],
            "operator": "supervisor.ml",
            "note": "cash advance"
        }),
    );
    assert_eq!(paid.get("entriesPaid").and_then(|v| v.as_i64()), Some(1));

    let remaining = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "ledger.list",
        json!({ "status": "unpaid" }),
    );
    assert_eq!(
        remaining
            .get("entries")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(2)
    );

    // Missing operator is rejected while the default settings require one.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "ledger.markEntriesPaid",
        json!({ "entryIds": [entry_ids[1]] }),
    );
    assert_eq!(str_field(&e, "code"), "bad_params");
}
