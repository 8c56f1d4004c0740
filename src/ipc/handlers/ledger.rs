//! Extra-shift ledger and payment batcher.
//!
//! Ledger rows are written by the coverage assigner and are append-only
//! from the scheduling side. Only the operations here may advance an
//! entry's payment status, and `paid`/`reversed` are terminal.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, get_required_str_list, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const BATCH_MAX_ENTRIES: usize = 500;

fn entry_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "guardId": r.get::<_, String>(1)?,
        "guardName": r.get::<_, String>(2)?,
        "postId": r.get::<_, String>(3)?,
        "postName": r.get::<_, String>(4)?,
        "installationId": r.get::<_, String>(5)?,
        "installationName": r.get::<_, String>(6)?,
        "date": r.get::<_, String>(7)?,
        "kind": r.get::<_, String>(8)?,
        "amount": r.get::<_, f64>(9)?,
        "status": r.get::<_, String>(10)?,
        "batchId": r.get::<_, Option<String>>(11)?,
        "paidAt": r.get::<_, Option<String>>(12)?,
        "paidBy": r.get::<_, Option<String>>(13)?,
        "note": r.get::<_, Option<String>>(14)?,
    }))
}

const ENTRY_SELECT: &str = "SELECT es.id, es.guard_id, g.display_name,
        es.post_id, p.display_name, es.installation_id, i.name,
        es.date, es.kind, es.amount, es.status, es.batch_id,
        es.paid_at, es.paid_by, es.note
     FROM extra_shifts es
     JOIN guards g ON g.id = es.guard_id
     JOIN posts p ON p.id = es.post_id
     JOIN installations i ON i.id = es.installation_id";

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let status = get_optional_str(params, "status");
    let installation_id = get_optional_str(params, "installationId");
    let guard_id = get_optional_str(params, "guardId");
    // Optional YYYY-MM filter on the shift date.
    let year_month = get_optional_str(params, "yearMonth");
    if let Some(ym) = year_month.as_deref() {
        let valid = ym.len() == 7
            && ym.as_bytes()[4] == b'-'
            && ym[..4].chars().all(|c| c.is_ascii_digit())
            && ym[5..].chars().all(|c| c.is_ascii_digit());
        if !valid {
            return Err(HandlerErr::new("bad_params", "yearMonth must be YYYY-MM"));
        }
    }

    let sql = format!(
        "{}
         WHERE (?1 IS NULL OR es.status = ?1)
           AND (?2 IS NULL OR es.installation_id = ?2)
           AND (?3 IS NULL OR es.guard_id = ?3)
           AND (?4 IS NULL OR es.date LIKE ?4 || '-%')
         ORDER BY es.date, i.name, p.display_name",
        ENTRY_SELECT
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(
            (&status, &installation_id, &guard_id, &year_month),
            entry_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let total: f64 = rows
        .iter()
        .filter_map(|r| r.get("amount").and_then(|v| v.as_f64()))
        .sum();
    Ok(json!({ "entries": rows, "totalAmount": total }))
}

struct EntryStatus {
    id: String,
    status: String,
    amount: f64,
}

fn load_entry_statuses(
    conn: &Connection,
    entry_ids: &[String],
) -> Result<Vec<EntryStatus>, HandlerErr> {
    let mut found = Vec::with_capacity(entry_ids.len());
    for id in entry_ids {
        let row: Option<EntryStatus> = conn
            .query_row(
                "SELECT id, status, amount FROM extra_shifts WHERE id = ?",
                [id],
                |r| {
                    Ok(EntryStatus {
                        id: r.get(0)?,
                        status: r.get(1)?,
                        amount: r.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)?;
        match row {
            Some(e) => found.push(e),
            None => {
                return Err(HandlerErr::with_details(
                    "not_found",
                    "ledger entry not found",
                    json!({ "entryId": id }),
                ))
            }
        }
    }
    Ok(found)
}

fn create_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let entry_ids = get_required_str_list(params, "entryIds")?;
    let note = get_optional_str(params, "note");
    if entry_ids.is_empty() {
        return Err(HandlerErr::new("bad_params", "entryIds must not be empty"));
    }
    if entry_ids.len() > BATCH_MAX_ENTRIES {
        return Err(HandlerErr::new(
            "bad_params",
            format!("a batch may hold at most {} entries", BATCH_MAX_ENTRIES),
        ));
    }
    let mut deduped = entry_ids.clone();
    deduped.sort();
    deduped.dedup();
    if deduped.len() != entry_ids.len() {
        return Err(HandlerErr::new("bad_params", "entryIds contains duplicates"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // All-or-nothing: every entry must be unpaid, or nothing moves.
    let entries = load_entry_statuses(&tx, &entry_ids)?;
    let ineligible: Vec<serde_json::Value> = entries
        .iter()
        .filter(|e| e.status != "unpaid")
        .map(|e| json!({ "entryId": e.id, "status": e.status }))
        .collect();
    if !ineligible.is_empty() {
        return Err(HandlerErr::with_details(
            "partial_batch_failure",
            "one or more entries are not unpaid; no entry was batched",
            json!({ "ineligible": ineligible }),
        ));
    }

    let batch_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    let total: f64 = entries.iter().map(|e| e.amount).sum();
    tx.execute(
        "INSERT INTO payment_batches(id, created_at, total_amount, entry_count, note)
         VALUES(?, ?, ?, ?, ?)",
        (&batch_id, &created_at, total, entries.len() as i64, &note),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    for e in &entries {
        tx.execute(
            "UPDATE extra_shifts SET status = 'batched', batch_id = ? WHERE id = ?",
            (&batch_id, &e.id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "batchId": batch_id,
        "createdAt": created_at,
        "totalAmount": total,
        "entryCount": entries.len(),
    }))
}

fn batches_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT b.id, b.created_at, b.total_amount, b.entry_count, b.note,
               (SELECT COUNT(*) FROM extra_shifts es
                WHERE es.batch_id = b.id AND es.status = 'paid') AS paid_count
             FROM payment_batches b
             ORDER BY b.created_at DESC",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            let entry_count: i64 = r.get(3)?;
            let paid_count: i64 = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "createdAt": r.get::<_, String>(1)?,
                "totalAmount": r.get::<_, f64>(2)?,
                "entryCount": entry_count,
                "note": r.get::<_, Option<String>>(4)?,
                "settled": paid_count == entry_count,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "batches": rows }))
}

fn batch_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let header: Option<(String, f64, i64, Option<String>)> = conn
        .query_row(
            "SELECT created_at, total_amount, entry_count, note
             FROM payment_batches WHERE id = ?",
            [&batch_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((created_at, total_amount, entry_count, note)) = header else {
        return Err(HandlerErr::new("not_found", "batch not found"));
    };

    let sql = format!("{} WHERE es.batch_id = ? ORDER BY es.date", ENTRY_SELECT);
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let entries = stmt
        .query_map([&batch_id], entry_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({
        "id": batch_id,
        "createdAt": created_at,
        "totalAmount": total_amount,
        "entryCount": entry_count,
        "note": note,
        "entries": entries,
    }))
}

fn payments_settings_require_operator(conn: &Connection) -> Result<bool, HandlerErr> {
    let saved = db::settings_get_json(conn, "setup.payments")
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(saved
        .and_then(|v| v.get("requireOperatorOnPay").and_then(|b| b.as_bool()))
        .unwrap_or(true))
}

fn resolve_operator(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<Option<String>, HandlerErr> {
    let operator = get_optional_str(params, "operator");
    if operator.is_none() && payments_settings_require_operator(conn)? {
        return Err(HandlerErr::new("bad_params", "missing operator"));
    }
    Ok(operator)
}

fn mark_batch_paid(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let operator = resolve_operator(conn, params)?;
    let note = get_optional_str(params, "note");

    let exists = conn
        .query_row(
            "SELECT 1 FROM payment_batches WHERE id = ?",
            [&batch_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "batch not found"));
    }

    let pending: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM extra_shifts WHERE batch_id = ? AND status = 'batched'",
            [&batch_id],
            |r| r.get(0),
        )
        .map_err(db_err)?;
    if pending == 0 {
        return Err(HandlerErr::new(
            "invalid_transition",
            "batch has no entries awaiting payment",
        ));
    }

    let paid_at = Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE extra_shifts
         SET status = 'paid', paid_at = ?, paid_by = ?,
             note = CASE WHEN ?3 IS NULL THEN note ELSE ?3 END
         WHERE batch_id = ? AND status = 'batched'",
        (&paid_at, &operator, &note, &batch_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "batchId": batch_id,
        "paidAt": paid_at,
        "paidBy": operator,
        "entriesPaid": pending,
    }))
}

fn mark_entries_paid(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let entry_ids = get_required_str_list(params, "entryIds")?;
    if entry_ids.is_empty() {
        return Err(HandlerErr::new("bad_params", "entryIds must not be empty"));
    }
    let operator = resolve_operator(conn, params)?;
    let note = get_optional_str(params, "note");

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let entries = load_entry_statuses(&tx, &entry_ids)?;
    // Direct payment accepts unpaid or batched entries; terminal states
    // reject the whole call.
    let ineligible: Vec<serde_json::Value> = entries
        .iter()
        .filter(|e| e.status != "unpaid" && e.status != "batched")
        .map(|e| json!({ "entryId": e.id, "status": e.status }))
        .collect();
    if !ineligible.is_empty() {
        return Err(HandlerErr::with_details(
            "partial_batch_failure",
            "one or more entries are already settled; no entry was paid",
            json!({ "ineligible": ineligible }),
        ));
    }

    let paid_at = Utc::now().to_rfc3339();
    for e in &entries {
        tx.execute(
            "UPDATE extra_shifts
             SET status = 'paid', paid_at = ?, paid_by = ?,
                 note = CASE WHEN ?3 IS NULL THEN note ELSE ?3 END
             WHERE id = ?",
            (&paid_at, &operator, &note, &e.id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "paidAt": paid_at,
        "paidBy": operator,
        "entriesPaid": entries.len(),
    }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ledger.list" => Some(with_conn(state, req, list)),
        "ledger.createBatch" => Some(with_conn(state, req, create_batch)),
        "ledger.batchesList" => Some(with_conn(state, req, |c, _| batches_list(c))),
        "ledger.batchGet" => Some(with_conn(state, req, batch_get)),
        "ledger.markBatchPaid" => Some(with_conn(state, req, mark_batch_paid)),
        "ledger.markEntriesPaid" => Some(with_conn(state, req, mark_entries_paid)),
        _ => None,
    }
}
