//! Daily reconciliation engine.
//!
//! The monthly plan is the base layer; operator actions record what
//! actually happened as an override on top. The plan is never rewritten
//! from here: undoing a daily decision clears the override, not the plan.

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::coverage::{self, PostRef};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, get_bool_or, get_optional_str, get_required_date, get_required_str, require_guard,
    require_post, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::states::{resolve_display, OverrideState, PlanState, ShiftKind};

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn plan_state_for(
    conn: &Connection,
    post_id: &str,
    date: NaiveDate,
) -> Result<PlanState, HandlerErr> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM plan_days
             WHERE post_id = ? AND year = ? AND month = ? AND day = ?",
            (post_id, date.year(), date.month(), date.day()),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(raw
        .as_deref()
        .and_then(PlanState::parse)
        .unwrap_or(PlanState::Unset))
}

struct OverrideRow {
    state: Option<OverrideState>,
    covering_guard_id: Option<String>,
    note: Option<String>,
}

fn override_for(
    conn: &Connection,
    post_id: &str,
    date: NaiveDate,
) -> Result<Option<OverrideRow>, HandlerErr> {
    conn.query_row(
        "SELECT state, covering_guard_id, note FROM daily_overrides
         WHERE post_id = ? AND date = ?",
        (post_id, date_text(date)),
        |r| {
            let raw: Option<String> = r.get(0)?;
            Ok(OverrideRow {
                state: raw.as_deref().and_then(OverrideState::parse),
                covering_guard_id: r.get(1)?,
                note: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

struct AssignmentRow {
    id: String,
    guard_id: String,
    guard_name: String,
    kind: String,
}

fn assignment_for(
    conn: &Connection,
    post_id: &str,
    date: NaiveDate,
) -> Result<Option<AssignmentRow>, HandlerErr> {
    conn.query_row(
        "SELECT ca.id, ca.guard_id, g.display_name, ca.kind
         FROM coverage_assignments ca
         JOIN guards g ON g.id = ca.guard_id
         WHERE ca.post_id = ? AND ca.date = ?",
        (post_id, date_text(date)),
        |r| {
            Ok(AssignmentRow {
                id: r.get(0)?,
                guard_id: r.get(1)?,
                guard_name: r.get(2)?,
                kind: r.get(3)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

/// Write the override state for (post, date), preserving an existing note
/// unless the action carries its own.
fn upsert_override(
    conn: &Connection,
    post_id: &str,
    date: NaiveDate,
    state: OverrideState,
    covering_guard_id: Option<&str>,
    note: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO daily_overrides(post_id, date, state, covering_guard_id, note)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(post_id, date) DO UPDATE SET
           state = excluded.state,
           covering_guard_id = excluded.covering_guard_id,
           note = COALESCE(excluded.note, daily_overrides.note)",
        (post_id, date_text(date), state.as_str(), covering_guard_id, note),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn date_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let installation_id = get_required_str(params, "installationId")?;
    let date = get_required_date(params, "date")?;

    let exists = conn
        .query_row(
            "SELECT 1 FROM installations WHERE id = ?",
            [&installation_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "installation not found"));
    }

    let is_holiday: bool = conn
        .query_row(
            "SELECT 1 FROM holidays WHERE date = ?",
            [date_text(date)],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();

    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.display_name, p.bound_guard_id, g.display_name,
                    p.start_time, p.end_time
             FROM posts p
             LEFT JOIN guards g ON g.id = p.bound_guard_id
             WHERE p.installation_id = ?
             ORDER BY p.display_name",
        )
        .map_err(db_err)?;
    let posts = stmt
        .query_map([&installation_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut rows = Vec::with_capacity(posts.len());
    for (post_id, display_name, bound_guard_id, bound_guard_name, start_time, end_time) in posts {
        let plan = plan_state_for(conn, &post_id, date)?;
        let override_row = override_for(conn, &post_id, date)?;
        let assignment = assignment_for(conn, &post_id, date)?;
        let is_open = bound_guard_id.is_none();
        let override_state = override_row.as_ref().and_then(|o| o.state);
        let display = resolve_display(plan, override_state, assignment.is_some(), is_open);

        let covering_guard_id = override_row
            .as_ref()
            .and_then(|o| o.covering_guard_id.clone())
            .or_else(|| assignment.as_ref().map(|a| a.guard_id.clone()));
        let covering_guard_name = match covering_guard_id.as_deref() {
            Some(gid) => match assignment.as_ref() {
                Some(a) if a.guard_id == gid => Some(a.guard_name.clone()),
                _ => Some(require_guard(conn, gid)?),
            },
            None => None,
        };

        rows.push(json!({
            "postId": post_id,
            "displayName": display_name,
            "boundGuardId": bound_guard_id,
            "boundGuardName": bound_guard_name,
            "open": is_open,
            "startTime": start_time,
            "endTime": end_time,
            "planState": plan.wire(),
            "overrideState": override_state.map(|s| s.wire()),
            "coveringGuardId": covering_guard_id,
            "coveringGuardName": covering_guard_name,
            "assignment": assignment.as_ref().map(|a| json!({
                "id": a.id,
                "guardId": a.guard_id,
                "guardName": a.guard_name,
                "kind": a.kind,
            })),
            "note": override_row.as_ref().and_then(|o| o.note.clone()),
            "displayState": display.wire(),
        }));
    }

    Ok(json!({
        "date": date_text(date),
        "isHoliday": is_holiday,
        "posts": rows,
    }))
}

fn mark_attended(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    let post = require_post(conn, &post_id)?;
    if post.bound_guard_id.is_none() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "post has no titular guard",
        ));
    }
    let plan = plan_state_for(conn, &post_id, date)?;
    if plan != PlanState::Scheduled {
        return Err(HandlerErr::new(
            "invalid_transition",
            "plan does not schedule this post for that date",
        ));
    }
    if let Some(existing) = override_for(conn, &post_id, date)? {
        match existing.state {
            Some(OverrideState::Attended) => {
                return Ok(json!({ "overrideState": "attended", "unchanged": true }))
            }
            Some(other) => {
                return Err(HandlerErr::with_details(
                    "invalid_transition",
                    "day already holds a different decision; clear it first",
                    json!({ "overrideState": other.wire() }),
                ))
            }
            None => {}
        }
    }
    upsert_override(conn, &post_id, date, OverrideState::Attended, None, None)?;
    Ok(json!({ "overrideState": "attended" }))
}

fn mark_absent_replaced(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    let covering_guard_id = get_required_str(params, "coveringGuardId")?;
    let note = get_optional_str(params, "note");
    let replace_existing = get_bool_or(params, "replaceExisting", false);

    let post = require_post(conn, &post_id)?;
    let Some(titular_id) = post.bound_guard_id.clone() else {
        return Err(HandlerErr::new(
            "invalid_transition",
            "post has no titular guard; use daily.fillVacant",
        ));
    };
    require_guard(conn, &covering_guard_id)?;
    if covering_guard_id == titular_id {
        return Err(HandlerErr::new(
            "invalid_transition",
            "covering guard is the titular guard of this post",
        ));
    }
    if assignment_for(conn, &post_id, date)?.is_some() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "coverage already assigned for this post and date; clear it first",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let outcome = run_assign(
        &tx,
        &covering_guard_id,
        &post,
        date,
        ShiftKind::Replacement,
        note.as_deref(),
        replace_existing,
    )?;
    upsert_override(
        &tx,
        &post_id,
        date,
        OverrideState::AbsentReplaced,
        Some(&covering_guard_id),
        note.as_deref(),
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "overrideState": "absentReplaced",
        "assignmentId": outcome.assignment_id,
        "ledgerEntryId": outcome.ledger_entry_id,
        "amount": outcome.amount,
        "reversedEntryId": outcome.reversed_entry_id,
    }))
}

fn mark_absent_uncovered(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    let note = get_optional_str(params, "note");

    let post = require_post(conn, &post_id)?;
    if post.bound_guard_id.is_none() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "post has no titular guard",
        ));
    }
    if assignment_for(conn, &post_id, date)?.is_some() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "coverage already assigned for this post and date; clear it first",
        ));
    }
    upsert_override(
        conn,
        &post_id,
        date,
        OverrideState::AbsentUncovered,
        None,
        note.as_deref(),
    )?;
    Ok(json!({ "overrideState": "absentUncovered" }))
}

fn mark_leave(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    let kind_raw = get_required_str(params, "kind")?;
    let note = get_optional_str(params, "note");

    let state = match kind_raw.as_str() {
        "leave" => OverrideState::Leave,
        "vacation" => OverrideState::Vacation,
        "medicalLeave" => OverrideState::MedicalLeave,
        _ => {
            return Err(HandlerErr::new(
                "bad_params",
                "kind must be one of: leave, vacation, medicalLeave",
            ))
        }
    };

    let post = require_post(conn, &post_id)?;
    if post.bound_guard_id.is_none() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "post has no titular guard",
        ));
    }
    if assignment_for(conn, &post_id, date)?.is_some() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "coverage already assigned for this post and date; clear it first",
        ));
    }
    upsert_override(conn, &post_id, date, state, None, note.as_deref())?;
    Ok(json!({ "overrideState": state.wire() }))
}

fn fill_vacant(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    let covering_guard_id = get_required_str(params, "coveringGuardId")?;
    let note = get_optional_str(params, "note");
    let replace_existing = get_bool_or(params, "replaceExisting", false);

    let post = require_post(conn, &post_id)?;
    if post.bound_guard_id.is_some() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "post has a titular guard; use daily.markAbsentReplaced",
        ));
    }
    require_guard(conn, &covering_guard_id)?;
    if assignment_for(conn, &post_id, date)?.is_some() {
        return Err(HandlerErr::new(
            "invalid_transition",
            "coverage already assigned for this post and date; clear it first",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let outcome = run_assign(
        &tx,
        &covering_guard_id,
        &post,
        date,
        ShiftKind::VacantFill,
        note.as_deref(),
        replace_existing,
    )?;
    // Vacant coverage has no override row; the display derives from the
    // assignment itself. A note still lands on the day if provided.
    if let Some(n) = note.as_deref() {
        if !n.is_empty() {
            set_day_note(&tx, &post_id, date, n)?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "displayState": "vacantCovered",
        "assignmentId": outcome.assignment_id,
        "ledgerEntryId": outcome.ledger_entry_id,
        "amount": outcome.amount,
        "reversedEntryId": outcome.reversed_entry_id,
    }))
}

fn run_assign(
    tx: &Connection,
    guard_id: &str,
    post: &PostRef,
    date: NaiveDate,
    kind: ShiftKind,
    note: Option<&str>,
    replace_existing: bool,
) -> Result<coverage::AssignOutcome, HandlerErr> {
    coverage::assign_coverage(tx, guard_id, post, date, kind, note, replace_existing)
        .map_err(HandlerErr::from)
}

fn clear_coverage(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    require_post(conn, &post_id)?;
    let Some(assignment) = assignment_for(conn, &post_id, date)? else {
        return Err(HandlerErr::new("not_found", "no coverage to clear"));
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // The ledger row is financial history: flag it reversed, never delete.
    // Batched or paid entries abort the clear before anything changes.
    let reversed_entry_id =
        coverage::reverse_open_entry(&tx, &post_id, date, "coverage cleared by operator")
            .map_err(HandlerErr::from)?;
    tx.execute(
        "DELETE FROM coverage_assignments WHERE id = ?",
        [&assignment.id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM daily_overrides
         WHERE post_id = ? AND date = ? AND state = 'absent_replaced'",
        (&post_id, date_text(date)),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "clearedAssignmentId": assignment.id,
        "reversedEntryId": reversed_entry_id,
    }))
}

fn clear_override(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    require_post(conn, &post_id)?;
    let Some(existing) = override_for(conn, &post_id, date)? else {
        return Err(HandlerErr::new("not_found", "no override for this post and date"));
    };
    if existing.state.is_none() {
        return Err(HandlerErr::new("not_found", "no override for this post and date"));
    }
    if existing.state == Some(OverrideState::AbsentReplaced)
        && assignment_for(conn, &post_id, date)?.is_some()
    {
        return Err(HandlerErr::new(
            "invalid_transition",
            "a coverage assignment depends on this override; use daily.clearCoverage",
        ));
    }

    // The note survives; removing it is its own explicit action.
    if existing.note.is_some() {
        conn.execute(
            "UPDATE daily_overrides SET state = NULL, covering_guard_id = NULL
             WHERE post_id = ? AND date = ?",
            (&post_id, date_text(date)),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    } else {
        conn.execute(
            "DELETE FROM daily_overrides WHERE post_id = ? AND date = ?",
            (&post_id, date_text(date)),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    Ok(json!({ "ok": true }))
}

fn set_day_note(
    conn: &Connection,
    post_id: &str,
    date: NaiveDate,
    text: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO daily_overrides(post_id, date, state, covering_guard_id, note)
         VALUES(?1, ?2, NULL, NULL, ?3)
         ON CONFLICT(post_id, date) DO UPDATE SET
           note = excluded.note",
        (post_id, date_text(date), text),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn set_note(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let date = get_required_date(params, "date")?;
    let text = get_required_str(params, "text")?;
    require_post(conn, &post_id)?;

    if text.is_empty() {
        // Explicit removal. Drop the row entirely when nothing else is on it.
        conn.execute(
            "UPDATE daily_overrides SET note = NULL WHERE post_id = ? AND date = ?",
            (&post_id, date_text(date)),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        conn.execute(
            "DELETE FROM daily_overrides
             WHERE post_id = ? AND date = ? AND state IS NULL AND note IS NULL",
            (&post_id, date_text(date)),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        return Ok(json!({ "note": null }));
    }

    set_day_note(conn, &post_id, date, &text)?;
    Ok(json!({ "note": text }))
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
        "daily.dateOpen" => Some(with_conn(state, req, date_open)),
        "daily.markAttended" => Some(with_conn(state, req, mark_attended)),
        "daily.markAbsentReplaced" => Some(with_conn(state, req, mark_absent_replaced)),
        "daily.markAbsentUncovered" => Some(with_conn(state, req, mark_absent_uncovered)),
        "daily.markLeave" => Some(with_conn(state, req, mark_leave)),
        "daily.fillVacant" => Some(with_conn(state, req, fill_vacant)),
        "daily.clearCoverage" => Some(with_conn(state, req, clear_coverage)),
        "daily.clearOverride" => Some(with_conn(state, req, clear_override)),
        "daily.setNote" => Some(with_conn(state, req, set_note)),
        _ => None,
    }
}
