//! Monthly plan store.
//!
//! Planners edit a month through an explicit session: `editBegin` loads a
//! snapshot and a working copy, the edit calls mutate the working copy in
//! memory, and `editSave` diffs against the snapshot and persists only the
//! changed cells, guarded by per-post plan versions. Daily-operations data
//! is never touched from here.

use std::collections::HashMap;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, get_required_i32, get_required_str, get_required_u32, HandlerErr,
};
use crate::ipc::types::{AppState, PlanEditSession, Request};
use crate::pattern;
use crate::states::PlanState;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct PostRow {
    id: String,
    display_name: String,
    bound_guard_name: Option<String>,
    pattern_code: String,
}

fn month_params(params: &serde_json::Value) -> Result<(i32, u32, u32), HandlerErr> {
    let year = get_required_i32(params, "year")?;
    let month = get_required_u32(params, "month")?;
    let days = pattern::days_in_month(year, month)
        .ok_or_else(|| HandlerErr::new("bad_params", "month must be between 1 and 12"))?;
    Ok((year, month, days))
}

fn installation_posts(
    conn: &Connection,
    installation_id: &str,
) -> Result<Vec<PostRow>, HandlerErr> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM installations WHERE id = ?",
            [installation_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "installation not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.display_name, g.display_name, p.pattern_code
             FROM posts p
             LEFT JOIN guards g ON g.id = p.bound_guard_id
             WHERE p.installation_id = ?
             ORDER BY p.display_name",
        )
        .map_err(db_err)?;
    stmt.query_map([installation_id], |r| {
        Ok(PostRow {
            id: r.get(0)?,
            display_name: r.get(1)?,
            bound_guard_name: r.get(2)?,
            pattern_code: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

fn load_cells(
    conn: &Connection,
    installation_id: &str,
    year: i32,
    month: u32,
) -> Result<HashMap<(String, u32), PlanState>, HandlerErr> {
    let mut cells = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT pd.post_id, pd.day, pd.state
             FROM plan_days pd
             JOIN posts p ON p.id = pd.post_id
             WHERE p.installation_id = ? AND pd.year = ? AND pd.month = ?",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((installation_id, year, month), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? as u32,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (post_id, day, raw) in rows {
        // Unknown legacy codes read as unset rather than poisoning the grid.
        if let Some(state @ (PlanState::Scheduled | PlanState::Off)) = PlanState::parse(&raw) {
            cells.insert((post_id, day), state);
        }
    }
    Ok(cells)
}

fn load_versions(
    conn: &Connection,
    posts: &[PostRow],
    year: i32,
    month: u32,
) -> Result<HashMap<String, i64>, HandlerErr> {
    let mut versions = HashMap::new();
    for p in posts {
        let v: Option<i64> = conn
            .query_row(
                "SELECT version FROM plan_months WHERE post_id = ? AND year = ? AND month = ?",
                (&p.id, year, month),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        versions.insert(p.id.clone(), v.unwrap_or(0));
    }
    Ok(versions)
}

fn grid_json(
    posts: &[PostRow],
    cells: &HashMap<(String, u32), PlanState>,
    versions: &HashMap<String, i64>,
    days: u32,
) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = posts
        .iter()
        .map(|p| {
            let day_states: Vec<&str> = (1..=days)
                .map(|d| {
                    cells
                        .get(&(p.id.clone(), d))
                        .copied()
                        .unwrap_or(PlanState::Unset)
                        .wire()
                })
                .collect();
            json!({
                "postId": p.id,
                "displayName": p.display_name,
                "boundGuardName": p.bound_guard_name,
                "patternCode": p.pattern_code,
                "version": versions.get(&p.id).copied().unwrap_or(0),
                "days": day_states,
            })
        })
        .collect();
    json!({ "daysInMonth": days, "posts": rows })
}

fn handle_month_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = (|| -> Result<_, HandlerErr> {
        let installation_id = get_required_str(&req.params, "installationId")?;
        let (year, month, days) = month_params(&req.params)?;
        let posts = installation_posts(conn, &installation_id)?;
        let cells = load_cells(conn, &installation_id, year, month)?;
        let versions = load_versions(conn, &posts, year, month)?;
        Ok(grid_json(&posts, &cells, &versions, days))
    })();
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_edit_begin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let loaded = (|| -> Result<_, HandlerErr> {
        let installation_id = get_required_str(&req.params, "installationId")?;
        let (year, month, days) = month_params(&req.params)?;
        let posts = installation_posts(conn, &installation_id)?;
        let cells = load_cells(conn, &installation_id, year, month)?;
        let versions = load_versions(conn, &posts, year, month)?;
        Ok((installation_id, year, month, days, posts, cells, versions))
    })();
    let (installation_id, year, month, days, posts, cells, versions) = match loaded {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let session_id = Uuid::new_v4().to_string();
    let grid = grid_json(&posts, &cells, &versions, days);
    state.plan_sessions.insert(
        session_id.clone(),
        PlanEditSession {
            installation_id,
            year,
            month,
            days_in_month: days,
            post_ids: posts.iter().map(|p| p.id.clone()).collect(),
            base_versions: versions,
            snapshot: cells.clone(),
            working: cells,
        },
    );
    let mut result = grid;
    result["sessionId"] = json!(session_id);
    ok(&req.id, result)
}

fn session_mut<'a>(
    sessions: &'a mut HashMap<String, PlanEditSession>,
    params: &serde_json::Value,
) -> Result<(&'a mut PlanEditSession, String), HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let session = sessions
        .get_mut(&session_id)
        .ok_or_else(|| HandlerErr::new("not_found", "no such edit session"))?;
    Ok((session, session_id))
}

fn handle_edit_set_day(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let (session, _) = session_mut(&mut state.plan_sessions, &req.params)?;
        let post_id = get_required_str(&req.params, "postId")?;
        if !session.post_ids.contains(&post_id) {
            return Err(HandlerErr::new("not_found", "post is not part of this session"));
        }
        let day = get_required_u32(&req.params, "day")?;
        if day == 0 || day > session.days_in_month {
            return Err(HandlerErr::new("bad_params", "day out of range for month"));
        }
        let state_raw = get_required_str(&req.params, "state")?;
        let new_state = match PlanState::parse(&state_raw) {
            Some(s @ (PlanState::Scheduled | PlanState::Off)) => s,
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "state must be one of: scheduled, off",
                ))
            }
        };
        session.working.insert((post_id, day), new_state);
        Ok(json!({ "ok": true }))
    })();
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_edit_fill_pattern(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let result = (|| {
        let (strict, default_code) = planning_settings(conn)?;
        let (session, _) = session_mut(&mut state.plan_sessions, &req.params)?;
        let post_id = get_required_str(&req.params, "postId")?;
        if !session.post_ids.contains(&post_id) {
            return Err(HandlerErr::new("not_found", "post is not part of this session"));
        }
        let raw_code = get_required_str(&req.params, "patternCode")?;
        let code = pattern::parse_code(&raw_code, strict, default_code)
            .map_err(|msg| HandlerErr::with_details("bad_params", msg, json!({ "patternCode": raw_code })))?;
        let anchor = get_required_u32(&req.params, "anchorDay")?;
        if !pattern::anchor_in_range(code, anchor) {
            return Err(HandlerErr::with_details(
                "bad_params",
                format!("anchorDay must be in 1..={}", code.cycle_len()),
                json!({ "patternCode": code.as_str() }),
            ));
        }
        let from_day = get_required_u32(&req.params, "fromDay")?;
        if from_day == 0 || from_day > session.days_in_month {
            return Err(HandlerErr::new("bad_params", "fromDay out of range for month"));
        }

        // Days before fromDay keep whatever the operator already decided.
        for (day, day_state) in pattern::fill_from(code, anchor, from_day, session.days_in_month) {
            session.working.insert((post_id.clone(), day), day_state);
        }
        Ok(json!({ "patternCode": code.as_str(), "fromDay": from_day }))
    })();
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_edit_clear_post(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let (session, _) = session_mut(&mut state.plan_sessions, &req.params)?;
        let post_id = get_required_str(&req.params, "postId")?;
        if !session.post_ids.contains(&post_id) {
            return Err(HandlerErr::new("not_found", "post is not part of this session"));
        }
        // Back to unset. Only plan-derived cells exist in the working copy,
        // so daily-operations data cannot be touched from here.
        session.working.retain(|(pid, _), _| pid != &post_id);
        Ok(json!({ "ok": true }))
    })();
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_edit_discard(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| {
        let session_id = get_required_str(&req.params, "sessionId")?;
        if state.plan_sessions.remove(&session_id).is_none() {
            return Err(HandlerErr::new("not_found", "no such edit session"));
        }
        Ok(json!({ "ok": true }))
    })();
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_edit_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let AppState {
        db, plan_sessions, ..
    } = state;
    let Some(conn) = db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let session_id = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(session) = plan_sessions.get(&session_id) else {
        return err(&req.id, "not_found", "no such edit session", None);
    };

    match save_session(conn, session) {
        Ok(result) => {
            plan_sessions.remove(&session_id);
            ok(&req.id, result)
        }
        Err(e) => e.response(&req.id),
    }
}

/// Minimal-write save: diff working copy against the snapshot and persist
/// only changed cells, all inside one transaction.
fn save_session(
    conn: &Connection,
    session: &PlanEditSession,
) -> Result<serde_json::Value, HandlerErr> {
    // (post_id, day) -> (old, new); only genuine changes survive.
    let mut changes: Vec<(&(String, u32), Option<PlanState>, Option<PlanState>)> = Vec::new();
    for (key, new_state) in &session.working {
        let old = session.snapshot.get(key).copied();
        if old != Some(*new_state) {
            changes.push((key, old, Some(*new_state)));
        }
    }
    for (key, old_state) in &session.snapshot {
        if !session.working.contains_key(key) {
            changes.push((key, Some(*old_state), None));
        }
    }

    if changes.is_empty() {
        return Ok(json!({
            "installationId": session.installation_id,
            "changedCells": 0,
            "versions": {}
        }));
    }

    let mut touched_posts: Vec<&String> = changes.iter().map(|(k, _, _)| &k.0).collect();
    touched_posts.sort();
    touched_posts.dedup();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Optimistic concurrency: any touched post whose stored version moved
    // since editBegin rejects the whole save.
    for post_id in &touched_posts {
        let current: i64 = tx
            .query_row(
                "SELECT version FROM plan_months WHERE post_id = ? AND year = ? AND month = ?",
                (post_id.as_str(), session.year, session.month),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?
            .unwrap_or(0);
        let base = session.base_versions.get(*post_id).copied().unwrap_or(0);
        if current != base {
            return Err(HandlerErr::with_details(
                "stale_version",
                "plan was modified by another session; reload and retry",
                json!({
                    "postId": post_id,
                    "baseVersion": base,
                    "currentVersion": current,
                }),
            ));
        }
    }

    for ((post_id, day), _old, new_state) in &changes {
        match new_state {
            Some(s) => {
                let text = s.as_str().expect("only scheduled/off reach the store");
                tx.execute(
                    "INSERT INTO plan_days(post_id, year, month, day, state)
                     VALUES(?, ?, ?, ?, ?)
                     ON CONFLICT(post_id, year, month, day) DO UPDATE SET
                       state = excluded.state",
                    (post_id, session.year, session.month, *day as i64, text),
                )
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            }
            None => {
                // Reverted to unset. Delete only plan-derived values; a row
                // holding anything else is not ours to clobber.
                tx.execute(
                    "DELETE FROM plan_days
                     WHERE post_id = ? AND year = ? AND month = ? AND day = ?
                       AND state IN ('scheduled', 'off')",
                    (post_id, session.year, session.month, *day as i64),
                )
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
            }
        }
    }

    let mut new_versions = serde_json::Map::new();
    for post_id in &touched_posts {
        let base = session.base_versions.get(*post_id).copied().unwrap_or(0);
        let next = base + 1;
        tx.execute(
            "INSERT INTO plan_months(post_id, year, month, version)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(post_id, year, month) DO UPDATE SET
               version = excluded.version",
            (post_id.as_str(), session.year, session.month, next),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        new_versions.insert((*post_id).clone(), json!(next));
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "installationId": session.installation_id,
        "changedCells": changes.len(),
        "versions": new_versions,
    }))
}

fn planning_settings(conn: &Connection) -> Result<(bool, pattern::PatternCode), HandlerErr> {
    let saved = db::settings_get_json(conn, "setup.planning")
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let strict = saved
        .as_ref()
        .and_then(|v| v.get("strictPatternCodes"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let default_code = saved
        .as_ref()
        .and_then(|v| v.get("defaultPatternCode"))
        .and_then(|v| v.as_str())
        .and_then(pattern::PatternCode::parse)
        .unwrap_or(pattern::PatternCode::FourByFour);
    Ok((strict, default_code))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "plan.monthOpen" => Some(handle_month_open(state, req)),
        "plan.editBegin" => Some(handle_edit_begin(state, req)),
        "plan.editSetDay" => Some(handle_edit_set_day(state, req)),
        "plan.editFillPattern" => Some(handle_edit_fill_pattern(state, req)),
        "plan.editClearPost" => Some(handle_edit_clear_post(state, req)),
        "plan.editSave" => Some(handle_edit_save(state, req)),
        "plan.editDiscard" => Some(handle_edit_discard(state, req)),
        _ => None,
    }
}
