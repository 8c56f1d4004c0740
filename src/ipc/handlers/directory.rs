//! Boundary records: installations, guards and posts. Only the fields the
//! engine consumes live here; full HR/client records are the shell's
//! problem.

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_str, require_guard, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::pattern::PatternCode;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn installations_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO installations(id, name) VALUES(?, ?)",
        (&id, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "installationId": id, "name": name }))
}

fn installations_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Include post counts so the shell can show a useful dashboard.
    let mut stmt = conn
        .prepare(
            "SELECT
               i.id,
               i.name,
               (SELECT COUNT(*) FROM posts p WHERE p.installation_id = i.id) AS post_count,
               (SELECT COUNT(*) FROM posts p
                WHERE p.installation_id = i.id AND p.bound_guard_id IS NULL) AS open_post_count
             FROM installations i
             ORDER BY i.name",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "postCount": r.get::<_, i64>(2)?,
                "openPostCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "installations": rows }))
}

fn guards_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let display_name = get_required_str(params, "displayName")?;
    let display_name = display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(HandlerErr::new("bad_params", "displayName must not be empty"));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO guards(id, display_name, active) VALUES(?, ?, 1)",
        (&id, &display_name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "guardId": id, "displayName": display_name }))
}

fn guards_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.display_name, g.active, p.id, p.display_name
             FROM guards g
             LEFT JOIN posts p ON p.bound_guard_id = g.id
             ORDER BY g.display_name",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": r.get::<_, String>(1)?,
                "active": r.get::<_, i64>(2)? != 0,
                "currentPostId": r.get::<_, Option<String>>(3)?,
                "currentPostName": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "guards": rows }))
}

fn posts_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let installation_id = get_required_str(params, "installationId")?;
    let display_name = get_required_str(params, "displayName")?;
    let display_name = display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(HandlerErr::new("bad_params", "displayName must not be empty"));
    }

    let installation_exists = conn
        .query_row(
            "SELECT 1 FROM installations WHERE id = ?",
            [&installation_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(db_err)?
        .is_some();
    if !installation_exists {
        return Err(HandlerErr::new("not_found", "installation not found"));
    }

    let pattern_code = get_optional_str(params, "patternCode").unwrap_or_else(|| "4x4".into());
    if PatternCode::parse(&pattern_code).is_none() {
        return Err(HandlerErr::with_details(
            "bad_params",
            "patternCode must be one of: 4x4, 5x2, 6x1, 7x7",
            json!({ "patternCode": pattern_code }),
        ));
    }
    let shift_hours = params
        .get("shiftHours")
        .and_then(|v| v.as_i64())
        .unwrap_or(12);
    if !(1..=24).contains(&shift_hours) {
        return Err(HandlerErr::new("bad_params", "shiftHours must be in 1..=24"));
    }
    let start_time = get_optional_str(params, "startTime").unwrap_or_else(|| "07:00".into());
    let end_time = get_optional_str(params, "endTime").unwrap_or_else(|| "19:00".into());

    let bound_guard_id = get_optional_str(params, "boundGuardId");
    if let Some(gid) = bound_guard_id.as_deref() {
        require_guard(conn, gid)?;
        reject_if_titular_elsewhere(conn, gid, None)?;
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO posts(id, installation_id, display_name, bound_guard_id,
                           pattern_code, shift_hours, start_time, end_time)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &installation_id,
            &display_name,
            &bound_guard_id,
            &pattern_code,
            shift_hours,
            &start_time,
            &end_time,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    Ok(json!({ "postId": id }))
}

fn posts_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let installation_id = get_optional_str(params, "installationId");
    let sql = "SELECT p.id, p.installation_id, i.name, p.display_name,
                      p.bound_guard_id, g.display_name,
                      p.pattern_code, p.shift_hours, p.start_time, p.end_time
               FROM posts p
               JOIN installations i ON i.id = p.installation_id
               LEFT JOIN guards g ON g.id = p.bound_guard_id
               WHERE (?1 IS NULL OR p.installation_id = ?1)
               ORDER BY i.name, p.display_name";
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map([&installation_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "installationId": r.get::<_, String>(1)?,
                "installationName": r.get::<_, String>(2)?,
                "displayName": r.get::<_, String>(3)?,
                "boundGuardId": r.get::<_, Option<String>>(4)?,
                "boundGuardName": r.get::<_, Option<String>>(5)?,
                "patternCode": r.get::<_, String>(6)?,
                "shiftHours": r.get::<_, i64>(7)?,
                "startTime": r.get::<_, String>(8)?,
                "endTime": r.get::<_, String>(9)?,
                "open": r.get::<_, Option<String>>(4)?.is_none(),
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "posts": rows }))
}

fn reject_if_titular_elsewhere(
    conn: &Connection,
    guard_id: &str,
    exclude_post_id: Option<&str>,
) -> Result<(), HandlerErr> {
    let held: Option<(String, String)> = conn
        .query_row(
            "SELECT p.display_name, i.name
             FROM posts p
             JOIN installations i ON i.id = p.installation_id
             WHERE p.bound_guard_id = ?1 AND (?2 IS NULL OR p.id != ?2)",
            (guard_id, exclude_post_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    if let Some((post_name, installation_name)) = held {
        return Err(HandlerErr::with_details(
            "conflict",
            format!(
                "guard is already titular of {} at {}",
                post_name, installation_name
            ),
            json!({
                "conflictingInstallationName": installation_name,
                "conflictingPostName": post_name,
            }),
        ));
    }
    Ok(())
}

fn posts_bind_guard(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let post_id = get_required_str(params, "postId")?;
    let exists = conn
        .query_row("SELECT 1 FROM posts WHERE id = ?", [&post_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(db_err)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "post not found"));
    }

    // Explicit null reopens the post.
    let guard_id = match params.get("guardId") {
        None => return Err(HandlerErr::new("bad_params", "missing guardId")),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return Err(HandlerErr::new("bad_params", "guardId must be string or null")),
        },
    };

    if let Some(gid) = guard_id.as_deref() {
        require_guard(conn, gid)?;
        reject_if_titular_elsewhere(conn, gid, Some(&post_id))?;
    }

    conn.execute(
        "UPDATE posts SET bound_guard_id = ? WHERE id = ?",
        (&guard_id, &post_id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "postId": post_id, "boundGuardId": guard_id }))
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
        "installations.create" => Some(with_conn(state, req, installations_create)),
        "installations.list" => Some(with_conn(state, req, |c, _| installations_list(c))),
        "guards.create" => Some(with_conn(state, req, guards_create)),
        "guards.list" => Some(with_conn(state, req, |c, _| guards_list(c))),
        "posts.create" => Some(with_conn(state, req, posts_create)),
        "posts.list" => Some(with_conn(state, req, posts_list)),
        "posts.bindGuard" => Some(with_conn(state, req, posts_bind_guard)),
        _ => None,
    }
}
