//! Injected lookups: the holiday calendar and the extra-shift rate table.
//! The engine never hardcodes either; the shell writes them and the
//! coverage assigner reads them.

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, get_optional_str, get_required_f64, get_required_str, parse_date, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::states::ShiftKind;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn holidays_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(raw) = params.get("dates").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing dates"));
    };
    let mut dates = Vec::with_capacity(raw.len());
    for v in raw {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::new("bad_params", "dates must be a list of strings"));
        };
        dates.push(parse_date(s, "dates[]")?);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut inserted = 0usize;
    for d in &dates {
        inserted += tx
            .execute(
                "INSERT OR IGNORE INTO holidays(date) VALUES(?)",
                [d.format("%Y-%m-%d").to_string()],
            )
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    Ok(json!({ "inserted": inserted, "received": dates.len() }))
}

fn holidays_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year = params.get("year").and_then(|v| v.as_i64());
    let prefix = year.map(|y| format!("{:04}-", y));
    let mut stmt = conn
        .prepare(
            "SELECT date FROM holidays
             WHERE (?1 IS NULL OR date LIKE ?1 || '%')
             ORDER BY date",
        )
        .map_err(db_err)?;
    let dates = stmt
        .query_map([&prefix], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "dates": dates }))
}

fn rates_set(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let installation_id = get_required_str(params, "installationId")?;
    let kind_raw = get_required_str(params, "kind")?;
    let Some(kind) = ShiftKind::parse(&kind_raw) else {
        return Err(HandlerErr::new(
            "bad_params",
            "kind must be one of: replacement, vacant_fill",
        ));
    };
    let base_amount = get_required_f64(params, "baseAmount")?;
    if base_amount < 0.0 {
        return Err(HandlerErr::new("bad_params", "baseAmount must be >= 0"));
    }
    let holiday_amount = match params.get("holidayAmount").and_then(|v| v.as_f64()) {
        Some(v) if v < 0.0 => {
            return Err(HandlerErr::new("bad_params", "holidayAmount must be >= 0"))
        }
        Some(v) => v,
        None => base_amount,
    };

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

    conn.execute(
        "INSERT INTO shift_rates(installation_id, kind, base_amount, holiday_amount)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(installation_id, kind) DO UPDATE SET
           base_amount = excluded.base_amount,
           holiday_amount = excluded.holiday_amount",
        (&installation_id, kind.as_str(), base_amount, holiday_amount),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({
        "installationId": installation_id,
        "kind": kind.as_str(),
        "baseAmount": base_amount,
        "holidayAmount": holiday_amount,
    }))
}

fn rates_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let installation_id = get_optional_str(params, "installationId");
    let mut stmt = conn
        .prepare(
            "SELECT sr.installation_id, i.name, sr.kind, sr.base_amount, sr.holiday_amount
             FROM shift_rates sr
             JOIN installations i ON i.id = sr.installation_id
             WHERE (?1 IS NULL OR sr.installation_id = ?1)
             ORDER BY i.name, sr.kind",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([&installation_id], |r| {
            Ok(json!({
                "installationId": r.get::<_, String>(0)?,
                "installationName": r.get::<_, String>(1)?,
                "kind": r.get::<_, String>(2)?,
                "baseAmount": r.get::<_, f64>(3)?,
                "holidayAmount": r.get::<_, f64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "rates": rows }))
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
        "holidays.set" => Some(with_conn(state, req, holidays_set)),
        "holidays.list" => Some(with_conn(state, req, holidays_list)),
        "rates.set" => Some(with_conn(state, req, rates_set)),
        "rates.list" => Some(with_conn(state, req, rates_list)),
        _ => None,
    }
}
