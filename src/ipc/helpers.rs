use chrono::NaiveDate;
use serde_json::json;

use crate::coverage::{load_post, AssignError, PostRef};
use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

impl From<AssignError> for HandlerErr {
    fn from(e: AssignError) -> Self {
        match e {
            AssignError::Conflict(c) => HandlerErr::with_details(
                "conflict",
                format!(
                    "guard is already committed to {} at {} on that date",
                    c.conflicting_post_name, c.conflicting_installation_name
                ),
                json!({
                    "conflictingInstallationName": c.conflicting_installation_name,
                    "conflictingPostName": c.conflicting_post_name,
                }),
            ),
            AssignError::RateNotConfigured {
                installation_id,
                kind,
            } => HandlerErr::with_details(
                "not_found",
                "no extra-shift rate configured for installation",
                json!({ "installationId": installation_id, "kind": kind.as_str() }),
            ),
            AssignError::LedgerLocked { entry_id, status } => HandlerErr::with_details(
                "invalid_transition",
                format!("ledger entry is {}; settle or unbatch before clearing", status),
                json!({ "entryId": entry_id, "status": status }),
            ),
            AssignError::Db(e) => db_err(e),
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_required_u32(params: &serde_json::Value, key: &str) -> Result<u32, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_required_i32(params: &serde_json::Value, key: &str) -> Result<i32, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_bool_or(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

/// Calendar dates travel as ISO `YYYY-MM-DD` strings.
pub fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    parse_date(&raw, key)
}

pub fn parse_date(raw: &str, key: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        HandlerErr::new("bad_params", format!("{} must be YYYY-MM-DD", key))
    })
}

pub fn get_required_str_list(
    params: &serde_json::Value,
    key: &str,
) -> Result<Vec<String>, HandlerErr> {
    let Some(raw) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", format!("missing {}", key)));
    };
    let items: Vec<String> = raw
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    if items.len() != raw.len() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must be a list of strings", key),
        ));
    }
    Ok(items)
}

pub fn require_post(
    conn: &rusqlite::Connection,
    post_id: &str,
) -> Result<PostRef, HandlerErr> {
    load_post(conn, post_id)
        .map_err(db_err)?
        .ok_or_else(|| HandlerErr::new("not_found", "post not found"))
}

pub fn require_guard(
    conn: &rusqlite::Connection,
    guard_id: &str,
) -> Result<String, HandlerErr> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT display_name FROM guards WHERE id = ?",
        [guard_id],
        |r| r.get::<_, String>(0),
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr::new("not_found", "guard not found"))
}
