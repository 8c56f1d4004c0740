//! Coverage assigner and conflict detector.
//!
//! `assign_coverage` is the single entry point for pairing a guard with a
//! (post, date). It must run inside the caller's transaction: the conflict
//! check and the writes commit or roll back together, so two requests for
//! the same guard and date can never both pass the check.

use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use crate::states::ShiftKind;

#[derive(Debug, Clone)]
pub struct PostRef {
    pub id: String,
    pub installation_id: String,
    pub installation_name: String,
    pub display_name: String,
    pub bound_guard_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub conflicting_installation_name: String,
    pub conflicting_post_name: String,
    /// Set when the conflict is one of the guard's own coverage
    /// assignments; a titular plan-binding carries no assignment id.
    pub assignment_id: Option<String>,
    pub assignment_post_id: Option<String>,
}

#[derive(Debug)]
pub enum AssignError {
    Conflict(ConflictInfo),
    RateNotConfigured {
        installation_id: String,
        kind: ShiftKind,
    },
    LedgerLocked {
        entry_id: String,
        status: String,
    },
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for AssignError {
    fn from(e: rusqlite::Error) -> Self {
        AssignError::Db(e)
    }
}

#[derive(Debug)]
pub struct AssignOutcome {
    pub assignment_id: String,
    pub ledger_entry_id: String,
    pub amount: f64,
    /// Ledger entry reversed because the guard's own prior assignment was
    /// replaced in the same request.
    pub reversed_entry_id: Option<String>,
}

pub fn load_post(conn: &Connection, post_id: &str) -> rusqlite::Result<Option<PostRef>> {
    conn.query_row(
        "SELECT p.id, p.installation_id, i.name, p.display_name, p.bound_guard_id
         FROM posts p
         JOIN installations i ON i.id = p.installation_id
         WHERE p.id = ?",
        [post_id],
        |r| {
            Ok(PostRef {
                id: r.get(0)?,
                installation_id: r.get(1)?,
                installation_name: r.get(2)?,
                display_name: r.get(3)?,
                bound_guard_id: r.get(4)?,
            })
        },
    )
    .optional()
}

fn date_text(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Guard's own coverage assignment on another post that date, if any.
fn assignment_conflict(
    conn: &Connection,
    guard_id: &str,
    date: NaiveDate,
    exclude_post_id: &str,
) -> rusqlite::Result<Option<ConflictInfo>> {
    conn.query_row(
        "SELECT ca.id, ca.post_id, p.display_name, i.name
         FROM coverage_assignments ca
         JOIN posts p ON p.id = ca.post_id
         JOIN installations i ON i.id = p.installation_id
         WHERE ca.guard_id = ? AND ca.date = ? AND ca.post_id != ?",
        (guard_id, date_text(date), exclude_post_id),
        |r| {
            Ok(ConflictInfo {
                assignment_id: Some(r.get(0)?),
                assignment_post_id: Some(r.get(1)?),
                conflicting_post_name: r.get(2)?,
                conflicting_installation_name: r.get(3)?,
            })
        },
    )
    .optional()
}

/// Post where the guard is titular and the plan says `scheduled` for that
/// date, unless that day's override already records the titular as not
/// working the slot (absent, leave, vacation, medical).
fn titular_conflict(
    conn: &Connection,
    guard_id: &str,
    date: NaiveDate,
    exclude_post_id: &str,
) -> rusqlite::Result<Option<ConflictInfo>> {
    conn.query_row(
        "SELECT p.display_name, i.name
         FROM posts p
         JOIN installations i ON i.id = p.installation_id
         JOIN plan_days pd ON pd.post_id = p.id
         WHERE p.bound_guard_id = ?1
           AND p.id != ?2
           AND pd.year = ?3 AND pd.month = ?4 AND pd.day = ?5
           AND pd.state = 'scheduled'
           AND NOT EXISTS (
             SELECT 1 FROM daily_overrides o
             WHERE o.post_id = p.id AND o.date = ?6
               AND o.state != 'attended'
           )",
        (
            guard_id,
            exclude_post_id,
            date.year(),
            date.month(),
            date.day(),
            date_text(date),
        ),
        |r| {
            Ok(ConflictInfo {
                conflicting_post_name: r.get(0)?,
                conflicting_installation_name: r.get(1)?,
                assignment_id: None,
                assignment_post_id: None,
            })
        },
    )
    .optional()
}

pub fn find_conflict(
    conn: &Connection,
    guard_id: &str,
    date: NaiveDate,
    exclude_post_id: &str,
) -> rusqlite::Result<Option<ConflictInfo>> {
    if let Some(c) = titular_conflict(conn, guard_id, date, exclude_post_id)? {
        return Ok(Some(c));
    }
    assignment_conflict(conn, guard_id, date, exclude_post_id)
}

/// Injected amount source: per-installation rates keyed by shift kind,
/// with holiday dates paying the holiday amount.
pub fn compute_extra_shift_amount(
    conn: &Connection,
    installation_id: &str,
    date: NaiveDate,
    kind: ShiftKind,
) -> rusqlite::Result<Option<f64>> {
    let rate: Option<(f64, f64)> = conn
        .query_row(
            "SELECT base_amount, holiday_amount FROM shift_rates
             WHERE installation_id = ? AND kind = ?",
            (installation_id, kind.as_str()),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((base, holiday)) = rate else {
        return Ok(None);
    };
    let is_holiday: bool = conn
        .query_row(
            "SELECT 1 FROM holidays WHERE date = ?",
            [date_text(date)],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    Ok(Some(if is_holiday { holiday } else { base }))
}

/// Flag the open ledger entry for (post, date) as reversed. Batched or
/// paid entries refuse: the money side must be unwound explicitly first.
pub fn reverse_open_entry(
    conn: &Connection,
    post_id: &str,
    date: NaiveDate,
    reason: &str,
) -> Result<Option<String>, AssignError> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, status, note FROM extra_shifts
             WHERE post_id = ? AND date = ? AND status != 'reversed'
             ORDER BY rowid DESC LIMIT 1",
            (post_id, date_text(date)),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((entry_id, status, note)) = row else {
        return Ok(None);
    };
    if status != "unpaid" {
        return Err(AssignError::LedgerLocked { entry_id, status });
    }
    let note = match note {
        Some(n) if !n.is_empty() => format!("{} | {}", n, reason),
        _ => reason.to_string(),
    };
    conn.execute(
        "UPDATE extra_shifts SET status = 'reversed', note = ? WHERE id = ?",
        (&note, &entry_id),
    )?;
    Ok(Some(entry_id))
}

/// Check-then-create for one guard, post and date. Caller supplies the
/// already-loaded target post and runs this inside a transaction.
pub fn assign_coverage(
    conn: &Connection,
    guard_id: &str,
    post: &PostRef,
    date: NaiveDate,
    kind: ShiftKind,
    note: Option<&str>,
    replace_existing: bool,
) -> Result<AssignOutcome, AssignError> {
    // Titular plan-bindings are never auto-resolved.
    if let Some(c) = titular_conflict(conn, guard_id, date, &post.id)? {
        return Err(AssignError::Conflict(c));
    }

    let mut reversed_entry_id = None;
    if let Some(c) = assignment_conflict(conn, guard_id, date, &post.id)? {
        if !replace_existing {
            return Err(AssignError::Conflict(c));
        }
        // Replacing the guard's own prior assignment was explicitly
        // requested: drop it and reverse its open ledger entry.
        let old_post_id = c.assignment_post_id.as_deref().unwrap_or_default();
        reversed_entry_id = reverse_open_entry(
            conn,
            old_post_id,
            date,
            &format!("reassigned to {}", post.display_name),
        )?;
        conn.execute(
            "DELETE FROM coverage_assignments WHERE id = ?",
            [c.assignment_id.as_deref().unwrap_or_default()],
        )?;
        conn.execute(
            "DELETE FROM daily_overrides
             WHERE post_id = ? AND date = ? AND state = 'absent_replaced'
               AND covering_guard_id = ?",
            (old_post_id, date_text(date), guard_id),
        )?;
    }

    let amount = compute_extra_shift_amount(conn, &post.installation_id, date, kind)?.ok_or(
        AssignError::RateNotConfigured {
            installation_id: post.installation_id.clone(),
            kind,
        },
    )?;

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO coverage_assignments(id, post_id, date, guard_id, kind)
         VALUES(?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &post.id,
            date_text(date),
            guard_id,
            kind.as_str(),
        ),
    )?;

    let ledger_entry_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO extra_shifts(id, guard_id, post_id, installation_id, date, kind, amount, status, note)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'unpaid', ?)",
        (
            &ledger_entry_id,
            guard_id,
            &post.id,
            &post.installation_id,
            date_text(date),
            kind.as_str(),
            amount,
            note,
        ),
    )?;

    Ok(AssignOutcome {
        assignment_id,
        ledger_entry_id,
        amount,
        reversed_entry_id,
    })
}
