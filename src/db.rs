use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("roster.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS installations(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS guards(
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS posts(
            id TEXT PRIMARY KEY,
            installation_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            bound_guard_id TEXT,
            pattern_code TEXT NOT NULL DEFAULT '4x4',
            shift_hours INTEGER NOT NULL DEFAULT 12,
            start_time TEXT NOT NULL DEFAULT '07:00',
            end_time TEXT NOT NULL DEFAULT '19:00',
            FOREIGN KEY(installation_id) REFERENCES installations(id),
            FOREIGN KEY(bound_guard_id) REFERENCES guards(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_posts_installation ON posts(installation_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_posts_bound_guard ON posts(bound_guard_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plan_months(
            post_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(post_id, year, month),
            FOREIGN KEY(post_id) REFERENCES posts(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plan_days(
            post_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            day INTEGER NOT NULL,
            state TEXT NOT NULL,
            PRIMARY KEY(post_id, year, month, day),
            FOREIGN KEY(post_id) REFERENCES posts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plan_days_month ON plan_days(year, month)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS daily_overrides(
            post_id TEXT NOT NULL,
            date TEXT NOT NULL,
            state TEXT,
            covering_guard_id TEXT,
            note TEXT,
            PRIMARY KEY(post_id, date),
            FOREIGN KEY(post_id) REFERENCES posts(id),
            FOREIGN KEY(covering_guard_id) REFERENCES guards(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_overrides_date ON daily_overrides(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS coverage_assignments(
            id TEXT PRIMARY KEY,
            post_id TEXT NOT NULL,
            date TEXT NOT NULL,
            guard_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            UNIQUE(post_id, date),
            FOREIGN KEY(post_id) REFERENCES posts(id),
            FOREIGN KEY(guard_id) REFERENCES guards(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_coverage_guard_date ON coverage_assignments(guard_id, date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payment_batches(
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            total_amount REAL NOT NULL,
            entry_count INTEGER NOT NULL,
            note TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS extra_shifts(
            id TEXT PRIMARY KEY,
            guard_id TEXT NOT NULL,
            post_id TEXT NOT NULL,
            installation_id TEXT NOT NULL,
            date TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'unpaid',
            batch_id TEXT,
            paid_at TEXT,
            paid_by TEXT,
            note TEXT,
            FOREIGN KEY(guard_id) REFERENCES guards(id),
            FOREIGN KEY(post_id) REFERENCES posts(id),
            FOREIGN KEY(installation_id) REFERENCES installations(id),
            FOREIGN KEY(batch_id) REFERENCES payment_batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_shifts_status ON extra_shifts(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_shifts_guard ON extra_shifts(guard_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_shifts_batch ON extra_shifts(batch_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS holidays(
            date TEXT PRIMARY KEY
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS shift_rates(
            installation_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            base_amount REAL NOT NULL,
            holiday_amount REAL NOT NULL,
            PRIMARY KEY(installation_id, kind),
            FOREIGN KEY(installation_id) REFERENCES installations(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Existing workspaces may predate these columns. Add if needed.
    ensure_extra_shifts_paid_by(&conn)?;
    ensure_posts_pattern_code(&conn)?;

    // Workspaces written by the v0 importer used the legacy string tags
    // ('P', 'L', 'T', 'LIC', ...). Rewrite them to the closed vocabulary.
    migrate_legacy_state_codes(&conn)?;

    Ok(conn)
}

fn ensure_extra_shifts_paid_by(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "extra_shifts", "paid_by")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE extra_shifts ADD COLUMN paid_by TEXT", [])?;
    Ok(())
}

fn ensure_posts_pattern_code(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "posts", "pattern_code")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE posts ADD COLUMN pattern_code TEXT NOT NULL DEFAULT '4x4'",
        [],
    )?;
    Ok(())
}

fn migrate_legacy_state_codes(conn: &Connection) -> anyhow::Result<()> {
    // Plan layer: 'P'/'planificado' -> scheduled, 'L'/'libre'/'descanso' -> off.
    for (legacy, current) in [
        ("P", "scheduled"),
        ("planificado", "scheduled"),
        ("L", "off"),
        ("libre", "off"),
        ("descanso", "off"),
    ] {
        conn.execute(
            "UPDATE plan_days SET state = ?2 WHERE state = ?1",
            (legacy, current),
        )?;
    }

    // Override layer: single letters and abbreviations from the v0 daily
    // sheets. Unknown codes are left in place; the read path ignores them.
    for (legacy, current) in [
        ("T", "attended"),
        ("trabajado", "attended"),
        ("R", "absent_replaced"),
        ("reemplazo", "absent_replaced"),
        ("F", "absent_uncovered"),
        ("falta", "absent_uncovered"),
        ("PER", "leave"),
        ("permiso", "leave"),
        ("V", "vacation"),
        ("vacaciones", "vacation"),
        ("LIC", "medical_leave"),
        ("licencia", "medical_leave"),
    ] {
        conn.execute(
            "UPDATE daily_overrides SET state = ?2 WHERE state = ?1",
            (legacy, current),
        )?;
    }
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
