use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("webmeet.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meetings(
            id TEXT PRIMARY KEY,
            course_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            start_time INTEGER NOT NULL,
            duration INTEGER NOT NULL,
            host_id TEXT,
            provider_meeting_id INTEGER,
            password TEXT,
            join_url TEXT,
            start_url TEXT,
            timezone TEXT,
            alternative_hosts TEXT,
            host_video INTEGER NOT NULL DEFAULT 0,
            audio TEXT NOT NULL DEFAULT 'both',
            recurrence_type INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER,
            time_modified INTEGER,
            exists_on_provider INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_course ON meetings(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meetings_provider ON meetings(provider_meeting_id)",
        [],
    )?;

    // Existing stores may predate the expired-meeting tracking. Add if needed.
    ensure_meetings_exists_on_provider(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meeting_sessions(
            uuid TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL,
            FOREIGN KEY(meeting_id) REFERENCES meetings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meeting_sessions_meeting ON meeting_sessions(meeting_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_participants(
            id TEXT PRIMARY KEY,
            session_uuid TEXT NOT NULL,
            user_id INTEGER,
            display_name TEXT,
            join_time INTEGER NOT NULL,
            leave_time INTEGER NOT NULL,
            status TEXT NOT NULL,
            FOREIGN KEY(session_uuid) REFERENCES meeting_sessions(uuid)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_participants_session
         ON session_participants(session_uuid)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_participants_user
         ON session_participants(user_id)",
        [],
    )?;
    ensure_participants_display_name(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_state(
            course_id INTEGER PRIMARY KEY,
            report_last_update INTEGER NOT NULL DEFAULT 0
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

    Ok(conn)
}

fn ensure_meetings_exists_on_provider(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "meetings", "exists_on_provider")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE meetings ADD COLUMN exists_on_provider INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

fn ensure_participants_display_name(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "session_participants", "display_name")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE session_participants ADD COLUMN display_name TEXT",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
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

pub fn report_last_update(conn: &Connection, course_id: i64) -> anyhow::Result<i64> {
    use rusqlite::OptionalExtension;
    let v: Option<i64> = conn
        .query_row(
            "SELECT report_last_update FROM report_state WHERE course_id = ?",
            [course_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(0))
}

pub fn bump_report_last_update(
    conn: &Connection,
    course_id: i64,
    report_time: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO report_state(course_id, report_last_update) VALUES(?, ?)
         ON CONFLICT(course_id) DO UPDATE SET
           report_last_update = MAX(report_last_update, excluded.report_last_update)",
        (course_id, report_time),
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
