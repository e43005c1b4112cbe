//! SQLite persistence for claude-monitor-daemon.
//!
//! The daemon is the only writer. Sessions and work blocks are stored as
//! plain rows; timestamps are fixed-width RFC3339 UTC strings so range
//! predicates can compare them as text.

use chrono::{DateTime, SecondsFormat, Utc};
use monitor_core::{ActivityStore, CloseReason, ContextKey, Session, StoreError, WorkBlock};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Params, Row};
use std::path::PathBuf;

const SESSION_COLUMNS: &str = "id, user_id, start_time, end_time, activity_count, \
     first_activity_time, last_activity_time";

const BLOCK_COLUMNS: &str = "id, session_id, user_id, project, project_id, start_time, \
     end_time, last_activity_time, activity_count, duration_seconds, \
     claude_processing_seconds, close_reason, clamped";

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    fn query_sessions<P: Params>(
        &self,
        context: &str,
        sql: &str,
        params: P,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = self.with_connection(context, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, SessionRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    fn query_blocks<P: Params>(
        &self,
        context: &str,
        sql: &str,
        params: P,
    ) -> Result<Vec<WorkBlock>, StoreError> {
        let rows = self.with_connection(context, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, BlockRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter().map(BlockRow::into_block).collect()
    }

    fn init_schema(&self) -> Result<(), String> {
        let conn = self.open()?;
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                activity_count INTEGER NOT NULL DEFAULT 0,
                first_activity_time TEXT,
                last_activity_time TEXT,
                created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_sessions_user_start
                ON sessions (user_id, start_time);
             CREATE TABLE IF NOT EXISTS work_blocks (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                project TEXT NOT NULL,
                project_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                last_activity_time TEXT NOT NULL,
                activity_count INTEGER NOT NULL DEFAULT 0,
                duration_seconds INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_work_blocks_context
                ON work_blocks (session_id, project);
             CREATE INDEX IF NOT EXISTS idx_work_blocks_start
                ON work_blocks (start_time);
             COMMIT;",
        )
        .map_err(|err| format!("Failed to initialize schema: {}", err))?;
        ensure_work_block_columns(&conn)?;
        Ok(())
    }

    fn with_connection<T>(
        &self,
        context: &str,
        op: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.open().map_err(StoreError::Unavailable)?;
        op(&mut conn).map_err(|err| StoreError::query(context, err))
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

impl ActivityStore for Db {
    fn find_active_session(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let at = format_time(&at);
        let sql = format!(
            "SELECT {} FROM sessions \
             WHERE user_id = ?1 AND start_time <= ?2 AND end_time > ?2 \
             ORDER BY start_time DESC LIMIT 1",
            SESSION_COLUMNS
        );
        Ok(self
            .query_sessions("find_active_session", &sql, params![user_id, at])?
            .into_iter()
            .next())
    }

    fn find_next_session(
        &self,
        user_id: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let after = format_time(&after);
        let sql = format!(
            "SELECT {} FROM sessions \
             WHERE user_id = ?1 AND start_time > ?2 \
             ORDER BY start_time ASC LIMIT 1",
            SESSION_COLUMNS
        );
        Ok(self
            .query_sessions("find_next_session", &sql, params![user_id, after])?
            .into_iter()
            .next())
    }

    fn find_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = self.with_connection("find_session", |conn| {
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![session_id],
                SessionRow::from_row,
            )
            .optional()
        })?;
        row.map(SessionRow::into_session).transpose()
    }

    fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        // Boundaries never change once written, so a replayed insert is a no-op.
        self.with_connection("create_session", |conn| {
            conn.execute(
                "INSERT INTO sessions \
                    (id, user_id, start_time, end_time, activity_count, \
                     first_activity_time, last_activity_time, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(id) DO NOTHING",
                params![
                    session.id,
                    session.user_id,
                    format_time(&session.start_time),
                    format_time(&session.end_time),
                    session.activity_count as i64,
                    session.first_activity_time.as_ref().map(format_time),
                    session.last_activity_time.as_ref().map(format_time),
                    format_time(&Utc::now()),
                ],
            )
            .map(|_| ())
        })
    }

    fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let updated = self.with_connection("update_session", |conn| {
            conn.execute(
                "UPDATE sessions SET \
                    activity_count = ?2, \
                    first_activity_time = ?3, \
                    last_activity_time = ?4 \
                 WHERE id = ?1",
                params![
                    session.id,
                    session.activity_count as i64,
                    session.first_activity_time.as_ref().map(format_time),
                    session.last_activity_time.as_ref().map(format_time),
                ],
            )
        })?;
        if updated == 0 {
            return Err(StoreError::query(
                "update_session",
                format!("unknown session id {}", session.id),
            ));
        }
        Ok(())
    }

    fn upsert_work_block(&self, block: &WorkBlock) -> Result<(), StoreError> {
        self.with_connection("upsert_work_block", |conn| {
            conn.execute(
                "INSERT INTO work_blocks \
                    (id, session_id, user_id, project, project_id, start_time, end_time, \
                     last_activity_time, activity_count, duration_seconds, \
                     claude_processing_seconds, close_reason, clamped) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(id) DO UPDATE SET \
                    end_time = excluded.end_time, \
                    last_activity_time = excluded.last_activity_time, \
                    activity_count = excluded.activity_count, \
                    duration_seconds = excluded.duration_seconds, \
                    claude_processing_seconds = excluded.claude_processing_seconds, \
                    close_reason = excluded.close_reason, \
                    clamped = excluded.clamped",
                params![
                    block.id,
                    block.session_id,
                    block.user_id,
                    block.project,
                    block.project_id,
                    format_time(&block.start_time),
                    block.end_time.as_ref().map(format_time),
                    format_time(&block.last_activity_time),
                    block.activity_count as i64,
                    block.duration_seconds,
                    block.claude_processing_seconds,
                    block.close_reason.map(CloseReason::as_str),
                    block.clamped,
                ],
            )
            .map(|_| ())
        })
    }

    fn find_open_work_block(&self, key: &ContextKey) -> Result<Option<WorkBlock>, StoreError> {
        let sql = format!(
            "SELECT {} FROM work_blocks \
             WHERE session_id = ?1 AND project = ?2 AND end_time IS NULL \
             ORDER BY start_time DESC LIMIT 1",
            BLOCK_COLUMNS
        );
        Ok(self
            .query_blocks(
                "find_open_work_block",
                &sql,
                params![key.session_id, key.project],
            )?
            .into_iter()
            .next())
    }

    fn open_work_blocks(&self) -> Result<Vec<WorkBlock>, StoreError> {
        let sql = format!(
            "SELECT {} FROM work_blocks WHERE end_time IS NULL ORDER BY start_time ASC",
            BLOCK_COLUMNS
        );
        self.query_blocks("open_work_blocks", &sql, params![])
    }

    fn work_blocks_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WorkBlock>, StoreError> {
        let sql = format!(
            "SELECT {} FROM work_blocks \
             WHERE end_time IS NOT NULL AND start_time >= ?1 AND start_time < ?2 \
             ORDER BY start_time ASC, id ASC",
            BLOCK_COLUMNS
        );
        self.query_blocks(
            "work_blocks_between",
            &sql,
            params![format_time(&from), format_time(&to)],
        )
    }
}

struct SessionRow {
    id: String,
    user_id: String,
    start_time: String,
    end_time: String,
    activity_count: i64,
    first_activity_time: Option<String>,
    last_activity_time: Option<String>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            start_time: row.get(2)?,
            end_time: row.get(3)?,
            activity_count: row.get(4)?,
            first_activity_time: row.get(5)?,
            last_activity_time: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        Ok(Session {
            start_time: parse_time(&self.start_time, "sessions.start_time")?,
            end_time: parse_time(&self.end_time, "sessions.end_time")?,
            activity_count: self.activity_count.max(0) as u64,
            first_activity_time: parse_optional_time(
                self.first_activity_time,
                "sessions.first_activity_time",
            )?,
            last_activity_time: parse_optional_time(
                self.last_activity_time,
                "sessions.last_activity_time",
            )?,
            id: self.id,
            user_id: self.user_id,
        })
    }
}

struct BlockRow {
    id: String,
    session_id: String,
    user_id: String,
    project: String,
    project_id: String,
    start_time: String,
    end_time: Option<String>,
    last_activity_time: String,
    activity_count: i64,
    duration_seconds: Option<i64>,
    claude_processing_seconds: i64,
    close_reason: Option<String>,
    clamped: bool,
}

impl BlockRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            project: row.get(3)?,
            project_id: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            last_activity_time: row.get(7)?,
            activity_count: row.get(8)?,
            duration_seconds: row.get(9)?,
            claude_processing_seconds: row.get(10)?,
            close_reason: row.get(11)?,
            clamped: row.get(12)?,
        })
    }

    fn into_block(self) -> Result<WorkBlock, StoreError> {
        let close_reason = match self.close_reason {
            Some(value) => Some(CloseReason::parse(&value).ok_or_else(|| {
                StoreError::corrupt(
                    "work_blocks.close_reason",
                    format!("unknown close reason {:?} on block {}", value, self.id),
                )
            })?),
            None => None,
        };
        Ok(WorkBlock {
            start_time: parse_time(&self.start_time, "work_blocks.start_time")?,
            end_time: parse_optional_time(self.end_time, "work_blocks.end_time")?,
            last_activity_time: parse_time(
                &self.last_activity_time,
                "work_blocks.last_activity_time",
            )?,
            activity_count: self.activity_count.max(0) as u64,
            duration_seconds: self.duration_seconds,
            claude_processing_seconds: self.claude_processing_seconds,
            close_reason,
            clamped: self.clamped,
            id: self.id,
            session_id: self.session_id,
            user_id: self.user_id,
            project: self.project,
            project_id: self.project_id,
        })
    }
}

/// Adds columns introduced after the first schema so older databases keep working.
fn ensure_work_block_columns(conn: &Connection) -> Result<(), String> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(work_blocks)")
        .map_err(|err| format!("Failed to read work_blocks schema: {}", err))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|err| format!("Failed to read work_blocks schema rows: {}", err))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|err| format!("Failed to decode schema row: {}", err))?);
    }

    let additions = [
        (
            "claude_processing_seconds",
            "ALTER TABLE work_blocks ADD COLUMN claude_processing_seconds INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "close_reason",
            "ALTER TABLE work_blocks ADD COLUMN close_reason TEXT",
        ),
        (
            "clamped",
            "ALTER TABLE work_blocks ADD COLUMN clamped INTEGER NOT NULL DEFAULT 0",
        ),
    ];
    for (name, statement) in additions {
        if !columns.iter().any(|column| column == name) {
            conn.execute(statement, [])
                .map_err(|err| format!("Failed to add {} column: {}", name, err))?;
        }
    }

    Ok(())
}

fn format_time(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str, context: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::corrupt(context, format!("{:?}: {}", value, err)))
}

fn parse_optional_time(
    value: Option<String>,
    context: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|value| parse_time(&value, context)).transpose()
}
