//! SQLite-backed repositories.
//!
//! One connection behind a mutex; entities serialize their structured
//! columns (params, outputs, quality scores) as JSON text. The schema keys
//! phase results on `(session_id, phase_number)` and content rows on the
//! dedup quadruple, so upserts are idempotent at the database level.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use mangaforge_common::{
    ContentStatus, ContentType, GeneratedContent, GeneratedContentRepository, PhaseResult,
    PhaseResultRepository, PhaseStatus, Session, SessionRepository, SessionStatus,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database, for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                input_text TEXT NOT NULL,
                params TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                current_phase INTEGER NOT NULL DEFAULT 0,
                hitl_enabled INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS phase_results (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                phase_number INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                output TEXT,
                quality_score TEXT,
                processing_duration_ms INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT,
                completed_at TEXT,
                ai_assisted INTEGER NOT NULL DEFAULT 0,
                UNIQUE(session_id, phase_number)
            );

            CREATE TABLE IF NOT EXISTS generated_content (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                phase_number INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'generated',
                quality_score REAL,
                generated_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(session_id, phase_number, content_type, content_hash)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
            CREATE INDEX IF NOT EXISTS idx_phase_results_session ON phase_results(session_id);
            CREATE INDEX IF NOT EXISTS idx_content_session ON generated_content(session_id);
            ",
        )
        .context("Failed to create tables")?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("SQLite connection lock poisoned"))
    }

    fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
        Ok(SessionRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            input_text: row.get(3)?,
            params: row.get(4)?,
            status: row.get(5)?,
            current_phase: row.get(6)?,
            hitl_enabled: row.get(7)?,
            retry_count: row.get(8)?,
            error_message: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn row_to_phase_result(row: &Row<'_>) -> rusqlite::Result<PhaseResultRow> {
        Ok(PhaseResultRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            phase_number: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            quality_score: row.get(5)?,
            processing_duration_ms: row.get(6)?,
            retry_count: row.get(7)?,
            error_message: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            ai_assisted: row.get(11)?,
        })
    }

    fn row_to_content(row: &Row<'_>) -> rusqlite::Result<ContentRow> {
        Ok(ContentRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            phase_number: row.get(2)?,
            content_type: row.get(3)?,
            content_hash: row.get(4)?,
            data: row.get(5)?,
            status: row.get(6)?,
            quality_score: row.get(7)?,
            generated_by: row.get(8)?,
            created_at: row.get(9)?,
        })
    }
}

const SESSION_COLUMNS: &str = "id, user_id, title, input_text, params, status, current_phase, \
     hitl_enabled, retry_count, error_message, created_at, updated_at, started_at, completed_at";

const PHASE_RESULT_COLUMNS: &str = "id, session_id, phase_number, status, output, quality_score, \
     processing_duration_ms, retry_count, error_message, started_at, completed_at, ai_assisted";

const CONTENT_COLUMNS: &str = "id, session_id, phase_number, content_type, content_hash, data, \
     status, quality_score, generated_by, created_at";

struct SessionRow {
    id: String,
    user_id: String,
    title: String,
    input_text: String,
    params: String,
    status: String,
    current_phase: u8,
    hitl_enabled: bool,
    retry_count: u32,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            id: parse_uuid(&self.id)?,
            user_id: self.user_id,
            title: self.title,
            input_text: self.input_text,
            params: serde_json::from_str(&self.params).context("Failed to parse params JSON")?,
            status: SessionStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown session status '{}'", self.status))?,
            current_phase: self.current_phase,
            hitl_enabled: self.hitl_enabled,
            retry_count: self.retry_count,
            error_message: self.error_message,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

struct PhaseResultRow {
    id: String,
    session_id: String,
    phase_number: u8,
    status: String,
    output: Option<String>,
    quality_score: Option<String>,
    processing_duration_ms: Option<u64>,
    retry_count: u32,
    error_message: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    ai_assisted: bool,
}

impl PhaseResultRow {
    fn into_result(self) -> Result<PhaseResult> {
        Ok(PhaseResult {
            id: parse_uuid(&self.id)?,
            session_id: parse_uuid(&self.session_id)?,
            phase_number: self.phase_number,
            status: PhaseStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown phase status '{}'", self.status))?,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse output JSON")?,
            quality_score: self
                .quality_score
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse quality score JSON")?,
            processing_duration_ms: self.processing_duration_ms,
            retry_count: self.retry_count,
            error_message: self.error_message,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            ai_assisted: self.ai_assisted,
        })
    }
}

struct ContentRow {
    id: String,
    session_id: String,
    phase_number: u8,
    content_type: String,
    content_hash: String,
    data: String,
    status: String,
    quality_score: Option<f64>,
    generated_by: String,
    created_at: String,
}

impl ContentRow {
    fn into_content(self) -> Result<GeneratedContent> {
        Ok(GeneratedContent {
            id: parse_uuid(&self.id)?,
            session_id: parse_uuid(&self.session_id)?,
            phase_number: self.phase_number,
            content_type: ContentType::parse(&self.content_type)
                .ok_or_else(|| anyhow!("unknown content type '{}'", self.content_type))?,
            content_hash: self.content_hash,
            data: serde_json::from_str(&self.data).context("Failed to parse content JSON")?,
            status: ContentStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown content status '{}'", self.status))?,
            quality_score: self.quality_score,
            generated_by: self.generated_by,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid uuid '{}'", raw))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp '{}'", raw))
}

#[async_trait]
impl SessionRepository for SqliteStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let conn = self.lock()?;
        // A plain REPLACE would delete-and-reinsert the row, cascading away
        // the session's phase results; this must be a true upsert.
        conn.execute(
            "INSERT INTO sessions (id, user_id, title, input_text, params, status, \
             current_phase, hitl_enabled, retry_count, error_message, created_at, updated_at, \
             started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             ON CONFLICT(id) DO UPDATE SET \
             user_id = excluded.user_id, title = excluded.title, \
             input_text = excluded.input_text, params = excluded.params, \
             status = excluded.status, current_phase = excluded.current_phase, \
             hitl_enabled = excluded.hitl_enabled, retry_count = excluded.retry_count, \
             error_message = excluded.error_message, updated_at = excluded.updated_at, \
             started_at = excluded.started_at, completed_at = excluded.completed_at",
            params![
                session.id.to_string(),
                session.user_id,
                session.title,
                session.input_text,
                serde_json::to_string(&session.params)?,
                session.status.as_str(),
                session.current_phase,
                session.hitl_enabled,
                session.retry_count,
                session.error_message,
                session.created_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.started_at.map(|t| t.to_rfc3339()),
                session.completed_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to upsert session")?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions WHERE id = ?1",
                SESSION_COLUMNS
            ))
            .context("Failed to prepare find_by_id")?;
        let mut rows = stmt
            .query_map(params![id.to_string()], Self::row_to_session)
            .context("Failed to query session")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read session row")?.into_session()?)),
            None => Ok(None),
        }
    }

    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions WHERE status = ?1 ORDER BY created_at",
                SESSION_COLUMNS
            ))
            .context("Failed to prepare find_by_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], Self::row_to_session)
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.context("Failed to read session row")?.into_session()?);
        }
        Ok(sessions)
    }

    async fn update_status(&self, id: Uuid, status: SessionStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.to_string()],
        )
        .context("Failed to update session status")?;
        Ok(())
    }

    async fn find_stale_sessions(&self, threshold_minutes: i64) -> Result<Vec<Session>> {
        let cutoff = (Utc::now() - Duration::minutes(threshold_minutes)).to_rfc3339();
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sessions \
                 WHERE status NOT IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
                SESSION_COLUMNS
            ))
            .context("Failed to prepare find_stale_sessions")?;
        let rows = stmt
            .query_map(params![cutoff], Self::row_to_session)
            .context("Failed to query stale sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.context("Failed to read session row")?.into_session()?);
        }
        Ok(sessions)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete session")?;
        Ok(())
    }
}

#[async_trait]
impl PhaseResultRepository for SqliteStore {
    async fn save(&self, result: &PhaseResult) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO phase_results (id, session_id, phase_number, status, output, \
             quality_score, processing_duration_ms, retry_count, error_message, started_at, \
             completed_at, ai_assisted) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(session_id, phase_number) DO UPDATE SET \
             status = excluded.status, output = excluded.output, \
             quality_score = excluded.quality_score, \
             processing_duration_ms = excluded.processing_duration_ms, \
             retry_count = excluded.retry_count, error_message = excluded.error_message, \
             started_at = excluded.started_at, completed_at = excluded.completed_at, \
             ai_assisted = excluded.ai_assisted",
            params![
                result.id.to_string(),
                result.session_id.to_string(),
                result.phase_number,
                result.status.as_str(),
                result
                    .output
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                result
                    .quality_score
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                result.processing_duration_ms,
                result.retry_count,
                result.error_message,
                result.started_at.map(|t| t.to_rfc3339()),
                result.completed_at.map(|t| t.to_rfc3339()),
                result.ai_assisted,
            ],
        )
        .context("Failed to upsert phase result")?;
        Ok(())
    }

    async fn find_by_session_and_phase(
        &self,
        session_id: Uuid,
        phase_number: u8,
    ) -> Result<Option<PhaseResult>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM phase_results WHERE session_id = ?1 AND phase_number = ?2",
                PHASE_RESULT_COLUMNS
            ))
            .context("Failed to prepare find_by_session_and_phase")?;
        let mut rows = stmt
            .query_map(
                params![session_id.to_string(), phase_number],
                Self::row_to_phase_result,
            )
            .context("Failed to query phase result")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("Failed to read phase result row")?.into_result()?,
            )),
            None => Ok(None),
        }
    }

    async fn find_by_session(&self, session_id: Uuid) -> Result<Vec<PhaseResult>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM phase_results WHERE session_id = ?1 ORDER BY phase_number",
                PHASE_RESULT_COLUMNS
            ))
            .context("Failed to prepare find_by_session")?;
        let rows = stmt
            .query_map(params![session_id.to_string()], Self::row_to_phase_result)
            .context("Failed to query phase results")?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("Failed to read phase result row")?.into_result()?);
        }
        Ok(results)
    }
}

#[async_trait]
impl GeneratedContentRepository for SqliteStore {
    async fn save(&self, content: &GeneratedContent) -> Result<Uuid> {
        let conn = self.lock()?;
        // The dedup quadruple is unique; on conflict, hand back the row
        // that is already there.
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM generated_content \
                 WHERE session_id = ?1 AND phase_number = ?2 AND content_type = ?3 \
                 AND content_hash = ?4",
                params![
                    content.session_id.to_string(),
                    content.phase_number,
                    content.content_type.as_str(),
                    content.content_hash,
                ],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to check for duplicate content")?;
        if let Some(id) = existing {
            return parse_uuid(&id);
        }

        conn.execute(
            "INSERT INTO generated_content (id, session_id, phase_number, content_type, \
             content_hash, data, status, quality_score, generated_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                content.id.to_string(),
                content.session_id.to_string(),
                content.phase_number,
                content.content_type.as_str(),
                content.content_hash,
                serde_json::to_string(&content.data)?,
                content.status.as_str(),
                content.quality_score,
                content.generated_by,
                content.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert content")?;
        Ok(content.id)
    }

    async fn find_by_session(&self, session_id: Uuid) -> Result<Vec<GeneratedContent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM generated_content WHERE session_id = ?1 \
                 ORDER BY phase_number, created_at",
                CONTENT_COLUMNS
            ))
            .context("Failed to prepare content query")?;
        let rows = stmt
            .query_map(params![session_id.to_string()], Self::row_to_content)
            .context("Failed to query content")?;
        let mut content = Vec::new();
        for row in rows {
            content.push(row.context("Failed to read content row")?.into_content()?);
        }
        Ok(content)
    }
}
