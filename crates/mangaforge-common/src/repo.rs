//! Repository and cache trait surface.
//!
//! The orchestrator only ever talks to these traits; concrete stores live in
//! the root crate. All upserts are idempotent and keyed by entity id, so a
//! session is safe to re-drive against persisted state.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::content::GeneratedContent;
use crate::phase::PhaseResult;
use crate::session::{Session, SessionStatus};

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert or replace the session row.
    async fn save(&self, session: &Session) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>>;

    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>>;

    /// Update just the status column (plus `updated_at`).
    async fn update_status(&self, id: Uuid, status: SessionStatus) -> Result<()>;

    /// Sessions in a non-terminal status whose `updated_at` is older than
    /// the threshold. Used by the supervisor's reaping sweep.
    async fn find_stale_sessions(&self, threshold_minutes: i64) -> Result<Vec<Session>>;

    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait PhaseResultRepository: Send + Sync {
    /// Insert or replace the result for `(session_id, phase_number)`.
    async fn save(&self, result: &PhaseResult) -> Result<()>;

    async fn find_by_session_and_phase(
        &self,
        session_id: Uuid,
        phase_number: u8,
    ) -> Result<Option<PhaseResult>>;

    /// All results for a session, ordered by phase number.
    async fn find_by_session(&self, session_id: Uuid) -> Result<Vec<PhaseResult>>;
}

#[async_trait]
pub trait GeneratedContentRepository: Send + Sync {
    /// Save a content row, deduplicating on
    /// `(session_id, phase_number, content_type, content_hash)`.
    /// Returns the id of the stored row, which is the existing row's id when
    /// the hash already exists.
    async fn save(&self, content: &GeneratedContent) -> Result<Uuid>;

    async fn find_by_session(&self, session_id: Uuid) -> Result<Vec<GeneratedContent>>;
}

/// TTL'd key-value store for interim phase checkpoints.
///
/// The cache is a performance dependency, not a correctness one: everything
/// stored here is reconstructible from the repositories.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn set(&self, key: &str, value: serde_json::Value, ttl_seconds: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Cache key for a phase's interim result.
pub fn agent_result_key(phase: u8, session_id: Uuid) -> String {
    format!("agent_result:{}:{}", phase, session_id)
}
