//! In-memory repositories for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use mangaforge_common::{
    GeneratedContent, GeneratedContentRepository, PhaseResult, PhaseResultRepository, Session,
    SessionRepository, SessionStatus,
};

/// One shared in-memory store implementing all three repositories.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    phase_results: RwLock<HashMap<(Uuid, u8), PhaseResult>>,
    content: RwLock<HashMap<Uuid, GeneratedContent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn find_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn update_status(&self, id: Uuid, status: SessionStatus) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.status = status;
            session.touch();
        }
        Ok(())
    }

    async fn find_stale_sessions(&self, threshold_minutes: i64) -> Result<Vec<Session>> {
        let cutoff = Utc::now() - Duration::minutes(threshold_minutes);
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| !s.status.is_terminal() && s.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.sessions.write().await.remove(&id);
        // Cascade: a session exclusively owns its results and content.
        self.phase_results
            .write()
            .await
            .retain(|(session_id, _), _| *session_id != id);
        self.content
            .write()
            .await
            .retain(|_, content| content.session_id != id);
        Ok(())
    }
}

#[async_trait]
impl PhaseResultRepository for MemoryStore {
    async fn save(&self, result: &PhaseResult) -> Result<()> {
        self.phase_results
            .write()
            .await
            .insert((result.session_id, result.phase_number), result.clone());
        Ok(())
    }

    async fn find_by_session_and_phase(
        &self,
        session_id: Uuid,
        phase_number: u8,
    ) -> Result<Option<PhaseResult>> {
        Ok(self
            .phase_results
            .read()
            .await
            .get(&(session_id, phase_number))
            .cloned())
    }

    async fn find_by_session(&self, session_id: Uuid) -> Result<Vec<PhaseResult>> {
        let mut results: Vec<PhaseResult> = self
            .phase_results
            .read()
            .await
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.phase_number);
        Ok(results)
    }
}

#[async_trait]
impl GeneratedContentRepository for MemoryStore {
    async fn save(&self, content: &GeneratedContent) -> Result<Uuid> {
        let mut store = self.content.write().await;
        // Dedup on (session, phase, type, hash): hand back the existing row.
        if let Some(existing) = store.values().find(|c| {
            c.session_id == content.session_id
                && c.phase_number == content.phase_number
                && c.content_type == content.content_type
                && c.content_hash == content.content_hash
        }) {
            return Ok(existing.id);
        }
        store.insert(content.id, content.clone());
        Ok(content.id)
    }

    async fn find_by_session(&self, session_id: Uuid) -> Result<Vec<GeneratedContent>> {
        let mut rows: Vec<GeneratedContent> = self
            .content
            .read()
            .await
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| (c.phase_number, c.created_at));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangaforge_common::{ContentType, GenerationParameters};

    fn session() -> Session {
        Session::new("user-1", "Knight", "text", GenerationParameters::default())
    }

    #[tokio::test]
    async fn session_round_trip_and_status_query() {
        let store = MemoryStore::new();
        let mut s = session();
        SessionRepository::save(&store, &s).await.unwrap();

        let loaded = store.find_by_id(s.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Queued);

        s.mark_processing(1);
        SessionRepository::save(&store, &s).await.unwrap();
        let processing = store
            .find_by_status(SessionStatus::Processing)
            .await
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert!(
            store
                .find_by_status(SessionStatus::Queued)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn phase_result_upsert_keeps_one_row_per_phase() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let mut result = PhaseResult::begin(session_id, 1);
        PhaseResultRepository::save(&store, &result).await.unwrap();

        result.retry_count = 2;
        PhaseResultRepository::save(&store, &result).await.unwrap();

        let rows = PhaseResultRepository::find_by_session(&store, session_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retry_count, 2);
    }

    #[tokio::test]
    async fn content_dedup_returns_existing_id() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        let a = GeneratedContent::new(
            session_id,
            5,
            ContentType::Image,
            "hash-1".into(),
            serde_json::json!({"url": "x"}),
            "image-default",
            Some(0.9),
        );
        let b = GeneratedContent::new(
            session_id,
            5,
            ContentType::Image,
            "hash-1".into(),
            serde_json::json!({"url": "x"}),
            "image-default",
            Some(0.9),
        );

        let first = GeneratedContentRepository::save(&store, &a).await.unwrap();
        let second = GeneratedContentRepository::save(&store, &b).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            GeneratedContentRepository::find_by_session(&store, session_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn delete_cascades_to_results_and_content() {
        let store = MemoryStore::new();
        let s = session();
        SessionRepository::save(&store, &s).await.unwrap();
        PhaseResultRepository::save(&store, &PhaseResult::begin(s.id, 1))
            .await
            .unwrap();
        GeneratedContentRepository::save(
            &store,
            &GeneratedContent::new(
                s.id,
                1,
                ContentType::Text,
                "h".into(),
                serde_json::json!({}),
                "fallback",
                None,
            ),
        )
        .await
        .unwrap();

        store.delete(s.id).await.unwrap();
        assert!(store.find_by_id(s.id).await.unwrap().is_none());
        assert!(
            PhaseResultRepository::find_by_session(&store, s.id)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            GeneratedContentRepository::find_by_session(&store, s.id)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn stale_sessions_exclude_terminal_and_fresh() {
        let store = MemoryStore::new();
        let mut stale = session();
        stale.mark_processing(2);
        stale.updated_at = Utc::now() - Duration::minutes(90);
        store.sessions.write().await.insert(stale.id, stale.clone());

        let mut fresh = session();
        fresh.mark_processing(1);
        SessionRepository::save(&store, &fresh).await.unwrap();

        let mut done = session();
        done.mark_completed();
        done.updated_at = Utc::now() - Duration::minutes(90);
        store.sessions.write().await.insert(done.id, done);

        let found = store.find_stale_sessions(30).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }
}
