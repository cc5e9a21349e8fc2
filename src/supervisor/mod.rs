//! Session supervisor.
//!
//! Holds the set of active sessions, enforces the global session-concurrency
//! cap, relays control operations (pause/resume/cancel/retry/feedback) to
//! the per-session drivers, serves progress queries and reaps stale
//! sessions. Each session is driven by exactly one driver task at a time;
//! the supervisor only ever reads session state for projections.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::orchestrator::{
    ControlState, SessionControl, SessionDriver, build_progress, control_pair,
};
use crate::orchestrator::driver::PipelineDeps;
use mangaforge_common::{
    GenerationParameters, PipelineEvent, ProgressSnapshot, Session, SessionStatus,
};

struct SessionHandle {
    control: SessionControl,
    join: JoinHandle<()>,
}

pub struct PipelineSupervisor {
    deps: Arc<PipelineDeps>,
    handles: Arc<DashMap<Uuid, SessionHandle>>,
    permits: Arc<Semaphore>,
}

impl PipelineSupervisor {
    pub fn new(deps: PipelineDeps) -> Self {
        let permits = Arc::new(Semaphore::new(deps.config.max_concurrent_sessions.max(1)));
        Self {
            deps: Arc::new(deps),
            handles: Arc::new(DashMap::new()),
            permits,
        }
    }

    pub fn deps(&self) -> &Arc<PipelineDeps> {
        &self.deps
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.deps.events.subscribe()
    }

    /// Create a session and queue it for execution. The session stays
    /// `queued` until a concurrency permit frees up.
    pub async fn submit(
        &self,
        user_id: &str,
        title: &str,
        input_text: &str,
        params: GenerationParameters,
    ) -> Result<Uuid, PipelineError> {
        let session = Session::new(user_id, title, input_text, params);
        let session_id = session.id;
        self.deps.sessions.save(&session).await?;
        info!(session = %session_id, user = user_id, "session submitted");
        self.spawn_driver(session_id);
        Ok(session_id)
    }

    fn spawn_driver(&self, session_id: Uuid) {
        let (control, signals) = control_pair();
        let cancel = control.cancel.clone();
        let deps = Arc::clone(&self.deps);
        let permits = Arc::clone(&self.permits);

        let join = tokio::spawn(async move {
            // Backpressure: queued sessions wait here for a permit, and a
            // cancel while queued resolves without ever running a phase.
            let _permit = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Ok(Some(mut session)) = deps.sessions.find_by_id(session_id).await
                        && !session.status.is_terminal()
                    {
                        session.mark_cancelled(None);
                        let _ = deps.sessions.save(&session).await;
                        deps.events.emit(PipelineEvent::SessionCancelled { session_id });
                    }
                    return;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let driver = SessionDriver::new(Arc::clone(&deps));
            match driver.run(session_id, signals).await {
                Ok(outcome) => {
                    debug!(session = %session_id, ?outcome, "driver finished");
                }
                Err(err) => {
                    error!(session = %session_id, error = %err, "driver errored");
                    if let Ok(Some(mut session)) = deps.sessions.find_by_id(session_id).await
                        && !session.status.is_terminal()
                    {
                        session.mark_failed(&err.to_string());
                        let _ = deps.sessions.save(&session).await;
                        deps.events.emit(PipelineEvent::SessionFailed {
                            session_id,
                            error: err.to_string(),
                        });
                    }
                }
            }
        });

        self.handles
            .insert(session_id, SessionHandle { control, join });
    }

    async fn load(&self, session_id: Uuid) -> Result<Session, PipelineError> {
        self.deps
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or(PipelineError::SessionNotFound(session_id))
    }

    /// Request a pause. The driver honors it at the next phase boundary;
    /// the in-flight phase runs to completion or timeout.
    pub async fn pause(&self, session_id: Uuid) -> Result<(), PipelineError> {
        let session = self.load(session_id).await?;
        if !session.status.can_pause() {
            return Err(PipelineError::InvalidTransition {
                status: session.status,
                action: "pause",
            });
        }
        let handle = self
            .handles
            .get(&session_id)
            .ok_or_else(|| PipelineError::Internal("no active driver for session".to_string()))?;
        let _ = handle.control.pause.send(ControlState::Paused);
        info!(session = %session_id, "pause requested");
        Ok(())
    }

    /// Resume a paused session, respawning the driver from persisted state
    /// if its previous run already exited.
    pub async fn resume(&self, session_id: Uuid) -> Result<(), PipelineError> {
        let session = self.load(session_id).await?;

        if session.status == SessionStatus::Paused {
            // The driver exited (or is in the middle of exiting) at a
            // boundary; wait it out, then rehydrate with a fresh run.
            if let Some((_, handle)) = self.handles.remove(&session_id) {
                let _ = handle.control.pause.send(ControlState::Running);
                let _ = handle.join.await;
            }
            info!(session = %session_id, "resuming from persisted state");
            self.spawn_driver(session_id);
            return Ok(());
        }

        if let Some(handle) = self.handles.get(&session_id)
            && !handle.join.is_finished()
            && *handle.control.pause.borrow() == ControlState::Paused
        {
            // Pause requested but not yet observed: just flip the switch
            // back before the driver reaches a boundary.
            let _ = handle.control.pause.send(ControlState::Running);
            info!(session = %session_id, "resume requested (driver still live)");
            return Ok(());
        }

        Err(PipelineError::InvalidTransition {
            status: session.status,
            action: "resume",
        })
    }

    /// Cancel from any non-terminal state. In-flight work observes the
    /// token cooperatively; partial outputs are not persisted.
    pub async fn cancel(
        &self,
        session_id: Uuid,
        reason: Option<&str>,
    ) -> Result<(), PipelineError> {
        let session = self.load(session_id).await?;
        if session.status.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                status: session.status,
                action: "cancel",
            });
        }

        if session.status == SessionStatus::Paused {
            // The driver exited (or is exiting) at its pause boundary; wait
            // it out, then finalize directly.
            if let Some((_, handle)) = self.handles.remove(&session_id) {
                handle.control.cancel.cancel();
                let _ = handle.join.await;
            }
            let mut session = self.load(session_id).await?;
            if !session.status.is_terminal() {
                session.mark_cancelled(reason);
                self.deps.sessions.save(&session).await?;
                self.deps
                    .events
                    .emit(PipelineEvent::SessionCancelled { session_id });
            }
            return Ok(());
        }

        if let Some(handle) = self.handles.get(&session_id)
            && !handle.join.is_finished()
        {
            handle.control.cancel.cancel();
            info!(session = %session_id, "cancel signalled to driver");
            return Ok(());
        }

        // No live driver and not paused: finalize directly.
        let mut session = session;
        session.mark_cancelled(reason);
        self.deps.sessions.save(&session).await?;
        self.deps
            .events
            .emit(PipelineEvent::SessionCancelled { session_id });
        Ok(())
    }

    /// Retry a failed session from its first non-completed phase.
    pub async fn retry(&self, session_id: Uuid) -> Result<(), PipelineError> {
        let mut session = self.load(session_id).await?;
        if session.status != SessionStatus::Failed {
            return Err(PipelineError::InvalidTransition {
                status: session.status,
                action: "retry",
            });
        }
        if session.retry_count >= self.deps.config.session_max_retries {
            return Err(PipelineError::RetryLimitReached {
                session_id,
                retries: session.retry_count,
            });
        }
        session.retry_count += 1;
        session.status = SessionStatus::Queued;
        session.error_message = None;
        session.touch();
        self.deps.sessions.save(&session).await?;
        info!(session = %session_id, retry = session.retry_count, "session retry");
        self.spawn_driver(session_id);
        Ok(())
    }

    /// Deliver a HITL decision to a session waiting for feedback.
    pub async fn submit_feedback(
        &self,
        session_id: Uuid,
        phase: u8,
        approved: bool,
        payload: Value,
    ) -> Result<(), PipelineError> {
        let session = self.load(session_id).await?;
        if session.status != SessionStatus::WaitingFeedback {
            return Err(PipelineError::InvalidTransition {
                status: session.status,
                action: "submit_feedback",
            });
        }
        if phase != session.current_phase {
            return Err(PipelineError::FeedbackPhaseMismatch {
                submitted: phase,
                awaited: session.current_phase,
            });
        }
        let handle = self
            .handles
            .get(&session_id)
            .ok_or_else(|| PipelineError::Internal("no active driver for session".to_string()))?;
        handle
            .control
            .feedback
            .send(crate::orchestrator::FeedbackDecision {
                phase,
                approved,
                payload,
            })
            .await
            .map_err(|_| PipelineError::Internal("driver feedback channel closed".to_string()))?;
        info!(session = %session_id, phase, approved, "feedback submitted");
        Ok(())
    }

    pub async fn get_progress(
        &self,
        session_id: Uuid,
    ) -> Result<ProgressSnapshot, PipelineError> {
        build_progress(&self.deps, session_id).await
    }

    /// Generation metrics across all sessions this supervisor has driven.
    pub fn metrics(&self) -> Vec<crate::agents::PhaseMetricsSnapshot> {
        self.deps.metrics.snapshot()
    }

    /// Poll until the session status satisfies the predicate, or time out.
    pub async fn wait_for_status(
        &self,
        session_id: Uuid,
        predicate: impl Fn(SessionStatus) -> bool,
        timeout: Duration,
    ) -> Result<SessionStatus, PipelineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.load(session_id).await?.status;
            if predicate(status) {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::Internal(format!(
                    "timed out waiting for session {} (last status {})",
                    session_id, status
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Fail sessions that have sat untouched past the staleness threshold.
    /// Returns how many were reaped.
    pub async fn reap_stale(&self) -> Result<usize, PipelineError> {
        let stale = self
            .deps
            .sessions
            .find_stale_sessions(self.deps.config.stale_after_minutes)
            .await?;
        let mut reaped = 0;
        for mut session in stale {
            // A live driver means the session is merely slow, not stale.
            if let Some(handle) = self.handles.get(&session.id)
                && !handle.join.is_finished()
            {
                continue;
            }
            warn!(session = %session.id, status = %session.status, "reaping stale session");
            session.mark_failed("stale session reaped");
            self.deps.sessions.save(&session).await?;
            self.deps.events.emit(PipelineEvent::SessionFailed {
                session_id: session.id,
                error: "stale session reaped".to_string(),
            });
            reaped += 1;
        }
        Ok(reaped)
    }

    /// Periodic reaping sweep.
    pub fn start_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = supervisor.reap_stale().await {
                    warn!(error = %err, "stale-session sweep failed");
                }
            }
        })
    }

    /// Cancel everything and wait for the drivers to wind down.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = self.handles.iter().map(|entry| *entry.key()).collect();
        let mut joins = Vec::new();
        for id in ids {
            if let Some((_, handle)) = self.handles.remove(&id) {
                handle.control.cancel.cancel();
                joins.push(handle.join);
            }
        }
        futures::future::join_all(joins).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentDeps, AgentSet, MetricsRegistry};
    use crate::config::PipelineConfig;
    use crate::events::EventBus;
    use crate::gateway::{ModelGateway, StubGateway};
    use crate::store::{MemoryStore, MokaCache};

    fn supervisor_with_stub() -> PipelineSupervisor {
        let store = MemoryStore::shared();
        let gateway: Arc<dyn ModelGateway> = Arc::new(StubGateway::new());
        let config = PipelineConfig {
            agent_backoff_base: Duration::from_millis(1),
            image_backoff_base: Duration::from_millis(1),
            ..PipelineConfig::default()
        };
        let deps = PipelineDeps {
            sessions: store.clone(),
            phase_results: store.clone(),
            content: store,
            cache: Arc::new(MokaCache::new()),
            agents: AgentSet::new(),
            agent_deps: AgentDeps::new(gateway).with_retry_policy(
                3,
                Duration::from_millis(1),
                Duration::from_millis(1),
            ),
            events: EventBus::new(),
            metrics: Arc::new(MetricsRegistry::new()),
            config,
        };
        PipelineSupervisor::new(deps)
    }

    #[tokio::test]
    async fn submit_creates_a_queued_session_and_completes_it() {
        let supervisor = supervisor_with_stub();
        let id = supervisor
            .submit(
                "user-1",
                "Knight",
                "A brave knight rescues a dragon",
                GenerationParameters::default(),
            )
            .await
            .unwrap();

        let status = supervisor
            .wait_for_status(id, |s| s.is_terminal(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn control_operations_reject_unknown_sessions() {
        let supervisor = supervisor_with_stub();
        let missing = Uuid::new_v4();
        assert!(matches!(
            supervisor.pause(missing).await,
            Err(PipelineError::SessionNotFound(_))
        ));
        assert!(matches!(
            supervisor.get_progress(missing).await,
            Err(PipelineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn retry_is_rejected_for_non_failed_sessions() {
        let supervisor = supervisor_with_stub();
        let id = supervisor
            .submit("u", "t", "text", GenerationParameters::default())
            .await
            .unwrap();
        supervisor
            .wait_for_status(id, |s| s.is_terminal(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(matches!(
            supervisor.retry(id).await,
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn reap_stale_fails_abandoned_sessions() {
        let supervisor = supervisor_with_stub();
        let mut session = Session::new("u", "t", "text", GenerationParameters::default());
        session.mark_processing(2);
        session.updated_at = chrono::Utc::now() - chrono::Duration::minutes(120);
        supervisor.deps().sessions.save(&session).await.unwrap();

        let reaped = supervisor.reap_stale().await.unwrap();
        assert_eq!(reaped, 1);
        let status = supervisor.load(session.id).await.unwrap().status;
        assert_eq!(status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn feedback_outside_waiting_state_is_rejected() {
        let supervisor = supervisor_with_stub();
        let id = supervisor
            .submit("u", "t", "text", GenerationParameters::default())
            .await
            .unwrap();
        supervisor
            .wait_for_status(id, |s| s.is_terminal(), Duration::from_secs(10))
            .await
            .unwrap();
        let err = supervisor
            .submit_feedback(id, 4, true, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
    }
}
