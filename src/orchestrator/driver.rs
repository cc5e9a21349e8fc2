//! The per-session driver: an explicit state machine over phase indices.
//!
//! One driver owns one session at a time. Phases run strictly sequentially;
//! phase `p + 1` only ever observes the fully persisted output of phase `p`.
//! Suspension points are explicit: the model call (bounded by the per-phase
//! timeout inside the agent), retry backoff sleeps, and the HITL wait. Pause
//! is observed at phase boundaries only; cancellation at every suspension
//! point.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::outputs::{PhaseArtifact, PhaseOutput, PhaseOutputs};
use crate::agents::{AgentDeps, AgentRequest, AgentSet, MetricsRegistry};
use crate::config::PipelineConfig;
use crate::errors::{AgentError, PipelineError};
use crate::events::EventBus;
use crate::quality::{AssessmentContext, assess};
use crate::util::content_hash;
use mangaforge_common::{
    CacheStore, ContentType, GeneratedContent, GeneratedContentRepository, PHASE_COUNT,
    PhaseProgress, PhaseResult, PhaseResultRepository, PhaseStatus, PipelineEvent,
    ProgressSnapshot, QualityScore, Session, SessionRepository, SessionStatus, agent_result_key,
    is_critical_phase, phase_name,
};

use super::control::{ControlState, DriverSignals};

/// Everything a driver needs, injected once and shared across sessions.
pub struct PipelineDeps {
    pub sessions: Arc<dyn SessionRepository>,
    pub phase_results: Arc<dyn PhaseResultRepository>,
    pub content: Arc<dyn GeneratedContentRepository>,
    pub cache: Arc<dyn CacheStore>,
    pub agents: AgentSet,
    pub agent_deps: AgentDeps,
    pub events: EventBus,
    pub metrics: Arc<MetricsRegistry>,
    pub config: PipelineConfig,
}

/// How a single `run` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Failed,
    Cancelled,
    Paused,
}

pub struct SessionDriver {
    deps: Arc<PipelineDeps>,
}

impl SessionDriver {
    pub fn new(deps: Arc<PipelineDeps>) -> Self {
        Self { deps }
    }

    /// Drive the session to a terminal status, a pause, or a HITL rejection
    /// limit. Re-running against a completed session is a no-op.
    pub async fn run(
        &self,
        session_id: Uuid,
        mut signals: DriverSignals,
    ) -> Result<DriveOutcome, PipelineError> {
        let deps = &self.deps;
        let mut session = deps
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or(PipelineError::SessionNotFound(session_id))?;

        match session.status {
            SessionStatus::Completed => return Ok(DriveOutcome::Completed),
            SessionStatus::Cancelled => return Ok(DriveOutcome::Cancelled),
            SessionStatus::Failed => return Ok(DriveOutcome::Failed),
            _ => {}
        }

        // Rehydrate outputs of already-completed phases.
        let mut previous = PhaseOutputs::default();
        let records = deps.phase_results.find_by_session(session_id).await?;
        for record in &records {
            if record.status == PhaseStatus::Completed {
                match self.load_artifact(record).await {
                    Ok(artifact) => previous.set(artifact.output),
                    Err(err) => return self.fail_session(&mut session, &err.to_string()).await,
                }
            }
        }

        let first_incomplete = (1..=PHASE_COUNT)
            .find(|p| !previous.has_phase(*p))
            .unwrap_or(PHASE_COUNT + 1);
        if first_incomplete > PHASE_COUNT && session.current_phase >= PHASE_COUNT {
            // Everything already ran; make completion durable and stop.
            session.mark_completed();
            deps.sessions.save(&session).await?;
            deps.events
                .emit(PipelineEvent::SessionCompleted { session_id });
            return Ok(DriveOutcome::Completed);
        }

        let mut phase = if session.current_phase >= 1 {
            session.current_phase.min(first_incomplete)
        } else {
            first_incomplete
        };
        let mut rerun_feedback: Option<Value> = None;

        while phase <= PHASE_COUNT {
            // Phase boundary: the only place pause is honored.
            if signals.cancel.is_cancelled() {
                return self.cancel_session(&mut session, None).await;
            }
            if signals.is_paused() {
                return self.pause_session(&mut session).await;
            }

            let existing = deps
                .phase_results
                .find_by_session_and_phase(session_id, phase)
                .await?;

            // A completed result at the current phase with no recorded
            // advance means the session paused (or restarted) while waiting
            // for feedback: re-enter the gate instead of re-executing.
            if rerun_feedback.is_none()
                && let Some(record) = &existing
                && record.status == PhaseStatus::Completed
            {
                if phase < session.current_phase {
                    phase += 1;
                    continue;
                }
                let artifact = match self.load_artifact(record).await {
                    Ok(artifact) => artifact,
                    Err(err) => return self.fail_session(&mut session, &err.to_string()).await,
                };
                let score = record.quality_score.clone().ok_or_else(|| {
                    PipelineError::Internal(format!(
                        "completed phase {} has no quality score",
                        phase
                    ))
                })?;
                match self
                    .gate(&mut session, &mut signals, phase, record, &artifact, &score)
                    .await?
                {
                    GateOutcome::Advance => {
                        previous.set(artifact.output);
                        phase += 1;
                        continue;
                    }
                    GateOutcome::Rerun(payload) => {
                        rerun_feedback = Some(payload);
                        continue;
                    }
                    GateOutcome::Stop(outcome) => return Ok(outcome),
                }
            }

            // Execute the phase.
            session.mark_processing(phase);
            deps.sessions.save(&session).await?;
            deps.events.emit(PipelineEvent::PhaseStarted {
                session_id,
                phase,
            });

            let retry_base = match (&existing, rerun_feedback.is_some()) {
                (Some(record), true) => record.retry_count + 1,
                _ => 0,
            };
            let prior_score = existing.as_ref().and_then(|r| r.quality_score.clone());

            let mut result = PhaseResult::begin(session_id, phase);
            result.retry_count = retry_base;
            deps.phase_results.save(&result).await?;

            let agent = deps.agents.for_phase(phase).ok_or_else(|| {
                PipelineError::Internal(format!("no agent registered for phase {}", phase))
            })?;

            info!(session = %session_id, phase, name = phase_name(phase), "phase started");
            let started = Instant::now();
            let execution = agent
                .execute(
                    &deps.agent_deps,
                    AgentRequest {
                        session_id,
                        input_text: &session.input_text,
                        previous: &previous,
                        params: &session.params,
                        feedback: rerun_feedback.as_ref(),
                    },
                    &signals.cancel,
                )
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match execution {
                Ok(outcome) => {
                    let ctx = AssessmentContext {
                        input_text: &session.input_text,
                        previous: &previous,
                        self_scores: &outcome.self_scores,
                    };
                    let score = assess(phase, &outcome.artifact.output, &session.params, &ctx);
                    if let Some(prior) = &prior_score {
                        let diff = score.compare(prior);
                        info!(
                            session = %session_id,
                            phase,
                            delta = diff.delta,
                            grades = %diff.grade_change,
                            "phase re-run after feedback"
                        );
                    }

                    result.retry_count = retry_base + outcome.retry_count;
                    result.complete(
                        outcome.artifact.to_stored(),
                        score.clone(),
                        duration_ms,
                        outcome.ai_assisted,
                    );
                    deps.phase_results.save(&result).await?;
                    self.persist_content(&session, phase, &outcome.artifact, outcome.ai_assisted)
                        .await?;
                    if let Err(err) = deps
                        .cache
                        .set(
                            &agent_result_key(phase, session_id),
                            outcome.artifact.to_stored(),
                            deps.config.cache_ttl_secs,
                        )
                        .await
                    {
                        // Cache is a performance dependency only.
                        debug!(session = %session_id, phase, error = %err, "checkpoint write failed");
                    }
                    deps.metrics
                        .record_success(phase, duration_ms, outcome.ai_assisted);
                    deps.events.emit(PipelineEvent::PhaseCompleted {
                        session_id,
                        phase,
                        quality: score.overall,
                    });
                    info!(
                        session = %session_id,
                        phase,
                        quality = score.overall,
                        grade = %score.grade,
                        ai_assisted = outcome.ai_assisted,
                        "phase completed"
                    );

                    rerun_feedback = None;
                    match self
                        .gate(
                            &mut session,
                            &mut signals,
                            phase,
                            &result,
                            &outcome.artifact,
                            &score,
                        )
                        .await?
                    {
                        GateOutcome::Advance => {
                            previous.set(outcome.artifact.output);
                            phase += 1;
                        }
                        GateOutcome::Rerun(payload) => {
                            rerun_feedback = Some(payload);
                        }
                        GateOutcome::Stop(outcome) => return Ok(outcome),
                    }
                }
                Err(err) if err.is_cancellation() => {
                    result.fail("cancelled", duration_ms);
                    deps.phase_results.save(&result).await?;
                    return self.cancel_session(&mut session, None).await;
                }
                Err(err) => {
                    let message = err.to_string();
                    if let AgentError::RetryExhausted { attempts, .. } = &err {
                        result.retry_count = retry_base + attempts;
                    }
                    result.fail(&message, duration_ms);
                    deps.phase_results.save(&result).await?;
                    deps.metrics.record_failure(phase, duration_ms, &message);
                    deps.events.emit(PipelineEvent::PhaseFailed {
                        session_id,
                        phase,
                        error: message.clone(),
                    });
                    error!(session = %session_id, phase, error = %message, "phase failed");
                    return self.fail_session(&mut session, &message).await;
                }
            }
        }

        session.mark_completed();
        deps.sessions.save(&session).await?;
        deps.events
            .emit(PipelineEvent::SessionCompleted { session_id });
        info!(session = %session_id, "session completed");
        Ok(DriveOutcome::Completed)
    }

    /// Quality/HITL gate after a completed phase.
    async fn gate(
        &self,
        session: &mut Session,
        signals: &mut DriverSignals,
        phase: u8,
        result: &PhaseResult,
        artifact: &PhaseArtifact,
        score: &QualityScore,
    ) -> Result<GateOutcome, PipelineError> {
        let below_threshold = score.overall < session.params.quality_threshold;
        let needs_feedback =
            session.hitl_enabled && (below_threshold || is_critical_phase(phase));
        if !needs_feedback {
            return Ok(GateOutcome::Advance);
        }

        // Drop any decisions left over from a previous gate.
        loop {
            match signals.feedback.try_recv() {
                Ok(stale) => debug!(phase = stale.phase, "discarding stale feedback"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        session.status = SessionStatus::WaitingFeedback;
        session.touch();
        self.deps.sessions.save(session).await?;
        self.deps.events.emit(PipelineEvent::FeedbackRequested {
            session_id: session.id,
            phase,
            preview: serde_json::to_value(&artifact.preview).unwrap_or(Value::Null),
        });
        info!(session = %session.id, phase, quality = score.overall, "waiting for feedback");

        loop {
            tokio::select! {
                _ = signals.cancel.cancelled() => {
                    return Ok(GateOutcome::Stop(
                        self.cancel_session(session, None).await?,
                    ));
                }
                changed = signals.pause.changed() => {
                    if changed.is_ok() && *signals.pause.borrow() == ControlState::Paused {
                        return Ok(GateOutcome::Stop(self.pause_session(session).await?));
                    }
                }
                decision = signals.feedback.recv() => {
                    let Some(decision) = decision else {
                        return Err(PipelineError::Internal(
                            "feedback channel closed while waiting".to_string(),
                        ));
                    };
                    if decision.phase != phase {
                        warn!(
                            submitted = decision.phase,
                            awaited = phase,
                            "feedback for the wrong phase, ignoring"
                        );
                        continue;
                    }
                    if decision.approved {
                        return Ok(GateOutcome::Advance);
                    }
                    if result.retry_count < self.deps.config.phase_max_retries {
                        info!(session = %session.id, phase, "feedback rejected, re-running phase");
                        return Ok(GateOutcome::Rerun(decision.payload));
                    }
                    let message = format!(
                        "phase {} rejected and retry budget exhausted",
                        phase
                    );
                    return Ok(GateOutcome::Stop(
                        self.fail_session(session, &message).await?,
                    ));
                }
            }
        }
    }

    async fn load_artifact(&self, record: &PhaseResult) -> Result<PhaseArtifact, PipelineError> {
        let key = agent_result_key(record.phase_number, record.session_id);
        if let Ok(Some(cached)) = self.deps.cache.get(&key).await
            && let Ok(artifact) = PhaseArtifact::from_stored(record.phase_number, &cached)
        {
            return Ok(artifact);
        }
        let stored = record.output.as_ref().ok_or_else(|| {
            PipelineError::Internal(format!(
                "completed phase {} has no stored output",
                record.phase_number
            ))
        })?;
        PhaseArtifact::from_stored(record.phase_number, stored).map_err(|message| {
            PipelineError::Agent(AgentError::InputValidation {
                phase: record.phase_number,
                errors: vec![message],
            })
        })
    }

    async fn persist_content(
        &self,
        session: &Session,
        phase: u8,
        artifact: &PhaseArtifact,
        ai_assisted: bool,
    ) -> Result<(), PipelineError> {
        for row in content_rows(session, phase, artifact, ai_assisted) {
            self.deps.content.save(&row).await?;
        }
        Ok(())
    }

    async fn fail_session(
        &self,
        session: &mut Session,
        message: &str,
    ) -> Result<DriveOutcome, PipelineError> {
        session.mark_failed(message);
        self.deps.sessions.save(session).await?;
        self.deps.events.emit(PipelineEvent::SessionFailed {
            session_id: session.id,
            error: message.to_string(),
        });
        error!(session = %session.id, error = %message, "session failed");
        Ok(DriveOutcome::Failed)
    }

    async fn cancel_session(
        &self,
        session: &mut Session,
        reason: Option<&str>,
    ) -> Result<DriveOutcome, PipelineError> {
        session.mark_cancelled(reason);
        self.deps.sessions.save(session).await?;
        self.deps.events.emit(PipelineEvent::SessionCancelled {
            session_id: session.id,
        });
        info!(session = %session.id, "session cancelled");
        Ok(DriveOutcome::Cancelled)
    }

    async fn pause_session(&self, session: &mut Session) -> Result<DriveOutcome, PipelineError> {
        session.status = SessionStatus::Paused;
        session.touch();
        self.deps.sessions.save(session).await?;
        info!(session = %session.id, phase = session.current_phase, "session paused");
        Ok(DriveOutcome::Paused)
    }
}

enum GateOutcome {
    Advance,
    Rerun(Value),
    Stop(DriveOutcome),
}

/// Content rows a completed phase contributes, deduplicated by hash at the
/// repository.
fn content_rows(
    session: &Session,
    phase: u8,
    artifact: &PhaseArtifact,
    ai_assisted: bool,
) -> Vec<GeneratedContent> {
    let generated_by = if ai_assisted {
        session.params.model_for(phase).model_id
    } else {
        "fallback".to_string()
    };

    if let PhaseOutput::Imagery(imagery) = &artifact.output {
        return imagery
            .images
            .iter()
            .filter(|image| image.success)
            .map(|image| {
                let data = serde_json::json!({
                    "panel_id": image.panel_id,
                    "image_url": image.image_url,
                    "thumbnail_url": image.thumbnail_url,
                    "quality": image.quality_score,
                });
                GeneratedContent::new(
                    session.id,
                    phase,
                    ContentType::Image,
                    content_hash(&data),
                    data,
                    &generated_by,
                    image.quality_score,
                )
            })
            .collect();
    }

    let content_type = match phase {
        4 => ContentType::Layout,
        6 => ContentType::Dialogue,
        7 => ContentType::Composite,
        _ => ContentType::Text,
    };
    let data = artifact.output.to_value();
    vec![GeneratedContent::new(
        session.id,
        phase,
        content_type,
        content_hash(&data),
        data,
        &generated_by,
        None,
    )]
}

/// Snapshot projection served by `GetProgress`.
pub async fn build_progress(
    deps: &PipelineDeps,
    session_id: Uuid,
) -> Result<ProgressSnapshot, PipelineError> {
    let session = deps
        .sessions
        .find_by_id(session_id)
        .await?
        .ok_or(PipelineError::SessionNotFound(session_id))?;
    let records = deps.phase_results.find_by_session(session_id).await?;

    let phases: Vec<PhaseProgress> = (1..=PHASE_COUNT)
        .map(|phase| {
            match records.iter().find(|r| r.phase_number == phase) {
                Some(record) => PhaseProgress {
                    phase_number: phase,
                    name: phase_name(phase).to_string(),
                    status: record.status,
                    quality: record.quality_score.as_ref().map(|s| s.overall),
                    retry_count: record.retry_count,
                    duration_ms: record.processing_duration_ms,
                    ai_assisted: record.ai_assisted,
                },
                None => PhaseProgress {
                    phase_number: phase,
                    name: phase_name(phase).to_string(),
                    status: PhaseStatus::Pending,
                    quality: None,
                    retry_count: 0,
                    duration_ms: None,
                    ai_assisted: false,
                },
            }
        })
        .collect();

    let completed_scores: Vec<f64> = phases.iter().filter_map(|p| p.quality).collect();
    let overall_quality = if completed_scores.is_empty() {
        None
    } else {
        Some(completed_scores.iter().sum::<f64>() / completed_scores.len() as f64)
    };

    Ok(ProgressSnapshot {
        session_id,
        status: session.status,
        current_phase: session.current_phase,
        phases,
        overall_quality,
        error_message: session.error_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::outputs::{ConceptAnalysis, ImageryResult, PhasePreview};
    use crate::fanout::ImageGenerationResult;
    use mangaforge_common::GenerationParameters;

    fn session() -> Session {
        Session::new("u", "t", "text", GenerationParameters::default())
    }

    #[test]
    fn text_phases_produce_one_content_row() {
        let session = session();
        let artifact = PhaseArtifact::new(
            PhaseOutput::Concept(ConceptAnalysis::default()),
            PhasePreview::default(),
        );
        let rows = content_rows(&session, 1, &artifact, true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_type, ContentType::Text);
        assert_eq!(rows[0].generated_by, "text-default");
    }

    #[test]
    fn fallback_rows_are_attributed_to_fallback() {
        let session = session();
        let artifact = PhaseArtifact::new(
            PhaseOutput::Concept(ConceptAnalysis::default()),
            PhasePreview::default(),
        );
        let rows = content_rows(&session, 1, &artifact, false);
        assert_eq!(rows[0].generated_by, "fallback");
    }

    #[test]
    fn imagery_produces_one_row_per_successful_panel() {
        let session = session();
        let imagery = ImageryResult {
            images: vec![
                ImageGenerationResult {
                    panel_id: "p1-1".into(),
                    success: true,
                    image_url: Some("https://img/1.png".into()),
                    quality_score: Some(0.9),
                    ..Default::default()
                },
                ImageGenerationResult {
                    panel_id: "p1-2".into(),
                    success: false,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let artifact = PhaseArtifact::new(PhaseOutput::Imagery(imagery), PhasePreview::default());
        let rows = content_rows(&session, 5, &artifact, true);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content_type, ContentType::Image);
        assert_eq!(rows[0].quality_score, Some(0.9));
    }

    #[test]
    fn identical_image_data_hashes_identically() {
        let session = session();
        let image = ImageGenerationResult {
            panel_id: "p1-1".into(),
            success: true,
            image_url: Some("https://img/1.png".into()),
            quality_score: Some(0.9),
            ..Default::default()
        };
        let imagery = ImageryResult {
            images: vec![image.clone(), image],
            ..Default::default()
        };
        let artifact = PhaseArtifact::new(PhaseOutput::Imagery(imagery), PhasePreview::default());
        let rows = content_rows(&session, 5, &artifact, true);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content_hash, rows[1].content_hash);
    }
}
