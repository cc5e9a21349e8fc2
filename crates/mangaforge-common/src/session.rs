//! Session entity and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::GenerationParameters;
use crate::phase::PHASE_COUNT;

/// Lifecycle status of a pipeline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Queued,
    Processing,
    WaitingFeedback,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// A terminal session accepts no further driver activity
    /// (`Failed` can still be revived through an explicit retry).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Statuses from which `pause` is a legal transition.
    pub fn can_pause(self) -> bool {
        matches!(
            self,
            SessionStatus::Processing | SessionStatus::WaitingFeedback
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Queued => "queued",
            SessionStatus::Processing => "processing",
            SessionStatus::WaitingFeedback => "waiting_feedback",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(SessionStatus::Queued),
            "processing" => Some(SessionStatus::Processing),
            "waiting_feedback" => Some(SessionStatus::WaitingFeedback),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end run of the seven-phase pipeline for one user input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub input_text: String,
    pub params: GenerationParameters,
    pub status: SessionStatus,
    /// 0 = not started, 1..=7 while processing.
    pub current_phase: u8,
    pub hitl_enabled: bool,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: &str, title: &str, input_text: &str, params: GenerationParameters) -> Self {
        let now = Utc::now();
        let hitl_enabled = params.enable_hitl;
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            input_text: input_text.to_string(),
            params,
            status: SessionStatus::Queued,
            current_phase: 0,
            hitl_enabled,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Touch the update timestamp after any mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn mark_processing(&mut self, phase: u8) {
        debug_assert!((1..=PHASE_COUNT).contains(&phase));
        self.status = SessionStatus::Processing;
        self.current_phase = phase;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = SessionStatus::Completed;
        self.current_phase = PHASE_COUNT;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = SessionStatus::Failed;
        self.error_message = Some(error.to_string());
        self.touch();
    }

    pub fn mark_cancelled(&mut self, reason: Option<&str>) {
        self.status = SessionStatus::Cancelled;
        self.error_message = reason.map(|r| r.to_string());
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Queued.is_terminal());
        assert!(!SessionStatus::WaitingFeedback.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SessionStatus::Queued,
            SessionStatus::Processing,
            SessionStatus::WaitingFeedback,
            SessionStatus::Paused,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn new_session_starts_queued_at_phase_zero() {
        let session = Session::new("user-1", "Knight", "A brave knight", Default::default());
        assert_eq!(session.status, SessionStatus::Queued);
        assert_eq!(session.current_phase, 0);
        assert!(session.started_at.is_none());
        assert!(session.completed_at.is_none());
    }

    #[test]
    fn mark_processing_sets_started_at_once() {
        let mut session = Session::new("u", "t", "text", Default::default());
        session.mark_processing(1);
        let first = session.started_at.unwrap();
        session.mark_processing(2);
        assert_eq!(session.started_at.unwrap(), first);
        assert_eq!(session.current_phase, 2);
    }

    #[test]
    fn mark_completed_pins_phase_seven() {
        let mut session = Session::new("u", "t", "text", Default::default());
        session.mark_processing(7);
        session.mark_completed();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.current_phase, 7);
        assert!(session.completed_at.is_some());
    }
}
