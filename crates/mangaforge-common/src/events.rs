//! Events emitted while a session moves through the pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Progress events published on the pipeline event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseStarted {
        session_id: Uuid,
        phase: u8,
    },
    PhaseCompleted {
        session_id: Uuid,
        phase: u8,
        quality: f64,
    },
    PhaseFailed {
        session_id: Uuid,
        phase: u8,
        error: String,
    },
    FeedbackRequested {
        session_id: Uuid,
        phase: u8,
        preview: serde_json::Value,
    },
    SessionCompleted {
        session_id: Uuid,
    },
    SessionFailed {
        session_id: Uuid,
        error: String,
    },
    SessionCancelled {
        session_id: Uuid,
    },
}

impl PipelineEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            PipelineEvent::PhaseStarted { session_id, .. }
            | PipelineEvent::PhaseCompleted { session_id, .. }
            | PipelineEvent::PhaseFailed { session_id, .. }
            | PipelineEvent::FeedbackRequested { session_id, .. }
            | PipelineEvent::SessionCompleted { session_id }
            | PipelineEvent::SessionFailed { session_id, .. }
            | PipelineEvent::SessionCancelled { session_id } => *session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = PipelineEvent::PhaseCompleted {
            session_id: Uuid::nil(),
            phase: 3,
            quality: 0.82,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_completed\""));
        let parsed: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id(), Uuid::nil());
    }
}
