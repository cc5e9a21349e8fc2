//! Typed error hierarchy for the pipeline.
//!
//! Three top-level enums cover the three subsystems:
//! - `GatewayError` — generative backend failures
//! - `AgentError` — per-phase execution failures that propagate upward
//! - `PipelineError` — orchestrator and supervisor failures
//!
//! Transient backend errors and parse failures never leave an agent: the
//! agent retries, then falls back to its deterministic generator. Only
//! input-validation failures, invalid fallback output, retry exhaustion,
//! cancellation, and internal invariant violations reach the orchestrator.

use thiserror::Error;
use uuid::Uuid;

use mangaforge_common::SessionStatus;

/// Errors returned by the model gateway. Never panics upward.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("backend request timed out")]
    Timeout,

    #[error("backend rate limited the request")]
    RateLimited,

    #[error("backend returned an empty response")]
    EmptyResponse,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Transient errors are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout
                | GatewayError::RateLimited
                | GatewayError::EmptyResponse
                | GatewayError::Backend(_)
        )
    }
}

/// Errors from a single phase execution that propagate to the orchestrator.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("phase {phase} input validation failed: {}", .errors.join("; "))]
    InputValidation { phase: u8, errors: Vec<String> },

    #[error("phase {phase} fallback output failed validation: {}", .errors.join("; "))]
    FallbackInvalid { phase: u8, errors: Vec<String> },

    #[error("phase {phase} exhausted {attempts} attempts without a usable output")]
    RetryExhausted { phase: u8, attempts: u32 },

    #[error("phase {phase} cancelled")]
    Cancelled { phase: u8 },

    #[error("phase {phase} internal invariant violated: {message}")]
    Internal { phase: u8, message: String },
}

impl AgentError {
    pub fn phase(&self) -> u8 {
        match self {
            AgentError::InputValidation { phase, .. }
            | AgentError::FallbackInvalid { phase, .. }
            | AgentError::RetryExhausted { phase, .. }
            | AgentError::Cancelled { phase }
            | AgentError::Internal { phase, .. } => *phase,
        }
    }

    /// Cancellation terminates the session as `cancelled`, not `failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AgentError::Cancelled { .. })
    }
}

/// Errors from the orchestrator and session supervisor.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("cannot {action} a session in status {status}")]
    InvalidTransition {
        status: SessionStatus,
        action: &'static str,
    },

    #[error("session {session_id} reached the retry limit ({retries})")]
    RetryLimitReached { session_id: Uuid, retries: u32 },

    #[error("feedback for phase {submitted} does not match the awaited phase {awaited}")]
    FeedbackPhaseMismatch { submitted: u8, awaited: u8 },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_transience() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::RateLimited.is_transient());
        assert!(GatewayError::EmptyResponse.is_transient());
        assert!(GatewayError::Backend("503".into()).is_transient());
        assert!(!GatewayError::Cancelled.is_transient());
    }

    #[test]
    fn agent_error_carries_phase() {
        let err = AgentError::InputValidation {
            phase: 6,
            errors: vec!["phase 3 missing 'scenes'".into()],
        };
        assert_eq!(err.phase(), 6);
        assert!(err.to_string().contains("scenes"));
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        assert!(AgentError::Cancelled { phase: 5 }.is_cancellation());
        assert!(
            !AgentError::RetryExhausted {
                phase: 5,
                attempts: 3
            }
            .is_cancellation()
        );
    }

    #[test]
    fn pipeline_error_converts_from_agent_error() {
        let err: PipelineError = AgentError::Cancelled { phase: 2 }.into();
        assert!(matches!(err, PipelineError::Agent(_)));
    }

    #[test]
    fn invalid_transition_names_the_action() {
        let err = PipelineError::InvalidTransition {
            status: SessionStatus::Completed,
            action: "pause",
        };
        assert!(err.to_string().contains("pause"));
        assert!(err.to_string().contains("completed"));
    }
}
