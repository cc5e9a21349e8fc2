//! Progress projections served to callers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::PhaseStatus;
use crate::session::SessionStatus;

/// Per-phase slice of a progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase_number: u8,
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub ai_assisted: bool,
}

/// Read-only projection of a session's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub current_phase: u8,
    pub phases: Vec<PhaseProgress>,
    /// Mean of the completed phases' overall quality scores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProgressSnapshot {
    /// Completed phases out of seven, for progress bars.
    pub fn completed_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }
}
