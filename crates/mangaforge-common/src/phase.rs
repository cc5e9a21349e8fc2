//! Per-phase result entity and phase metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::QualityScore;

/// Number of phases in the pipeline.
pub const PHASE_COUNT: u8 = 7;

/// Human-readable phase names, indexed by phase number.
pub fn phase_name(phase: u8) -> &'static str {
    match phase {
        1 => "concept analysis",
        2 => "character design",
        3 => "story structure",
        4 => "panel layout",
        5 => "image generation",
        6 => "dialogue placement",
        7 => "final integration",
        _ => "unknown",
    }
}

/// Critical phases always request feedback when HITL is enabled.
pub fn is_critical_phase(phase: u8) -> bool {
    phase == 4 || phase == 5
}

/// Status of a single phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PhaseStatus::Pending),
            "running" => Some(PhaseStatus::Running),
            "completed" => Some(PhaseStatus::Completed),
            "failed" => Some(PhaseStatus::Failed),
            _ => None,
        }
    }
}

/// Persisted outcome of one phase of one session.
///
/// `output` holds the serialized phase artifact (the typed output plus its
/// preview and feedback metadata); a completed result always carries both an
/// output and a quality score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub id: Uuid,
    pub session_id: Uuid,
    pub phase_number: u8,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<QualityScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// True if the model call succeeded; false when the deterministic
    /// fallback produced the output.
    pub ai_assisted: bool,
}

impl PhaseResult {
    pub fn begin(session_id: Uuid, phase_number: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            phase_number,
            status: PhaseStatus::Running,
            output: None,
            quality_score: None,
            processing_duration_ms: None,
            retry_count: 0,
            error_message: None,
            started_at: Some(Utc::now()),
            completed_at: None,
            ai_assisted: false,
        }
    }

    pub fn complete(
        &mut self,
        output: serde_json::Value,
        score: QualityScore,
        duration_ms: u64,
        ai_assisted: bool,
    ) {
        self.status = PhaseStatus::Completed;
        self.output = Some(output);
        self.quality_score = Some(score);
        self.processing_duration_ms = Some(duration_ms);
        self.ai_assisted = ai_assisted;
        self.error_message = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str, duration_ms: u64) {
        self.status = PhaseStatus::Failed;
        self.error_message = Some(error.to_string());
        self.processing_duration_ms = Some(duration_ms);
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityScore;

    #[test]
    fn all_phases_have_names() {
        for phase in 1..=PHASE_COUNT {
            assert_ne!(phase_name(phase), "unknown");
        }
        assert_eq!(phase_name(0), "unknown");
        assert_eq!(phase_name(8), "unknown");
    }

    #[test]
    fn critical_phases_are_layout_and_images() {
        let critical: Vec<u8> = (1..=PHASE_COUNT).filter(|p| is_critical_phase(*p)).collect();
        assert_eq!(critical, vec![4, 5]);
    }

    #[test]
    fn begin_then_complete_satisfies_invariants() {
        let session_id = Uuid::new_v4();
        let mut result = PhaseResult::begin(session_id, 3);
        assert_eq!(result.status, PhaseStatus::Running);
        assert!(result.started_at.is_some());

        result.complete(
            serde_json::json!({"scenes": []}),
            QualityScore::from_metrics(Default::default()),
            120,
            true,
        );
        assert_eq!(result.status, PhaseStatus::Completed);
        assert!(result.output.is_some());
        assert!(result.quality_score.is_some());
        assert!(result.ai_assisted);
    }

    #[test]
    fn fail_records_error_and_duration() {
        let mut result = PhaseResult::begin(Uuid::new_v4(), 1);
        result.fail("input validation failed", 5);
        assert_eq!(result.status, PhaseStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("input validation failed"));
        assert_eq!(result.processing_duration_ms, Some(5));
    }
}
