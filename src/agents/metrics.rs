//! Per-phase generation metrics.
//!
//! Counters are updated by the orchestrator after each phase attempt, one
//! mutex per phase. Agents themselves stay pure and return their numbers by
//! value; nothing here sits on a hot path.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use mangaforge_common::{PHASE_COUNT, phase_name};

#[derive(Debug, Default)]
struct PhaseCounters {
    executions: u64,
    successes: u64,
    failures: u64,
    fallbacks: u64,
    total_duration_ms: u64,
    last_error: Option<String>,
}

/// Point-in-time view of one phase's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMetricsSnapshot {
    pub phase: u8,
    pub name: String,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    /// Successful executions that used the rule-based fallback.
    pub fallbacks: u64,
    pub average_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Registry of generation metrics for all seven phases.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    phases: [Mutex<PhaseCounters>; PHASE_COUNT as usize],
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_phase<R>(&self, phase: u8, f: impl FnOnce(&mut PhaseCounters) -> R) -> Option<R> {
        let index = phase.checked_sub(1)? as usize;
        let slot = self.phases.get(index)?;
        let mut counters = slot.lock().ok()?;
        Some(f(&mut counters))
    }

    pub fn record_success(&self, phase: u8, duration_ms: u64, ai_assisted: bool) {
        self.with_phase(phase, |c| {
            c.executions += 1;
            c.successes += 1;
            if !ai_assisted {
                c.fallbacks += 1;
            }
            c.total_duration_ms += duration_ms;
        });
    }

    pub fn record_failure(&self, phase: u8, duration_ms: u64, error: &str) {
        self.with_phase(phase, |c| {
            c.executions += 1;
            c.failures += 1;
            c.total_duration_ms += duration_ms;
            c.last_error = Some(error.to_string());
        });
    }

    pub fn snapshot(&self) -> Vec<PhaseMetricsSnapshot> {
        (1..=PHASE_COUNT)
            .filter_map(|phase| self.snapshot_phase(phase))
            .collect()
    }

    pub fn snapshot_phase(&self, phase: u8) -> Option<PhaseMetricsSnapshot> {
        self.with_phase(phase, |c| PhaseMetricsSnapshot {
            phase,
            name: phase_name(phase).to_string(),
            executions: c.executions,
            successes: c.successes,
            failures: c.failures,
            fallbacks: c.fallbacks,
            average_duration_ms: if c.executions > 0 {
                c.total_duration_ms / c.executions
            } else {
                0
            },
            last_error: c.last_error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_fallback_counting() {
        let registry = MetricsRegistry::new();
        registry.record_success(1, 100, true);
        registry.record_success(1, 300, false);

        let snap = registry.snapshot_phase(1).unwrap();
        assert_eq!(snap.executions, 2);
        assert_eq!(snap.successes, 2);
        assert_eq!(snap.fallbacks, 1);
        assert_eq!(snap.average_duration_ms, 200);
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn failure_records_last_error() {
        let registry = MetricsRegistry::new();
        registry.record_failure(4, 50, "layout validation failed");
        let snap = registry.snapshot_phase(4).unwrap();
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.last_error.as_deref(), Some("layout validation failed"));
    }

    #[test]
    fn out_of_range_phases_are_ignored() {
        let registry = MetricsRegistry::new();
        registry.record_success(0, 10, true);
        registry.record_success(8, 10, true);
        assert!(registry.snapshot().iter().all(|s| s.executions == 0));
    }

    #[test]
    fn snapshot_covers_all_phases() {
        let registry = MetricsRegistry::new();
        let snaps = registry.snapshot();
        assert_eq!(snaps.len(), PHASE_COUNT as usize);
        assert_eq!(snaps[0].name, "concept analysis");
        assert_eq!(snaps[6].name, "final integration");
    }
}
