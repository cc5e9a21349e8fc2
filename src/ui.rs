//! Terminal rendering for the CLI run path.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::agents::PhaseMetricsSnapshot;
use mangaforge_common::{PHASE_COUNT, PipelineEvent, ProgressSnapshot, phase_name};

pub struct PipelineUi {
    bar: ProgressBar,
    verbose: bool,
}

impl PipelineUi {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new(PHASE_COUNT as u64);
        bar.set_style(
            ProgressStyle::with_template("{prefix:>12} [{bar:30}] {pos}/{len} {msg}")
                .expect("static template")
                .progress_chars("=> "),
        );
        bar.set_prefix("pipeline");
        Self { bar, verbose }
    }

    pub fn print_header(&self, title: &str, session_id: &str) {
        println!(
            "{} {} {}",
            style("Session").bold(),
            style(title).cyan(),
            style(format!("({})", session_id)).dim()
        );
    }

    pub fn handle_event(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::PhaseStarted { phase, .. } => {
                self.bar
                    .set_message(format!("{} {}", phase, phase_name(*phase)));
            }
            PipelineEvent::PhaseCompleted { phase, quality, .. } => {
                self.bar.set_position(*phase as u64);
                if self.verbose {
                    self.bar.println(format!(
                        "  {} phase {} - {} (quality {:.2})",
                        style("ok").green(),
                        phase,
                        phase_name(*phase),
                        quality
                    ));
                }
            }
            PipelineEvent::PhaseFailed { phase, error, .. } => {
                self.bar.println(format!(
                    "  {} phase {} - {}: {}",
                    style("failed").red(),
                    phase,
                    phase_name(*phase),
                    error
                ));
            }
            PipelineEvent::FeedbackRequested { phase, .. } => {
                self.bar.println(format!(
                    "  {} phase {} awaits feedback",
                    style("review").yellow(),
                    phase
                ));
            }
            PipelineEvent::SessionCompleted { .. } => {
                self.bar.finish_with_message("completed");
            }
            PipelineEvent::SessionFailed { error, .. } => {
                self.bar.abandon_with_message(format!("failed: {}", error));
            }
            PipelineEvent::SessionCancelled { .. } => {
                self.bar.abandon_with_message("cancelled");
            }
        }
    }

    pub fn print_preview(&self, preview: &serde_json::Value) {
        if let Some(summary) = preview.get("summary").and_then(|s| s.as_str()) {
            self.bar
                .println(format!("  {} {}", style("preview").dim(), summary));
        }
    }
}

/// Plain-text progress table for `mangaforge status`.
pub fn print_progress(snapshot: &ProgressSnapshot) {
    println!(
        "{} {} (phase {}/{})",
        style("Status:").bold(),
        style(snapshot.status.to_string()).cyan(),
        snapshot.current_phase,
        PHASE_COUNT
    );
    if let Some(error) = &snapshot.error_message {
        println!("{} {}", style("Error:").bold(), style(error).red());
    }
    for phase in &snapshot.phases {
        let quality = phase
            .quality
            .map(|q| format!("{:.2}", q))
            .unwrap_or_else(|| "-".to_string());
        let duration = phase
            .duration_ms
            .map(|d| format!("{}ms", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {:<20} {:<10} quality {:>5}  {:>8}  retries {}{}",
            phase.phase_number,
            phase.name,
            phase.status.as_str(),
            quality,
            duration,
            phase.retry_count,
            if phase.ai_assisted { "" } else { "  (fallback)" },
        );
    }
    if let Some(overall) = snapshot.overall_quality {
        println!("{} {:.2}", style("Overall quality:").bold(), overall);
    }
}

/// Per-phase generation counters, shown in verbose runs.
pub fn print_metrics(metrics: &[PhaseMetricsSnapshot]) {
    println!("{}", style("Generation metrics:").bold());
    for snapshot in metrics {
        if snapshot.executions == 0 {
            continue;
        }
        println!(
            "  {} {:<20} {} run(s), {} ok, {} fallback, avg {}ms",
            snapshot.phase,
            snapshot.name,
            snapshot.executions,
            snapshot.successes,
            snapshot.fallbacks,
            snapshot.average_duration_ms,
        );
    }
}
