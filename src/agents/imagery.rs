//! Phase 5: image generation (critical phase).
//!
//! The only agent that does not speak to the text endpoint: it derives one
//! [`ImageGenerationTask`] per panel from the phase 4 layout and runs them
//! through the parallel fan-out engine, then aggregates quality, consistency
//! and efficiency into the phase output.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::outputs::{
    CharacterDesign, ImageDescription, ImageryResult, PageLayouts, PhaseArtifact, PhaseOutput,
    PhasePreview,
};
use super::{AgentDeps, AgentOutcome, AgentRequest, PhaseAgent};
use crate::errors::AgentError;
use crate::fanout::{
    FanOutConfig, FanOutEngine, ImageGenerationTask, cache_hit_rate, consistency_report,
    panel_priority, parallel_efficiency,
};

pub struct ImageryAgent;

impl ImageryAgent {
    /// One task per panel, prompt built from the panel, the cast and the
    /// style guide. Pure, so identical layouts produce identical cache keys.
    fn build_tasks(layout: &PageLayouts, design: &CharacterDesign) -> Vec<ImageGenerationTask> {
        let mut style_parameters = BTreeMap::new();
        style_parameters.insert(
            "style".to_string(),
            design.style_guide.overall_style.clone(),
        );
        if let Some(primary) = design.style_guide.color_palette.get("primary") {
            style_parameters.insert("primary_color".to_string(), primary.clone());
        }

        let mut tasks = Vec::new();
        for page in &layout.pages {
            for (panel_index, panel) in page.panels.iter().enumerate() {
                let cast: Vec<String> = panel
                    .characters
                    .iter()
                    .map(|c| {
                        let appearance = design
                            .characters
                            .iter()
                            .find(|profile| profile.name == c.name)
                            .and_then(|profile| profile.appearance.get("summary").cloned())
                            .unwrap_or_default();
                        if appearance.is_empty() {
                            c.name.clone()
                        } else {
                            format!("{} ({})", c.name, appearance)
                        }
                    })
                    .collect();

                let prompt = format!(
                    "{}. Camera: {:?}. Tone: {}. Characters: {}",
                    panel.description,
                    panel.camera_angle,
                    panel.emotional_tone,
                    if cast.is_empty() {
                        "none".to_string()
                    } else {
                        cast.join(", ")
                    },
                );

                tasks.push(ImageGenerationTask {
                    panel_id: panel.id.clone(),
                    prompt,
                    negative_prompt: "blurry, low quality, inconsistent anatomy".to_string(),
                    style_parameters: style_parameters.clone(),
                    characters: panel.characters.iter().map(|c| c.name.clone()).collect(),
                    priority: panel_priority(panel, page.page_number, panel_index),
                    max_retries: crate::fanout::task::DEFAULT_IMAGE_MAX_RETRIES,
                });
            }
        }
        tasks
    }
}

#[async_trait]
impl PhaseAgent for ImageryAgent {
    fn phase_number(&self) -> u8 {
        5
    }

    fn name(&self) -> &'static str {
        "image generation"
    }

    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for (phase, present) in [
            (1u8, req.previous.concept.is_some()),
            (2, req.previous.characters.is_some()),
            (3, req.previous.narrative.is_some()),
        ] {
            if !present {
                errors.push(format!("phase {} results are required", phase));
            }
        }
        match &req.previous.layout {
            None => errors.push("phase 4 results are required".to_string()),
            Some(layout) => {
                if layout.panels().next().is_none() {
                    errors.push("phase 4 'panels' is missing or empty".to_string());
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn build_prompt(&self, _req: &AgentRequest<'_>) -> String {
        // Never sent to the text endpoint; the fan-out engine owns the
        // per-panel image prompts.
        "# Phase 5: image generation".to_string()
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        PhaseOutput::from_value(5, raw).ok()
    }

    fn fallback(&self, _req: &AgentRequest<'_>) -> PhaseOutput {
        // Failures are represented per task in the aggregated result; there
        // is no rule-based substitute for the backend here.
        PhaseOutput::Imagery(ImageryResult::default())
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Imagery(imagery) = output else {
            return Err(vec!["expected an imagery output".to_string()]);
        };
        let mut errors = Vec::new();
        if imagery.images.is_empty() {
            errors.push("no image results".to_string());
        }
        if imagery.image_descriptions.len() != imagery.images.len() {
            errors.push(format!(
                "{} image descriptions for {} panels",
                imagery.image_descriptions.len(),
                imagery.images.len()
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Imagery(imagery) = output else {
            return PhasePreview::default();
        };
        let successes = imagery.images.iter().filter(|i| i.success).count();
        let mut counts = BTreeMap::new();
        counts.insert("panels".to_string(), imagery.images.len() as u64);
        counts.insert("generated".to_string(), successes as u64);
        counts.insert(
            "cache_hits".to_string(),
            imagery.images.iter().filter(|i| i.from_cache).count() as u64,
        );
        PhasePreview {
            phase: 5,
            title: "Image generation".to_string(),
            summary: format!(
                "{}/{} panels generated, consistency {:.2}",
                successes,
                imagery.images.len(),
                imagery.consistency.overall
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Imagery(imagery) = output else {
            return BTreeMap::new();
        };
        BTreeMap::from([
            ("success_rate".to_string(), imagery.success_rate),
            ("average_quality".to_string(), imagery.average_quality),
            (
                "parallel_efficiency".to_string(),
                imagery.parallel_efficiency,
            ),
        ])
    }

    async fn execute(
        &self,
        deps: &AgentDeps,
        req: AgentRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let phase = self.phase_number();

        self.validate_inputs(&req)
            .map_err(|errors| AgentError::InputValidation { phase, errors })?;

        let layout = req.previous.layout.as_ref().expect("validated");
        let design = req.previous.characters.as_ref().expect("validated");
        let tasks = Self::build_tasks(layout, design);
        let task_count = tasks.len();

        let engine = FanOutEngine::with_cache(
            FanOutConfig {
                max_parallel: req.params.max_parallel_image_generations.max(1),
                backoff_base: deps.image_backoff_base,
            },
            deps.image_cache.clone(),
        );

        info!(
            panels = task_count,
            max_parallel = req.params.max_parallel_image_generations,
            "starting image fan-out"
        );
        let report = engine
            .run(tasks.clone(), deps.gateway.clone(), cancel)
            .await;

        // Cancellation mid fan-out: completed work stays in the shared
        // cache, but the phase itself does not produce an output.
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled { phase });
        }

        let successes: Vec<_> = report.results.iter().filter(|r| r.success).collect();
        let success_rate = if report.results.is_empty() {
            0.0
        } else {
            successes.len() as f64 / report.results.len() as f64
        };
        let average_quality = if successes.is_empty() {
            0.0
        } else {
            successes
                .iter()
                .filter_map(|r| r.quality_score)
                .sum::<f64>()
                / successes.len() as f64
        };
        let durations: Vec<u64> = report
            .results
            .iter()
            .map(|r| r.generation_duration_ms)
            .collect();

        let image_descriptions = tasks
            .iter()
            .map(|task| ImageDescription {
                panel_id: task.panel_id.clone(),
                description: task.prompt.clone(),
            })
            .collect();

        let imagery = ImageryResult {
            consistency: consistency_report(&tasks, &report.results),
            image_descriptions,
            success_rate,
            average_quality,
            parallel_efficiency: parallel_efficiency(&durations, report.max_parallel),
            cache_hit_rate: cache_hit_rate(report.cache_hits, report.total_tasks),
            images: report.results,
        };

        let retry_count = imagery
            .images
            .iter()
            .map(|r| r.retry_count)
            .max()
            .unwrap_or(0);
        let ai_assisted = success_rate > 0.0;

        let output = PhaseOutput::Imagery(imagery);
        self.validate_output(&output)
            .map_err(|errors| AgentError::FallbackInvalid { phase, errors })?;

        let preview = self.preview(&output);
        let self_scores = self.self_scores(&output);
        let mut artifact = PhaseArtifact::new(output, preview);
        if let Some(feedback) = req.feedback {
            self.apply_feedback(&mut artifact, feedback);
        }

        Ok(AgentOutcome {
            artifact,
            ai_assisted,
            retry_count,
            self_scores,
        })
    }
}
