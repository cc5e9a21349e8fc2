//! Cross-phase quality assessment.
//!
//! A pure function from `(phase, output, params, context)` to a weighted
//! [`QualityScore`]. Every metric is a deterministic function of the output
//! and the relevant prior results; a metric whose inputs are absent
//! contributes 0 while its declared weight stays in the denominator, so
//! missing context drags the mean down instead of silently vanishing.

use std::collections::{BTreeMap, BTreeSet};

use mangaforge_common::{GenerationParameters, MetricKind, QualityMetric, QualityScore};

use crate::agents::outputs::{PhaseOutput, PhaseOutputs};

/// Context the assessor folds in alongside the phase output.
pub struct AssessmentContext<'a> {
    pub input_text: &'a str,
    pub previous: &'a PhaseOutputs,
    /// Raw scores the agent reported for itself.
    pub self_scores: &'a BTreeMap<String, f64>,
}

/// Fixed per-phase metric weight tables.
pub fn phase_weights(phase: u8) -> &'static [(MetricKind, f64)] {
    match phase {
        1 => &[
            (MetricKind::Relevance, 0.3),
            (MetricKind::GenreFit, 0.25),
            (MetricKind::Coherence, 0.25),
            (MetricKind::Creativity, 0.2),
        ],
        2 => &[
            (MetricKind::CharacterConsistency, 0.3),
            (MetricKind::VisualAppeal, 0.25),
            (MetricKind::Creativity, 0.2),
            (MetricKind::Technical, 0.25),
        ],
        3 => &[
            (MetricKind::PlotConsistency, 0.3),
            (MetricKind::Coherence, 0.25),
            (MetricKind::EmotionalImpact, 0.2),
            (MetricKind::Originality, 0.25),
        ],
        4 => &[
            (MetricKind::LayoutQuality, 0.25),
            (MetricKind::CompositionQuality, 0.2),
            (MetricKind::ReadingFlow, 0.2),
            (MetricKind::CameraVariety, 0.15),
            (MetricKind::VisualHierarchy, 0.1),
            (MetricKind::PageComposition, 0.1),
        ],
        5 => &[
            (MetricKind::ImageSuccessRate, 0.3),
            (MetricKind::AvgImageQuality, 0.3),
            (MetricKind::CharacterConsistency, 0.2),
            (MetricKind::Coherence, 0.2),
        ],
        6 => &[
            (MetricKind::DialogueNaturalness, 0.3),
            (MetricKind::CharacterConsistency, 0.25),
            (MetricKind::EmotionalImpact, 0.2),
            (MetricKind::Readability, 0.25),
        ],
        7 => &[
            (MetricKind::Coherence, 0.3),
            (MetricKind::Technical, 0.25),
            (MetricKind::Readability, 0.25),
            (MetricKind::Composite, 0.2),
        ],
        _ => &[],
    }
}

/// Assess one phase output.
pub fn assess(
    phase: u8,
    output: &PhaseOutput,
    params: &GenerationParameters,
    ctx: &AssessmentContext<'_>,
) -> QualityScore {
    let metrics: BTreeMap<MetricKind, QualityMetric> = phase_weights(phase)
        .iter()
        .map(|(kind, weight)| {
            let score = metric_score(phase, *kind, output, params, ctx).clamp(0.0, 1.0);
            (
                *kind,
                QualityMetric {
                    score,
                    weight: *weight,
                },
            )
        })
        .collect();
    QualityScore::from_metrics(metrics)
}

fn metric_score(
    phase: u8,
    kind: MetricKind,
    output: &PhaseOutput,
    params: &GenerationParameters,
    ctx: &AssessmentContext<'_>,
) -> f64 {
    match (phase, output) {
        (1, PhaseOutput::Concept(concept)) => match kind {
            MetricKind::Relevance => {
                let scene_text: String = concept
                    .scenes
                    .iter()
                    .map(|s| s.description.to_lowercase())
                    .collect::<Vec<_>>()
                    .join(" ");
                0.5 + 0.5 * word_overlap(ctx.input_text, &scene_text)
            }
            MetricKind::GenreFit => {
                if params.primary_genre.is_empty() {
                    0.7
                } else if concept.genre.eq_ignore_ascii_case(&params.primary_genre) {
                    1.0
                } else {
                    0.4
                }
            }
            MetricKind::Coherence => {
                let consecutive = concept
                    .scenes
                    .iter()
                    .enumerate()
                    .all(|(index, scene)| scene.number == index as u32 + 1);
                fraction_of(&[
                    !concept.scenes.is_empty(),
                    consecutive,
                    !concept.story_beats.is_empty(),
                    !concept.themes.is_empty(),
                ])
            }
            MetricKind::Creativity => {
                let text: String = concept
                    .scenes
                    .iter()
                    .map(|s| s.description.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                0.4 + 0.6 * unique_word_ratio(&text)
            }
            _ => 0.0,
        },

        (2, PhaseOutput::Characters(design)) => match kind {
            MetricKind::CharacterConsistency => match &ctx.previous.concept {
                Some(concept) if !concept.characters.is_empty() => {
                    let designed: BTreeSet<&str> =
                        design.characters.iter().map(|c| c.name.as_str()).collect();
                    let kept = concept
                        .characters
                        .iter()
                        .filter(|sketch| designed.contains(sketch.name.as_str()))
                        .count();
                    kept as f64 / concept.characters.len() as f64
                }
                Some(_) => 1.0,
                None => 0.0,
            },
            MetricKind::VisualAppeal => fraction_of(&[
                !design.style_guide.overall_style.is_empty(),
                !design.style_guide.color_palette.is_empty(),
                !design.style_guide.design_principles.is_empty(),
            ]),
            MetricKind::Creativity => {
                let archetypes: BTreeSet<&str> = design
                    .characters
                    .iter()
                    .map(|c| c.archetype.as_str())
                    .collect();
                let variety = if design.characters.is_empty() {
                    0.0
                } else {
                    archetypes.len() as f64 / design.characters.len() as f64
                };
                let depth = if design.relationships.is_empty() {
                    0.0
                } else {
                    0.5
                };
                (0.5 * variety + depth).min(1.0)
            }
            MetricKind::Technical => ctx
                .self_scores
                .get("completeness")
                .copied()
                .unwrap_or(0.6),
            _ => 0.0,
        },

        (3, PhaseOutput::Narrative(narrative)) => match kind {
            MetricKind::PlotConsistency => {
                if narrative.scenes.is_empty() {
                    return 0.0;
                }
                let allocated: BTreeSet<u32> = narrative
                    .page_allocation
                    .iter()
                    .map(|a| a.scene_number)
                    .collect();
                let covered = narrative
                    .scenes
                    .iter()
                    .filter(|s| allocated.contains(&s.number))
                    .count();
                covered as f64 / narrative.scenes.len() as f64
            }
            MetricKind::Coherence => {
                let consecutive = narrative
                    .scenes
                    .iter()
                    .enumerate()
                    .all(|(index, scene)| scene.number == index as u32 + 1);
                let cast_known = match &ctx.previous.characters {
                    Some(design) => {
                        let cast: BTreeSet<&str> =
                            design.characters.iter().map(|c| c.name.as_str()).collect();
                        let named: Vec<&String> = narrative
                            .scenes
                            .iter()
                            .flat_map(|s| s.characters.iter())
                            .collect();
                        if named.is_empty() {
                            0.5
                        } else {
                            named
                                .iter()
                                .filter(|name| cast.contains(name.as_str()))
                                .count() as f64
                                / named.len() as f64
                        }
                    }
                    None => 0.0,
                };
                0.5 * if consecutive { 1.0 } else { 0.4 } + 0.5 * cast_known
            }
            MetricKind::EmotionalImpact => {
                let peak = narrative
                    .emotional_design
                    .curve
                    .iter()
                    .copied()
                    .fold(0.0f64, f64::max);
                0.5 + 0.5 * peak
            }
            MetricKind::Originality => {
                let layers = (narrative.conflict_layers.len() as f64 / 2.0).min(1.0);
                let points = (narrative.plot_points.len() as f64 / 4.0).min(1.0);
                0.5 * layers + 0.5 * points
            }
            _ => 0.0,
        },

        (4, PhaseOutput::Layout(layout)) => match kind {
            MetricKind::LayoutQuality => layout.analysis.readability,
            MetricKind::CompositionQuality => layout.analysis.composition_quality,
            MetricKind::ReadingFlow => {
                let overlaps: u32 = layout.pages.iter().map(|p| p.overlap_count).sum();
                1.0 - (overlaps as f64 * 0.05).min(0.5)
            }
            MetricKind::CameraVariety => {
                let angles: BTreeSet<_> = layout.panels().map(|p| p.camera_angle).collect();
                (angles.len() as f64 / 4.0).min(1.0)
            }
            MetricKind::VisualHierarchy => {
                if layout.pages.is_empty() {
                    return 0.0;
                }
                let with_anchor = layout
                    .pages
                    .iter()
                    .filter(|page| {
                        page.panels.iter().any(|p| {
                            matches!(
                                p.size,
                                crate::agents::outputs::PanelSize::Large
                                    | crate::agents::outputs::PanelSize::Splash
                            )
                        })
                    })
                    .count();
                with_anchor as f64 / layout.pages.len() as f64
            }
            MetricKind::PageComposition => {
                let avg = layout.analysis.average_panels_per_page;
                (1.0 - (avg - 4.0).abs() / 4.0).clamp(0.0, 1.0)
            }
            _ => 0.0,
        },

        (5, PhaseOutput::Imagery(imagery)) => match kind {
            MetricKind::ImageSuccessRate => imagery.success_rate,
            MetricKind::AvgImageQuality => imagery.average_quality,
            MetricKind::CharacterConsistency => imagery.consistency.character,
            MetricKind::Coherence => imagery.consistency.overall,
            _ => 0.0,
        },

        (6, PhaseOutput::Dialogue(plan)) => match kind {
            MetricKind::DialogueNaturalness => {
                ctx.self_scores.get("naturalness").copied().unwrap_or_else(|| {
                    let lines: Vec<_> =
                        plan.placements.iter().flat_map(|p| p.entries.iter()).collect();
                    if lines.is_empty() {
                        0.0
                    } else {
                        lines.iter().filter(|l| l.text.len() <= 80).count() as f64
                            / lines.len() as f64
                    }
                })
            }
            MetricKind::CharacterConsistency => match &ctx.previous.characters {
                Some(design) => {
                    let cast: BTreeSet<&str> =
                        design.characters.iter().map(|c| c.name.as_str()).collect();
                    let lines: Vec<_> =
                        plan.placements.iter().flat_map(|p| p.entries.iter()).collect();
                    if lines.is_empty() {
                        0.0
                    } else {
                        lines
                            .iter()
                            .filter(|l| {
                                cast.contains(l.character.as_str()) || l.character == "Narrator"
                            })
                            .count() as f64
                            / lines.len() as f64
                    }
                }
                None => 0.0,
            },
            MetricKind::EmotionalImpact => {
                let styles: BTreeSet<_> = plan
                    .placements
                    .iter()
                    .flat_map(|p| p.entries.iter())
                    .map(|l| l.bubble)
                    .collect();
                0.5 + 0.5 * (styles.len() as f64 / 3.0).min(1.0)
            }
            MetricKind::Readability => plan.reading_flow,
            _ => 0.0,
        },

        (7, PhaseOutput::Integration(composition)) => match kind {
            MetricKind::Coherence => match &ctx.previous.layout {
                Some(layout) => {
                    if composition.pages.len() != layout.pages.len() {
                        return 0.5;
                    }
                    let matching = composition
                        .pages
                        .iter()
                        .zip(layout.pages.iter())
                        .filter(|(compiled, laid_out)| {
                            compiled.panel_count as usize == laid_out.panels.len()
                        })
                        .count();
                    if composition.pages.is_empty() {
                        0.0
                    } else {
                        matching as f64 / composition.pages.len() as f64
                    }
                }
                None => 0.0,
            },
            MetricKind::Technical => 1.0 - (composition.issues.len() as f64 * 0.2).min(1.0),
            MetricKind::Readability => {
                let dialogue_flow = ctx
                    .previous
                    .dialogue
                    .as_ref()
                    .map(|d| d.reading_flow)
                    .unwrap_or(0.0);
                let layout_readability = ctx
                    .previous
                    .layout
                    .as_ref()
                    .map(|l| l.analysis.readability)
                    .unwrap_or(0.0);
                (dialogue_flow + layout_readability) / 2.0
            }
            MetricKind::Composite => {
                if composition.pages.is_empty() {
                    0.0
                } else {
                    composition.pages.iter().map(|p| p.quality).sum::<f64>()
                        / composition.pages.len() as f64
                }
            }
            _ => 0.0,
        },

        // Output variant does not match the phase under assessment.
        _ => 0.0,
    }
}

fn fraction_of(checks: &[bool]) -> f64 {
    if checks.is_empty() {
        return 0.0;
    }
    checks.iter().filter(|c| **c).count() as f64 / checks.len() as f64
}

/// Fraction of significant input words that reappear in the candidate text.
fn word_overlap(input: &str, candidate: &str) -> f64 {
    let words: Vec<String> = input
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.len() > 3)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| candidate.contains(w.as_str())).count();
    hits as f64 / words.len() as f64
}

fn unique_word_ratio(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique: BTreeSet<&str> = words.iter().copied().collect();
    unique.len() as f64 / words.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::outputs::{
        ConceptAnalysis, Importance, ImageryResult, SceneOutline,
    };
    use mangaforge_common::Grade;

    fn concept() -> ConceptAnalysis {
        ConceptAnalysis {
            genre: "fantasy".into(),
            themes: vec!["courage".into()],
            scenes: vec![
                SceneOutline {
                    number: 1,
                    description: "a brave knight answers the summons".into(),
                    emotional_intensity: 3,
                    importance: Importance::High,
                    emotional_tone: "calm".into(),
                },
                SceneOutline {
                    number: 2,
                    description: "the knight rescues a dragon".into(),
                    emotional_intensity: 8,
                    importance: Importance::High,
                    emotional_tone: "climax".into(),
                },
                SceneOutline {
                    number: 3,
                    description: "they ride home together".into(),
                    emotional_intensity: 4,
                    importance: Importance::Medium,
                    emotional_tone: "calm".into(),
                },
            ],
            story_beats: vec!["call".into(), "rescue".into(), "return".into()],
            ..Default::default()
        }
    }

    #[test]
    fn weights_sum_to_one_for_every_phase() {
        for phase in 1..=7u8 {
            let sum: f64 = phase_weights(phase).iter().map(|(_, w)| w).sum();
            assert!(
                (sum - 1.0).abs() < 1e-9,
                "phase {} weights sum to {}",
                phase,
                sum
            );
        }
    }

    #[test]
    fn overall_matches_the_weighted_mean_invariant() {
        let previous = PhaseOutputs::default();
        let self_scores = BTreeMap::new();
        let ctx = AssessmentContext {
            input_text: "A brave knight rescues a dragon",
            previous: &previous,
            self_scores: &self_scores,
        };
        let score = assess(
            1,
            &PhaseOutput::Concept(concept()),
            &GenerationParameters::default(),
            &ctx,
        );
        let weight_sum: f64 = score.metrics.values().map(|m| m.weight).sum();
        let weighted: f64 = score.metrics.values().map(|m| m.score * m.weight).sum();
        assert!((score.overall - weighted / weight_sum).abs() < 1e-9);
    }

    #[test]
    fn matching_genre_outscores_a_mismatch() {
        let previous = PhaseOutputs::default();
        let self_scores = BTreeMap::new();
        let ctx = AssessmentContext {
            input_text: "A brave knight rescues a dragon",
            previous: &previous,
            self_scores: &self_scores,
        };
        let mut params = GenerationParameters::default();
        params.primary_genre = "fantasy".into();
        let matching = assess(1, &PhaseOutput::Concept(concept()), &params, &ctx);
        params.primary_genre = "romance".into();
        let mismatched = assess(1, &PhaseOutput::Concept(concept()), &params, &ctx);
        assert!(matching.overall > mismatched.overall);
    }

    #[test]
    fn assessment_is_deterministic() {
        let previous = PhaseOutputs::default();
        let self_scores = BTreeMap::new();
        let ctx = AssessmentContext {
            input_text: "A brave knight rescues a dragon",
            previous: &previous,
            self_scores: &self_scores,
        };
        let params = GenerationParameters::default();
        let a = assess(1, &PhaseOutput::Concept(concept()), &params, &ctx);
        let b = assess(1, &PhaseOutput::Concept(concept()), &params, &ctx);
        assert_eq!(a.overall, b.overall);
        assert_eq!(a.metrics, b.metrics);
    }

    #[test]
    fn absent_prior_results_drag_phase_five_consistency_to_zero() {
        let previous = PhaseOutputs::default();
        let self_scores = BTreeMap::new();
        let ctx = AssessmentContext {
            input_text: "",
            previous: &previous,
            self_scores: &self_scores,
        };
        let empty = ImageryResult::default();
        let score = assess(
            5,
            &PhaseOutput::Imagery(empty),
            &GenerationParameters::default(),
            &ctx,
        );
        // Every metric's inputs are absent; the weights stay, so the score
        // bottoms out instead of being undefined.
        assert_eq!(score.overall, 0.0);
        assert_eq!(score.grade, Grade::D);
        assert_eq!(score.metrics.len(), 4);
    }

    #[test]
    fn mismatched_variant_scores_zero() {
        let previous = PhaseOutputs::default();
        let self_scores = BTreeMap::new();
        let ctx = AssessmentContext {
            input_text: "",
            previous: &previous,
            self_scores: &self_scores,
        };
        let score = assess(
            4,
            &PhaseOutput::Concept(concept()),
            &GenerationParameters::default(),
            &ctx,
        );
        assert_eq!(score.overall, 0.0);
    }
}
