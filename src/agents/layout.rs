//! Phase 4: panel layout (critical phase).
//!
//! Produces per-page panel layouts with normalized geometry, camera angles,
//! composition rules and a deterministic reading order: panels sort
//! top-to-bottom, then right-to-left, the manga convention. Overlapping
//! panels are tolerated but recorded.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::outputs::{
    CameraAngle, CompositionRule, LayoutAnalysis, PageLayout, PageLayouts, Panel, PanelCharacter,
    PanelSize, PhaseOutput, PhasePreview, Scene,
};
use super::{AgentRequest, PhaseAgent};

const GEOMETRY_EPSILON: f64 = 1e-6;

pub struct LayoutAgent;

impl PhaseAgent for LayoutAgent {
    fn phase_number(&self) -> u8 {
        4
    }

    fn name(&self) -> &'static str {
        "panel layout"
    }

    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if req.previous.concept.is_none() {
            errors.push("phase 1 results are required".to_string());
        }
        if req.previous.characters.is_none() {
            errors.push("phase 2 results are required".to_string());
        }
        match &req.previous.narrative {
            None => errors.push("phase 3 results are required".to_string()),
            Some(narrative) => {
                if narrative.scenes.is_empty() {
                    errors.push("phase 3 'scenes' is missing or empty".to_string());
                }
                if narrative.page_allocation.is_empty() {
                    errors.push("phase 3 'page_allocation' is missing".to_string());
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn build_prompt(&self, req: &AgentRequest<'_>) -> String {
        let narrative = req.previous.narrative.as_ref().expect("validated");
        let scenes = serde_json::to_string_pretty(&narrative.scenes).unwrap_or_default();
        let allocation = serde_json::to_string_pretty(&narrative.page_allocation).unwrap_or_default();
        let mut prompt = format!(
            "# Phase 4: panel layout\n\n\
             ## Scenes\n{}\n\n\
             ## Page allocation\n{}\n\n\
             ## Task\n\
             Lay out every page. Each panel needs an id, normalized x, y,\n\
             width, height in [0, 1], a size of small/medium/large/splash, a\n\
             camera_angle of close_up/medium/wide/birds_eye/worms_eye/dutch, a\n\
             composition of rule_of_thirds/center/diagonal/symmetry/\n\
             golden_ratio, the scene_number it depicts, a description and the\n\
             characters in frame with their prominence. Panels are read\n\
             top-to-bottom, then right-to-left.\n\n\
             Respond with a single JSON object with the fields: pages\n\
             [{{page_number, panels, reading_order, overlap_count}}],\n\
             total_panels, analysis.\n",
            scenes, allocation,
        );
        if let Some(feedback) = req.feedback {
            prompt.push_str(&format!("\n## Reviewer feedback to address\n{}\n", feedback));
        }
        prompt
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        let parsed = PhaseOutput::from_value(4, raw).ok()?;
        match &parsed {
            PhaseOutput::Layout(layout)
                if layout.pages.is_empty() || layout.pages.iter().any(|p| p.panels.is_empty()) =>
            {
                None
            }
            _ => Some(parsed),
        }
    }

    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput {
        let narrative = req.previous.narrative.as_ref().expect("validated");
        let mut pages = Vec::new();
        let mut page_number = 0u32;

        for allocation in &narrative.page_allocation {
            let scene = narrative
                .scenes
                .iter()
                .find(|s| s.number == allocation.scene_number);
            for _ in 0..allocation.pages.max(1) {
                page_number += 1;
                let panels = match scene {
                    Some(scene) => template_panels(page_number, scene),
                    None => Vec::new(),
                };
                pages.push(PageLayout {
                    page_number,
                    panels,
                    reading_order: Vec::new(),
                    overlap_count: 0,
                });
            }
        }

        PhaseOutput::Layout(PageLayouts {
            pages,
            total_panels: 0,
            analysis: LayoutAnalysis::default(),
        })
    }

    /// Reading order, overlap counts, totals and the layout analysis are
    /// derived quantities; recompute them on every path so the persisted
    /// output is internally consistent regardless of what the model said.
    fn complete_with_defaults(&self, output: PhaseOutput, _req: &AgentRequest<'_>) -> PhaseOutput {
        let mut layout = match output {
            PhaseOutput::Layout(layout) => layout,
            other => return other,
        };
        for page in &mut layout.pages {
            page.reading_order = compute_reading_order(&page.panels);
            page.overlap_count = count_overlaps(&page.panels);
        }
        layout.total_panels = layout.pages.iter().map(|p| p.panels.len() as u32).sum();
        layout.analysis = analyze_layout(&layout);
        PhaseOutput::Layout(layout)
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Layout(layout) = output else {
            return Err(vec!["expected a panel layout output".to_string()]);
        };
        let mut errors = Vec::new();
        if layout.pages.is_empty() {
            errors.push("no pages laid out".to_string());
        }
        let mut seen_ids = BTreeSet::new();
        for page in &layout.pages {
            if page.panels.is_empty() {
                errors.push(format!("page {} has no panels", page.page_number));
            }
            for panel in &page.panels {
                if !seen_ids.insert(panel.id.clone()) {
                    errors.push(format!("duplicate panel id '{}'", panel.id));
                }
                for (label, value) in [
                    ("x", panel.x),
                    ("y", panel.y),
                    ("width", panel.width),
                    ("height", panel.height),
                ] {
                    if !(0.0..=1.0).contains(&value) {
                        errors.push(format!(
                            "panel '{}' {} = {} outside 0..=1",
                            panel.id, label, value
                        ));
                    }
                }
                if panel.x + panel.width > 1.0 + GEOMETRY_EPSILON
                    || panel.y + panel.height > 1.0 + GEOMETRY_EPSILON
                {
                    errors.push(format!("panel '{}' extends past the page", panel.id));
                }
            }
            if page.reading_order != compute_reading_order(&page.panels) {
                errors.push(format!(
                    "page {} reading order does not match the top-to-bottom, right-to-left rule",
                    page.page_number
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Layout(layout) = output else {
            return PhasePreview::default();
        };
        let mut counts = BTreeMap::new();
        counts.insert("pages".to_string(), layout.pages.len() as u64);
        counts.insert("panels".to_string(), layout.total_panels as u64);
        let overlaps: u32 = layout.pages.iter().map(|p| p.overlap_count).sum();
        counts.insert("overlaps".to_string(), overlaps as u64);
        PhasePreview {
            phase: 4,
            title: "Panel layout".to_string(),
            summary: format!(
                "{} panels across {} pages",
                layout.total_panels,
                layout.pages.len()
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Layout(layout) = output else {
            return BTreeMap::new();
        };
        let mut scores = BTreeMap::new();
        let described = layout.panels().filter(|p| !p.description.is_empty()).count();
        let total = layout.total_panels.max(1) as f64;
        scores.insert("completeness".to_string(), described as f64 / total);
        scores.insert("detail".to_string(), layout.analysis.layout_variety);
        scores
    }
}

/// Stable sort of panel ids by (y ascending, x descending).
pub fn compute_reading_order(panels: &[Panel]) -> Vec<String> {
    let mut sorted: Vec<&Panel> = panels.iter().collect();
    sorted.sort_by(|a, b| {
        a.y.partial_cmp(&b.y)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.x.partial_cmp(&a.x)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    sorted.into_iter().map(|p| p.id.clone()).collect()
}

/// Number of panel pairs whose rectangles intersect with positive area.
pub fn count_overlaps(panels: &[Panel]) -> u32 {
    let mut overlaps = 0;
    for (index, a) in panels.iter().enumerate() {
        for b in &panels[index + 1..] {
            let x_overlap = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
            let y_overlap = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
            if x_overlap > GEOMETRY_EPSILON && y_overlap > GEOMETRY_EPSILON {
                overlaps += 1;
            }
        }
    }
    overlaps
}

fn analyze_layout(layout: &PageLayouts) -> LayoutAnalysis {
    let page_count = layout.pages.len().max(1) as f64;
    let sizes: BTreeSet<_> = layout.panels().map(|p| p.size).collect();
    let compositions: BTreeSet<_> = layout.panels().map(|p| p.composition).collect();
    let overlaps: u32 = layout.pages.iter().map(|p| p.overlap_count).sum();

    LayoutAnalysis {
        average_panels_per_page: layout.total_panels as f64 / page_count,
        layout_variety: sizes.len() as f64 / 4.0,
        composition_quality: 0.5 + 0.5 * (compositions.len() as f64 / 3.0).min(1.0),
        readability: 1.0 - (overlaps as f64 * 0.1).min(0.5),
    }
}

/// Fixed, non-overlapping panel grids for 1..=5 panels per page.
/// Columns run right-to-left so that the geometric reading order matches
/// panel index order.
fn panel_grid(count: usize) -> Vec<(f64, f64, f64, f64)> {
    match count {
        1 => vec![(0.05, 0.05, 0.9, 0.9)],
        2 => vec![(0.05, 0.05, 0.9, 0.42), (0.05, 0.53, 0.9, 0.42)],
        3 => vec![
            (0.05, 0.05, 0.9, 0.42),
            (0.5, 0.53, 0.45, 0.42),
            (0.05, 0.53, 0.4, 0.42),
        ],
        4 => vec![
            (0.5, 0.05, 0.45, 0.42),
            (0.05, 0.05, 0.4, 0.42),
            (0.5, 0.53, 0.45, 0.42),
            (0.05, 0.53, 0.4, 0.42),
        ],
        _ => vec![
            (0.05, 0.05, 0.9, 0.28),
            (0.5, 0.38, 0.45, 0.27),
            (0.05, 0.38, 0.4, 0.27),
            (0.5, 0.7, 0.45, 0.25),
            (0.05, 0.7, 0.4, 0.25),
        ],
    }
}

fn template_panels(page_number: u32, scene: &Scene) -> Vec<Panel> {
    let count = match scene.emotional_tone.as_str() {
        "climax" => 2,
        "tension" => 4,
        _ => 3,
    };
    let angles = [
        CameraAngle::Wide,
        CameraAngle::Medium,
        CameraAngle::CloseUp,
        CameraAngle::Medium,
        CameraAngle::BirdsEye,
    ];
    let compositions = [
        CompositionRule::RuleOfThirds,
        CompositionRule::Center,
        CompositionRule::Diagonal,
        CompositionRule::GoldenRatio,
        CompositionRule::Symmetry,
    ];

    panel_grid(count)
        .into_iter()
        .enumerate()
        .map(|(index, (x, y, width, height))| {
            let is_lead = index == 0;
            Panel {
                id: format!("p{}-{}", page_number, index + 1),
                x,
                y,
                width,
                height,
                size: if is_lead && scene.emotional_tone == "climax" {
                    PanelSize::Splash
                } else if is_lead {
                    PanelSize::Large
                } else {
                    PanelSize::Medium
                },
                camera_angle: if is_lead && scene.emotional_tone == "climax" {
                    CameraAngle::WormsEye
                } else {
                    angles[index % angles.len()]
                },
                composition: compositions[index % compositions.len()],
                scene_number: scene.number,
                description: if scene.description.is_empty() {
                    format!("beat {} of scene {}", index + 1, scene.number)
                } else {
                    format!("{} (beat {})", scene.description, index + 1)
                },
                emotional_tone: scene.emotional_tone.clone(),
                characters: scene
                    .characters
                    .iter()
                    .enumerate()
                    .map(|(char_index, name)| PanelCharacter {
                        name: name.clone(),
                        prominence: if char_index == 0 { 0.85 } else { 0.5 },
                    })
                    .collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::PhaseOutputs;
    use super::super::outputs::{
        CharacterDesign, ConceptAnalysis, NarrativeStructure, PageAllocation,
    };
    use super::*;
    use mangaforge_common::GenerationParameters;
    use uuid::Uuid;

    fn previous() -> PhaseOutputs {
        let mut previous = PhaseOutputs::default();
        previous.set(PhaseOutput::Concept(ConceptAnalysis::default()));
        previous.set(PhaseOutput::Characters(CharacterDesign::default()));
        previous.set(PhaseOutput::Narrative(NarrativeStructure {
            scenes: vec![
                Scene {
                    number: 1,
                    emotional_tone: "calm".into(),
                    description: "the summons".into(),
                    characters: vec!["Aya".into(), "Ren".into()],
                    ..Default::default()
                },
                Scene {
                    number: 2,
                    emotional_tone: "climax".into(),
                    description: "the confrontation".into(),
                    characters: vec!["Aya".into()],
                    ..Default::default()
                },
            ],
            page_allocation: vec![
                PageAllocation {
                    scene_number: 1,
                    pages: 1,
                },
                PageAllocation {
                    scene_number: 2,
                    pages: 1,
                },
            ],
            ..Default::default()
        }));
        previous
    }

    fn req<'a>(previous: &'a PhaseOutputs, params: &'a GenerationParameters) -> AgentRequest<'a> {
        AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous,
            params,
            feedback: None,
        }
    }

    fn panel(id: &str, x: f64, y: f64) -> Panel {
        Panel {
            id: id.into(),
            x,
            y,
            width: 0.3,
            height: 0.3,
            ..Default::default()
        }
    }

    #[test]
    fn reading_order_is_top_to_bottom_right_to_left() {
        let panels = vec![
            panel("bottom-left", 0.05, 0.6),
            panel("top-left", 0.05, 0.1),
            panel("top-right", 0.6, 0.1),
            panel("bottom-right", 0.6, 0.6),
        ];
        assert_eq!(
            compute_reading_order(&panels),
            vec!["top-right", "top-left", "bottom-right", "bottom-left"]
        );
    }

    #[test]
    fn reading_order_ties_keep_submission_order() {
        // Identical coordinates: the stable sort preserves input order.
        let panels = vec![panel("first", 0.1, 0.1), panel("second", 0.1, 0.1)];
        assert_eq!(compute_reading_order(&panels), vec!["first", "second"]);
    }

    #[test]
    fn overlaps_are_counted_not_rejected() {
        let mut previous_panels = vec![panel("a", 0.1, 0.1), panel("b", 0.2, 0.2)];
        assert_eq!(count_overlaps(&previous_panels), 1);
        previous_panels[1].x = 0.6;
        previous_panels[1].y = 0.6;
        assert_eq!(count_overlaps(&previous_panels), 0);
        // Edge-sharing panels do not overlap.
        let touching = vec![panel("a", 0.1, 0.1), panel("b", 0.4, 0.1)];
        assert_eq!(count_overlaps(&touching), 0);
    }

    #[test]
    fn fallback_layout_validates_and_reads_correctly() {
        let previous = previous();
        let params = GenerationParameters::default();
        let request = req(&previous, &params);
        let output = LayoutAgent.complete_with_defaults(LayoutAgent.fallback(&request), &request);
        LayoutAgent.validate_output(&output).unwrap();
        let PhaseOutput::Layout(layout) = output else {
            panic!()
        };
        assert_eq!(layout.pages.len(), 2);
        // Calm scene gets the 3-panel grid, climax gets the 2-panel grid
        // with a splash lead.
        assert_eq!(layout.pages[0].panels.len(), 3);
        assert_eq!(layout.pages[1].panels.len(), 2);
        assert_eq!(layout.pages[1].panels[0].size, PanelSize::Splash);
        assert_eq!(layout.total_panels, 5);
        for page in &layout.pages {
            assert_eq!(page.overlap_count, 0);
            assert_eq!(page.reading_order, compute_reading_order(&page.panels));
        }
    }

    #[test]
    fn validator_rejects_out_of_bounds_geometry() {
        let output = PhaseOutput::Layout(PageLayouts {
            pages: vec![PageLayout {
                page_number: 1,
                panels: vec![Panel {
                    id: "p1-1".into(),
                    x: 0.8,
                    y: 0.1,
                    width: 0.5,
                    height: 0.2,
                    ..Default::default()
                }],
                reading_order: vec!["p1-1".into()],
                overlap_count: 0,
            }],
            total_panels: 1,
            analysis: LayoutAnalysis::default(),
        });
        let errors = LayoutAgent.validate_output(&output).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("extends past the page")));
    }

    #[test]
    fn validator_rejects_wrong_reading_order() {
        let panels = vec![panel("a", 0.05, 0.1), panel("b", 0.6, 0.1)];
        let output = PhaseOutput::Layout(PageLayouts {
            pages: vec![PageLayout {
                page_number: 1,
                // Wrong: "a" is left of "b", so "b" must come first.
                reading_order: vec!["a".into(), "b".into()],
                panels,
                overlap_count: 0,
            }],
            total_panels: 2,
            analysis: LayoutAnalysis::default(),
        });
        let errors = LayoutAgent.validate_output(&output).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("reading order")));
    }
}
