//! Phase 6: dialogue placement.
//!
//! Writes dialogue and anchors text balloons to panels, with bubble styles
//! drawn from speech/thought/shout/whisper/narration. Reads the phase 3
//! scenes directly and the phase 5 image descriptions; a phase 3 output
//! that lost its canonical `scenes` field fails fast here.

use std::collections::BTreeMap;

use serde_json::Value;

use super::outputs::{
    BubbleStyle, DialogueLine, DialoguePlan, PanelDialogue, PhaseOutput, PhasePreview, Typography,
};
use super::{AgentRequest, PhaseAgent};

pub struct DialogueAgent;

impl PhaseAgent for DialogueAgent {
    fn phase_number(&self) -> u8 {
        6
    }

    fn name(&self) -> &'static str {
        "dialogue placement"
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
            }
        }
        match &req.previous.imagery {
            None => errors.push("phase 5 results are required".to_string()),
            Some(imagery) => {
                if imagery.image_descriptions.is_empty() {
                    errors.push("phase 5 image descriptions are missing".to_string());
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn build_prompt(&self, req: &AgentRequest<'_>) -> String {
        let narrative = req.previous.narrative.as_ref().expect("validated");
        let imagery = req.previous.imagery.as_ref().expect("validated");
        let scenes = serde_json::to_string_pretty(&narrative.scenes).unwrap_or_default();
        let descriptions =
            serde_json::to_string_pretty(&imagery.image_descriptions).unwrap_or_default();
        let mut prompt = format!(
            "# Phase 6: dialogue placement\n\n\
             ## Scenes\n{}\n\n\
             ## Panel image descriptions\n{}\n\n\
             ## Task\n\
             Write the dialogue and place the balloons. For every panel produce\n\
             entries with character, text, a bubble of speech/thought/shout/\n\
             whisper/narration, and a normalized position and size within the\n\
             panel. Keep lines short and in character.\n\n\
             Respond with a single JSON object with the fields: placements\n\
             [{{panel_id, entries}}], typography {{font, font_size,\n\
             bubble_corner}}, reading_flow.\n",
            scenes, descriptions,
        );
        if let Some(feedback) = req.feedback {
            prompt.push_str(&format!("\n## Reviewer feedback to address\n{}\n", feedback));
        }
        prompt
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        let parsed = PhaseOutput::from_value(6, raw).ok()?;
        match &parsed {
            PhaseOutput::Dialogue(plan) if plan.placements.is_empty() => None,
            _ => Some(parsed),
        }
    }

    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput {
        let narrative = req.previous.narrative.as_ref().expect("validated");
        let imagery = req.previous.imagery.as_ref().expect("validated");

        let placements = imagery
            .image_descriptions
            .iter()
            .enumerate()
            .map(|(index, description)| {
                // Panel ids follow the `p<page>-<index>` convention, which
                // carries enough structure to find the matching scene.
                let scene = narrative
                    .scenes
                    .get(index % narrative.scenes.len().max(1))
                    .or_else(|| narrative.scenes.first());
                let (character, bubble, text) = match scene {
                    Some(scene) => {
                        let character = scene.characters.first().cloned();
                        let bubble = match (character.is_some(), scene.emotional_tone.as_str()) {
                            (true, "climax") => BubbleStyle::Shout,
                            (true, "tension") => BubbleStyle::Whisper,
                            (true, _) => BubbleStyle::Speech,
                            (false, _) => BubbleStyle::Narration,
                        };
                        let text = if scene.description.is_empty() {
                            "...".to_string()
                        } else {
                            truncate(&scene.description, 60)
                        };
                        (
                            character.unwrap_or_else(|| "Narrator".to_string()),
                            bubble,
                            text,
                        )
                    }
                    None => (
                        "Narrator".to_string(),
                        BubbleStyle::Narration,
                        "...".to_string(),
                    ),
                };

                PanelDialogue {
                    panel_id: description.panel_id.clone(),
                    entries: vec![DialogueLine {
                        character,
                        text,
                        bubble,
                        x: 0.1,
                        y: 0.1,
                        width: 0.3,
                        height: 0.15,
                    }],
                }
            })
            .collect();

        PhaseOutput::Dialogue(DialoguePlan {
            placements,
            typography: Typography::default(),
            reading_flow: 0.7,
        })
    }

    fn complete_with_defaults(&self, output: PhaseOutput, _req: &AgentRequest<'_>) -> PhaseOutput {
        let mut plan = match output {
            PhaseOutput::Dialogue(plan) => plan,
            other => return other,
        };
        if plan.typography.font.trim().is_empty() {
            plan.typography = Typography::default();
        }
        if plan.reading_flow <= 0.0 {
            plan.reading_flow = 0.7;
        }
        for placement in &mut plan.placements {
            for entry in &mut placement.entries {
                entry.x = entry.x.clamp(0.0, 1.0);
                entry.y = entry.y.clamp(0.0, 1.0);
                entry.width = entry.width.clamp(0.05, 1.0);
                entry.height = entry.height.clamp(0.05, 1.0);
            }
        }
        PhaseOutput::Dialogue(plan)
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Dialogue(plan) = output else {
            return Err(vec!["expected a dialogue output".to_string()]);
        };
        let mut errors = Vec::new();
        if plan.placements.is_empty() {
            errors.push("no dialogue placements".to_string());
        }
        for placement in &plan.placements {
            if placement.panel_id.trim().is_empty() {
                errors.push("placement with an empty panel id".to_string());
            }
            for entry in &placement.entries {
                if entry.text.trim().is_empty() {
                    errors.push(format!("empty dialogue text in panel '{}'", placement.panel_id));
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Dialogue(plan) = output else {
            return PhasePreview::default();
        };
        let lines: usize = plan.placements.iter().map(|p| p.entries.len()).sum();
        let mut counts = BTreeMap::new();
        counts.insert("panels".to_string(), plan.placements.len() as u64);
        counts.insert("lines".to_string(), lines as u64);
        PhasePreview {
            phase: 6,
            title: "Dialogue placement".to_string(),
            summary: format!(
                "{} lines across {} panels",
                lines,
                plan.placements.len()
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Dialogue(plan) = output else {
            return BTreeMap::new();
        };
        let lines: Vec<&DialogueLine> =
            plan.placements.iter().flat_map(|p| p.entries.iter()).collect();
        let short_enough = lines.iter().filter(|l| l.text.len() <= 80).count();
        let naturalness = if lines.is_empty() {
            0.0
        } else {
            short_enough as f64 / lines.len() as f64
        };
        BTreeMap::from([
            ("naturalness".to_string(), naturalness),
            ("reading_flow".to_string(), plan.reading_flow),
        ])
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::super::PhaseOutputs;
    use super::super::outputs::{
        CharacterDesign, ConceptAnalysis, ImageDescription, ImageryResult, NarrativeStructure,
        Scene,
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
                    description: "the summons arrives".into(),
                    emotional_tone: "calm".into(),
                    characters: vec!["Aya".into()],
                    ..Default::default()
                },
                Scene {
                    number: 2,
                    description: "the confrontation".into(),
                    emotional_tone: "climax".into(),
                    characters: vec!["Aya".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }));
        previous.set(PhaseOutput::Imagery(ImageryResult {
            image_descriptions: vec![
                ImageDescription {
                    panel_id: "p1-1".into(),
                    description: "a hall".into(),
                },
                ImageDescription {
                    panel_id: "p1-2".into(),
                    description: "a peak".into(),
                },
            ],
            ..Default::default()
        }));
        previous
    }

    #[test]
    fn missing_scenes_fail_fast() {
        let mut previous = previous();
        previous.narrative = Some(NarrativeStructure::default());
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let errors = DialogueAgent.validate_inputs(&req).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("'scenes'")));
    }

    #[test]
    fn missing_image_descriptions_fail_fast() {
        let mut previous = previous();
        previous.imagery = Some(ImageryResult::default());
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let errors = DialogueAgent.validate_inputs(&req).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("image descriptions")));
    }

    #[test]
    fn fallback_anchors_one_line_per_panel() {
        let previous = previous();
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let output = DialogueAgent.complete_with_defaults(DialogueAgent.fallback(&req), &req);
        DialogueAgent.validate_output(&output).unwrap();
        let PhaseOutput::Dialogue(plan) = output else {
            panic!()
        };
        assert_eq!(plan.placements.len(), 2);
        assert_eq!(plan.placements[0].panel_id, "p1-1");
        assert_eq!(plan.placements[0].entries[0].bubble, BubbleStyle::Speech);
        // Second panel maps onto the climax scene and shouts.
        assert_eq!(plan.placements[1].entries[0].bubble, BubbleStyle::Shout);
    }

    #[test]
    fn validator_rejects_empty_text() {
        let output = PhaseOutput::Dialogue(DialoguePlan {
            placements: vec![PanelDialogue {
                panel_id: "p1-1".into(),
                entries: vec![DialogueLine {
                    character: "Aya".into(),
                    text: "   ".into(),
                    ..Default::default()
                }],
            }],
            ..Default::default()
        });
        let errors = DialogueAgent.validate_output(&output).unwrap_err();
        assert!(errors[0].contains("empty dialogue text"));
    }

    #[test]
    fn truncate_preserves_short_text() {
        assert_eq!(truncate("short", 60), "short");
        let long = "a".repeat(100);
        assert!(truncate(&long, 60).len() <= 64);
    }
}
