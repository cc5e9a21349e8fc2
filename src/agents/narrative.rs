//! Phase 3: story structure.
//!
//! Builds the narrative skeleton: acts, plot points, conflict layers, the
//! emotional design, the page allocation, and the canonical `scenes` list
//! every later phase keys off.

use std::collections::BTreeMap;

use serde_json::Value;

use super::outputs::{
    Act, EmotionalDesign, NarrativeStructure, PageAllocation, PhaseOutput, PhasePreview, Scene,
};
use super::{AgentRequest, PhaseAgent};

pub struct NarrativeAgent;

impl PhaseAgent for NarrativeAgent {
    fn phase_number(&self) -> u8 {
        3
    }

    fn name(&self) -> &'static str {
        "story structure"
    }

    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        match &req.previous.concept {
            None => errors.push("phase 1 results are required".to_string()),
            Some(concept) => {
                if concept.genre.trim().is_empty() {
                    errors.push("phase 1 'genre' is missing".to_string());
                }
                if concept.scenes.is_empty() {
                    errors.push("phase 1 scene outline is missing".to_string());
                }
            }
        }
        match &req.previous.characters {
            None => errors.push("phase 2 results are required".to_string()),
            Some(design) => {
                if design.characters.is_empty() {
                    errors.push("phase 2 'characters' is missing".to_string());
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn build_prompt(&self, req: &AgentRequest<'_>) -> String {
        let concept = req.previous.concept.as_ref().expect("validated");
        let design = req.previous.characters.as_ref().expect("validated");
        let outline = serde_json::to_string_pretty(&concept.scenes).unwrap_or_default();
        let cast: Vec<&str> = design.characters.iter().map(|c| c.name.as_str()).collect();
        let mut prompt = format!(
            "# Phase 3: story structure\n\n\
             ## Scene outline from phase 1\n{}\n\n\
             ## Cast\n{}\n\n\
             ## Task\n\
             Structure the narrative: three acts, the plot points, the conflict\n\
             layers, an emotional intensity curve, and a page allocation. Expand\n\
             the outline into full scenes; every scene needs number, scene_type,\n\
             location, description, key_actions, emotional_tone and the\n\
             characters present. Use the field name \"scenes\" exactly.\n\n\
             Respond with a single JSON object with the fields: acts,\n\
             plot_points, conflict_layers, emotional_design {{curve,\n\
             peak_scenes}}, page_allocation, scenes.\n",
            outline,
            cast.join(", "),
        );
        if let Some(feedback) = req.feedback {
            prompt.push_str(&format!("\n## Reviewer feedback to address\n{}\n", feedback));
        }
        prompt
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        // `from_value` also rejects the deprecated `scene_breakdown` alias.
        let parsed = PhaseOutput::from_value(3, raw).ok()?;
        match &parsed {
            PhaseOutput::Narrative(narrative) if narrative.scenes.is_empty() => None,
            _ => Some(parsed),
        }
    }

    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput {
        let concept = req.previous.concept.as_ref().expect("validated");
        let design = req.previous.characters.as_ref().expect("validated");
        let cast: Vec<String> = design.characters.iter().map(|c| c.name.clone()).collect();
        let total = concept.scenes.len();

        let scenes: Vec<Scene> = concept
            .scenes
            .iter()
            .enumerate()
            .map(|(index, outline)| Scene {
                number: outline.number,
                scene_type: scene_type_for(index, total).to_string(),
                location: if concept.world_setting.location.is_empty() {
                    "unspecified".to_string()
                } else {
                    concept.world_setting.location.clone()
                },
                description: outline.description.clone(),
                key_actions: vec!["advance the story".to_string()],
                emotional_tone: outline.emotional_tone.clone(),
                characters: cast.clone(),
            })
            .collect();

        let curve: Vec<f64> = concept
            .scenes
            .iter()
            .map(|s| s.emotional_intensity as f64 / 10.0)
            .collect();
        let peak_scenes = concept
            .scenes
            .iter()
            .filter(|s| s.emotional_intensity >= 8)
            .map(|s| s.number)
            .collect();

        let page_allocation = scenes
            .iter()
            .map(|scene| PageAllocation {
                scene_number: scene.number,
                pages: 1,
            })
            .collect();

        PhaseOutput::Narrative(NarrativeStructure {
            acts: vec![
                Act {
                    number: 1,
                    title: "Setup".to_string(),
                    summary: "the situation takes shape".to_string(),
                },
                Act {
                    number: 2,
                    title: "Confrontation".to_string(),
                    summary: "stakes rise toward the climax".to_string(),
                },
                Act {
                    number: 3,
                    title: "Resolution".to_string(),
                    summary: "the outcome settles".to_string(),
                },
            ],
            plot_points: concept.story_beats.clone(),
            conflict_layers: vec!["external goal".to_string(), "internal doubt".to_string()],
            emotional_design: EmotionalDesign { curve, peak_scenes },
            page_allocation,
            scenes,
        })
    }

    fn complete_with_defaults(&self, output: PhaseOutput, _req: &AgentRequest<'_>) -> PhaseOutput {
        let mut narrative = match output {
            PhaseOutput::Narrative(narrative) => narrative,
            other => return other,
        };
        if narrative.acts.is_empty() {
            narrative.acts = vec![Act {
                number: 1,
                title: "Act 1".to_string(),
                summary: String::new(),
            }];
        }
        // Every scene gets a page; missing allocations default to one page.
        if narrative.page_allocation.is_empty() {
            narrative.page_allocation = narrative
                .scenes
                .iter()
                .map(|scene| PageAllocation {
                    scene_number: scene.number,
                    pages: 1,
                })
                .collect();
        }
        if narrative.emotional_design.curve.is_empty() {
            narrative.emotional_design.curve = narrative.scenes.iter().map(|_| 0.5).collect();
        }
        PhaseOutput::Narrative(narrative)
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Narrative(narrative) = output else {
            return Err(vec!["expected a story structure output".to_string()]);
        };
        let mut errors = Vec::new();
        if narrative.scenes.is_empty() {
            errors.push("'scenes' is empty".to_string());
        }
        if narrative.acts.is_empty() {
            errors.push("no acts defined".to_string());
        }
        if narrative.page_allocation.is_empty() {
            errors.push("page allocation is empty".to_string());
        }
        let known: Vec<u32> = narrative.scenes.iter().map(|s| s.number).collect();
        for allocation in &narrative.page_allocation {
            if !known.contains(&allocation.scene_number) {
                errors.push(format!(
                    "page allocation references unknown scene {}",
                    allocation.scene_number
                ));
            }
            if allocation.pages == 0 {
                errors.push(format!(
                    "scene {} allocated zero pages",
                    allocation.scene_number
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Narrative(narrative) = output else {
            return PhasePreview::default();
        };
        let total_pages: u32 = narrative.page_allocation.iter().map(|a| a.pages).sum();
        let mut counts = BTreeMap::new();
        counts.insert("acts".to_string(), narrative.acts.len() as u64);
        counts.insert("scenes".to_string(), narrative.scenes.len() as u64);
        counts.insert("pages".to_string(), total_pages as u64);
        PhasePreview {
            phase: 3,
            title: "Story structure".to_string(),
            summary: format!(
                "{} acts, {} scenes over {} pages",
                narrative.acts.len(),
                narrative.scenes.len(),
                total_pages
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Narrative(narrative) = output else {
            return BTreeMap::new();
        };
        let mut scores = BTreeMap::new();
        let with_actions = narrative
            .scenes
            .iter()
            .filter(|s| !s.key_actions.is_empty())
            .count();
        let completeness = if narrative.scenes.is_empty() {
            0.0
        } else {
            with_actions as f64 / narrative.scenes.len() as f64
        };
        scores.insert("completeness".to_string(), completeness);
        scores.insert(
            "detail".to_string(),
            (narrative.plot_points.len() as f64 / 5.0).min(1.0),
        );
        scores
    }
}

fn scene_type_for(index: usize, total: usize) -> &'static str {
    if index == 0 {
        "introduction"
    } else if total > 2 && index == total - 2 {
        "climax"
    } else if index == total - 1 {
        "resolution"
    } else {
        "development"
    }
}

#[cfg(test)]
mod tests {
    use super::super::PhaseOutputs;
    use super::super::outputs::{
        CharacterDesign, CharacterProfile, ConceptAnalysis, Importance, SceneOutline,
    };
    use super::*;
    use mangaforge_common::GenerationParameters;
    use serde_json::json;
    use uuid::Uuid;

    fn previous() -> PhaseOutputs {
        let mut previous = PhaseOutputs::default();
        previous.set(PhaseOutput::Concept(ConceptAnalysis {
            genre: "fantasy".into(),
            themes: vec!["courage".into()],
            scenes: vec![
                SceneOutline {
                    number: 1,
                    description: "the summons".into(),
                    emotional_intensity: 3,
                    importance: Importance::High,
                    emotional_tone: "calm".into(),
                },
                SceneOutline {
                    number: 2,
                    description: "the climb".into(),
                    emotional_intensity: 6,
                    importance: Importance::Medium,
                    emotional_tone: "tension".into(),
                },
                SceneOutline {
                    number: 3,
                    description: "the confrontation".into(),
                    emotional_intensity: 9,
                    importance: Importance::High,
                    emotional_tone: "climax".into(),
                },
            ],
            story_beats: vec!["call".into(), "trial".into(), "truce".into()],
            ..Default::default()
        }));
        previous.set(PhaseOutput::Characters(CharacterDesign {
            characters: vec![CharacterProfile {
                name: "Aya".into(),
                prominence: 1.0,
                ..Default::default()
            }],
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

    #[test]
    fn requires_both_upstream_phases() {
        let empty = PhaseOutputs::default();
        let params = GenerationParameters::default();
        let errors = NarrativeAgent
            .validate_inputs(&req(&empty, &params))
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn fallback_expands_the_outline_into_scenes() {
        let previous = previous();
        let params = GenerationParameters::default();
        let request = req(&previous, &params);
        let output =
            NarrativeAgent.complete_with_defaults(NarrativeAgent.fallback(&request), &request);
        NarrativeAgent.validate_output(&output).unwrap();
        let PhaseOutput::Narrative(narrative) = output else {
            panic!()
        };
        assert_eq!(narrative.scenes.len(), 3);
        assert_eq!(narrative.scenes[0].scene_type, "introduction");
        assert_eq!(narrative.scenes[1].scene_type, "climax");
        assert_eq!(narrative.scenes[2].scene_type, "resolution");
        assert_eq!(narrative.page_allocation.len(), 3);
        assert_eq!(narrative.emotional_design.peak_scenes, vec![3]);
    }

    #[test]
    fn parse_rejects_the_deprecated_alias() {
        let legacy = json!({"scene_breakdown": [{"number": 1}]});
        assert!(NarrativeAgent.parse_output(&legacy).is_none());
    }

    #[test]
    fn allocation_must_reference_known_scenes() {
        let output = PhaseOutput::Narrative(NarrativeStructure {
            acts: vec![Act {
                number: 1,
                title: "Act".into(),
                summary: String::new(),
            }],
            scenes: vec![Scene {
                number: 1,
                ..Default::default()
            }],
            page_allocation: vec![PageAllocation {
                scene_number: 9,
                pages: 1,
            }],
            ..Default::default()
        });
        let errors = NarrativeAgent.validate_output(&output).unwrap_err();
        assert!(errors[0].contains("unknown scene 9"));
    }
}
