//! Phase 2: character design.
//!
//! Produces the character roster with arcs and the visual style guide,
//! keyed by the names phase 1 surfaced.

use std::collections::BTreeMap;

use serde_json::Value;

use super::outputs::{
    CharacterArc, CharacterDesign, CharacterProfile, PhaseOutput, PhasePreview, Relationship,
    StyleGuide,
};
use super::{AgentRequest, PhaseAgent};

pub struct CharacterAgent;

impl PhaseAgent for CharacterAgent {
    fn phase_number(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "character design"
    }

    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        match &req.previous.concept {
            None => errors.push("phase 1 results are required".to_string()),
            Some(concept) => {
                if concept.genre.trim().is_empty() {
                    errors.push("phase 1 'genre' is missing".to_string());
                }
                if concept.themes.is_empty() {
                    errors.push("phase 1 'themes' is missing".to_string());
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn build_prompt(&self, req: &AgentRequest<'_>) -> String {
        let concept = req.previous.concept.as_ref().expect("validated");
        let sketches = serde_json::to_string_pretty(&concept.characters).unwrap_or_default();
        let mut prompt = format!(
            "# Phase 2: character design\n\n\
             ## Genre and themes\n{} / {}\n\n\
             ## World setting\n{} ({}), atmosphere: {}\n\n\
             ## Character sketches from phase 1\n{}\n\n\
             ## Task\n\
             Design the full cast. For every sketched character produce a\n\
             profile with archetype, prominence (0..1), appearance map, traits\n\
             and goals. Add the relationships between them, a character arc per\n\
             main character, and a style guide for the whole work.\n\n\
             Respond with a single JSON object with the fields: characters,\n\
             relationships, arcs, style_guide {{overall_style, color_palette,\n\
             design_principles}}.\n",
            concept.genre,
            concept.themes.join(", "),
            concept.world_setting.location,
            concept.world_setting.time_period,
            concept.world_setting.atmosphere,
            sketches,
        );
        if let Some(feedback) = req.feedback {
            prompt.push_str(&format!("\n## Reviewer feedback to address\n{}\n", feedback));
        }
        prompt
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        let parsed = PhaseOutput::from_value(2, raw).ok()?;
        match &parsed {
            PhaseOutput::Characters(design) if design.characters.is_empty() => None,
            _ => Some(parsed),
        }
    }

    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput {
        let concept = req.previous.concept.as_ref().expect("validated");

        let characters: Vec<CharacterProfile> = concept
            .characters
            .iter()
            .enumerate()
            .map(|(index, sketch)| CharacterProfile {
                name: sketch.name.clone(),
                archetype: if sketch.role.is_empty() {
                    if index == 0 { "protagonist" } else { "supporting" }.to_string()
                } else {
                    sketch.role.clone()
                },
                prominence: if index == 0 { 1.0 } else { 0.7 },
                appearance: BTreeMap::from([(
                    "summary".to_string(),
                    if sketch.description.is_empty() {
                        "distinct silhouette, consistent costume".to_string()
                    } else {
                        sketch.description.clone()
                    },
                )]),
                traits: vec!["determined".to_string()],
                goals: vec!["see the story through".to_string()],
            })
            .collect();

        let relationships = characters
            .windows(2)
            .map(|pair| Relationship {
                from: pair[0].name.clone(),
                to: pair[1].name.clone(),
                kind: "allies".to_string(),
                strength: 0.6,
            })
            .collect();

        let arcs = characters
            .first()
            .map(|lead| {
                vec![CharacterArc {
                    character: lead.name.clone(),
                    stages: vec![
                        "introduction".to_string(),
                        "trial".to_string(),
                        "growth".to_string(),
                    ],
                }]
            })
            .unwrap_or_default();

        PhaseOutput::Characters(CharacterDesign {
            characters,
            relationships,
            arcs,
            style_guide: default_style_guide(&concept.genre),
        })
    }

    fn complete_with_defaults(&self, output: PhaseOutput, req: &AgentRequest<'_>) -> PhaseOutput {
        let mut design = match output {
            PhaseOutput::Characters(design) => design,
            other => return other,
        };
        for (index, profile) in design.characters.iter_mut().enumerate() {
            if profile.prominence <= 0.0 {
                profile.prominence = if index == 0 { 1.0 } else { 0.5 };
            }
            profile.prominence = profile.prominence.clamp(0.0, 1.0);
        }
        if design.style_guide.overall_style.trim().is_empty() {
            let genre = req
                .previous
                .concept
                .as_ref()
                .map(|c| c.genre.as_str())
                .unwrap_or("drama");
            design.style_guide = default_style_guide(genre);
        }
        PhaseOutput::Characters(design)
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Characters(design) = output else {
            return Err(vec!["expected a character design output".to_string()]);
        };
        let mut errors = Vec::new();
        if design.characters.is_empty() {
            errors.push("no characters designed".to_string());
        }
        for profile in &design.characters {
            if profile.name.trim().is_empty() {
                errors.push("character with an empty name".to_string());
            }
            if !(0.0..=1.0).contains(&profile.prominence) {
                errors.push(format!(
                    "character '{}' prominence {} outside 0..=1",
                    profile.name, profile.prominence
                ));
            }
        }
        if design.style_guide.overall_style.trim().is_empty() {
            errors.push("style guide is missing an overall style".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Characters(design) = output else {
            return PhasePreview::default();
        };
        let mut counts = BTreeMap::new();
        counts.insert("characters".to_string(), design.characters.len() as u64);
        counts.insert("relationships".to_string(), design.relationships.len() as u64);
        counts.insert("arcs".to_string(), design.arcs.len() as u64);
        PhasePreview {
            phase: 2,
            title: "Character design".to_string(),
            summary: format!(
                "{} characters in a {} style",
                design.characters.len(),
                design.style_guide.overall_style
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Characters(design) = output else {
            return BTreeMap::new();
        };
        let mut scores = BTreeMap::new();
        let with_appearance = design
            .characters
            .iter()
            .filter(|c| !c.appearance.is_empty())
            .count();
        let completeness = if design.characters.is_empty() {
            0.0
        } else {
            with_appearance as f64 / design.characters.len() as f64
        };
        scores.insert("completeness".to_string(), completeness);
        scores.insert(
            "detail".to_string(),
            ((design.relationships.len() + design.arcs.len()) as f64 / 4.0).min(1.0),
        );
        scores
    }
}

fn default_style_guide(genre: &str) -> StyleGuide {
    let overall_style = match genre {
        "fantasy" | "adventure" => "shonen",
        "romance" => "shoujo",
        "horror" | "thriller" => "seinen",
        _ => "clean-line",
    };
    StyleGuide {
        overall_style: overall_style.to_string(),
        color_palette: BTreeMap::from([
            ("primary".to_string(), "#2B3A67".to_string()),
            ("accent".to_string(), "#E84545".to_string()),
        ]),
        design_principles: vec![
            "readable silhouettes".to_string(),
            "consistent costume details".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::super::PhaseOutputs;
    use super::super::outputs::{CharacterSketch, ConceptAnalysis};
    use super::*;
    use mangaforge_common::GenerationParameters;
    use uuid::Uuid;

    fn previous_with_concept() -> PhaseOutputs {
        let mut previous = PhaseOutputs::default();
        previous.set(PhaseOutput::Concept(ConceptAnalysis {
            genre: "fantasy".into(),
            themes: vec!["courage".into()],
            characters: vec![
                CharacterSketch {
                    name: "Aya".into(),
                    role: "protagonist".into(),
                    description: "a determined knight".into(),
                },
                CharacterSketch {
                    name: "Ren".into(),
                    role: String::new(),
                    description: String::new(),
                },
            ],
            ..Default::default()
        }));
        previous
    }

    #[test]
    fn requires_phase_one_fields() {
        let previous = PhaseOutputs::default();
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let errors = CharacterAgent.validate_inputs(&req).unwrap_err();
        assert!(errors[0].contains("phase 1"));
    }

    #[test]
    fn fallback_builds_profiles_from_sketches() {
        let previous = previous_with_concept();
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let output = CharacterAgent.complete_with_defaults(CharacterAgent.fallback(&req), &req);
        CharacterAgent.validate_output(&output).unwrap();
        let PhaseOutput::Characters(design) = output else {
            panic!()
        };
        assert_eq!(design.characters.len(), 2);
        assert_eq!(design.characters[0].name, "Aya");
        assert_eq!(design.characters[0].prominence, 1.0);
        assert_eq!(design.characters[1].archetype, "supporting");
        assert_eq!(design.relationships.len(), 1);
        assert_eq!(design.style_guide.overall_style, "shonen");
    }

    #[test]
    fn prominence_is_clamped_by_defaults() {
        let previous = previous_with_concept();
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let raw = PhaseOutput::Characters(CharacterDesign {
            characters: vec![CharacterProfile {
                name: "Aya".into(),
                prominence: 3.5,
                ..Default::default()
            }],
            style_guide: default_style_guide("fantasy"),
            ..Default::default()
        });
        let output = CharacterAgent.complete_with_defaults(raw, &req);
        let PhaseOutput::Characters(design) = output else {
            panic!()
        };
        assert_eq!(design.characters[0].prominence, 1.0);
    }

    #[test]
    fn parse_rejects_empty_casts() {
        assert!(
            CharacterAgent
                .parse_output(&serde_json::json!({"characters": []}))
                .is_none()
        );
    }
}
