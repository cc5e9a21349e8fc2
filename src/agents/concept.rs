//! Phase 1: concept analysis.
//!
//! Turns the raw input text into a structured analysis: genre, themes,
//! world setting, character sketches, a 3..=12 entry scene list and the
//! story beats the later phases hang everything on.

use std::collections::BTreeMap;

use serde_json::Value;

use super::outputs::{
    CharacterSketch, ConceptAnalysis, Importance, PhaseOutput, PhasePreview, SceneOutline,
    WorldSetting,
};
use super::{AgentRequest, PhaseAgent};

const MIN_SCENES: usize = 3;
const MAX_SCENES: usize = 12;

pub struct ConceptAgent;

impl PhaseAgent for ConceptAgent {
    fn phase_number(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "concept analysis"
    }

    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>> {
        if req.input_text.trim().is_empty() {
            return Err(vec!["input text is empty".to_string()]);
        }
        Ok(())
    }

    fn build_prompt(&self, req: &AgentRequest<'_>) -> String {
        let mut prompt = format!(
            "# Phase 1: concept analysis\n\n\
             ## Input text\n{}\n\n\
             ## Task\n\
             Analyze the story above. Classify its genre (preferred genre: {}),\n\
             extract the main themes, describe the world setting, sketch the\n\
             characters, and break the story into {}..{} scenes. Each scene\n\
             needs a number, a description, an emotional_intensity from 1 to 10,\n\
             an importance of high/medium/low and an emotional_tone.\n\n\
             Respond with a single JSON object with the fields: genre, themes,\n\
             world_setting {{time_period, location, atmosphere}}, characters\n\
             [{{name, role, description}}], scenes, story_beats, visual_suggestions.\n",
            req.input_text,
            if req.params.primary_genre.is_empty() {
                "none"
            } else {
                &req.params.primary_genre
            },
            MIN_SCENES,
            MAX_SCENES,
        );
        if let Some(feedback) = req.feedback {
            prompt.push_str(&format!("\n## Reviewer feedback to address\n{}\n", feedback));
        }
        prompt
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        let parsed = PhaseOutput::from_value(1, raw).ok()?;
        match &parsed {
            // A concept with no scenes at all gives phase 3 nothing to
            // structure; treat it as unusable rather than padding it.
            PhaseOutput::Concept(concept) if concept.scenes.is_empty() => None,
            _ => Some(parsed),
        }
    }

    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput {
        PhaseOutput::Concept(fallback_concept(req.input_text, &req.params.primary_genre))
    }

    fn complete_with_defaults(&self, output: PhaseOutput, req: &AgentRequest<'_>) -> PhaseOutput {
        let mut concept = match output {
            PhaseOutput::Concept(concept) => concept,
            other => return other,
        };
        if concept.genre.trim().is_empty() {
            concept.genre = if req.params.primary_genre.is_empty() {
                "drama".to_string()
            } else {
                req.params.primary_genre.clone()
            };
        }
        if concept.themes.is_empty() {
            concept.themes.push("resolve".to_string());
        }
        if concept.characters.is_empty() {
            concept.characters.push(CharacterSketch {
                name: "Protagonist".to_string(),
                role: "protagonist".to_string(),
                description: "the story's central figure".to_string(),
            });
        }
        // Pad a thin scene list up to the minimum, renumber, clamp
        // intensities into 1..=10 and cap at the maximum.
        while concept.scenes.len() < MIN_SCENES {
            let number = concept.scenes.len() as u32 + 1;
            concept.scenes.push(SceneOutline {
                number,
                description: "the story continues".to_string(),
                emotional_intensity: 5,
                importance: Importance::Medium,
                emotional_tone: "calm".to_string(),
            });
        }
        concept.scenes.truncate(MAX_SCENES);
        for (index, scene) in concept.scenes.iter_mut().enumerate() {
            scene.number = index as u32 + 1;
            scene.emotional_intensity = scene.emotional_intensity.clamp(1, 10);
            if scene.emotional_tone.trim().is_empty() {
                scene.emotional_tone = "calm".to_string();
            }
        }
        if concept.story_beats.is_empty() {
            concept.story_beats = vec![
                "setup".to_string(),
                "rising action".to_string(),
                "climax".to_string(),
                "resolution".to_string(),
            ];
        }
        PhaseOutput::Concept(concept)
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Concept(concept) = output else {
            return Err(vec!["expected a concept analysis output".to_string()]);
        };
        let mut errors = Vec::new();
        if concept.genre.trim().is_empty() {
            errors.push("genre is empty".to_string());
        }
        if !(MIN_SCENES..=MAX_SCENES).contains(&concept.scenes.len()) {
            errors.push(format!(
                "scene count {} outside {}..={}",
                concept.scenes.len(),
                MIN_SCENES,
                MAX_SCENES
            ));
        }
        for scene in &concept.scenes {
            if !(1..=10).contains(&scene.emotional_intensity) {
                errors.push(format!(
                    "scene {} emotional_intensity {} outside 1..=10",
                    scene.number, scene.emotional_intensity
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Concept(concept) = output else {
            return PhasePreview::default();
        };
        let mut counts = BTreeMap::new();
        counts.insert("scenes".to_string(), concept.scenes.len() as u64);
        counts.insert("characters".to_string(), concept.characters.len() as u64);
        counts.insert("themes".to_string(), concept.themes.len() as u64);
        PhasePreview {
            phase: 1,
            title: "Concept analysis".to_string(),
            summary: format!(
                "{} story in {} scenes featuring {}",
                concept.genre,
                concept.scenes.len(),
                concept
                    .characters
                    .iter()
                    .map(|c| c.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Concept(concept) = output else {
            return BTreeMap::new();
        };
        let mut scores = BTreeMap::new();
        let filled = [
            !concept.genre.is_empty(),
            !concept.themes.is_empty(),
            !concept.world_setting.location.is_empty(),
            !concept.characters.is_empty(),
            !concept.scenes.is_empty(),
            !concept.story_beats.is_empty(),
            !concept.visual_suggestions.is_empty(),
        ];
        let completeness = filled.iter().filter(|f| **f).count() as f64 / filled.len() as f64;
        scores.insert("completeness".to_string(), completeness);
        let detail = (concept.scenes.len() as f64 / 8.0).min(1.0);
        scores.insert("detail".to_string(), detail);
        scores
    }
}

/// Deterministic concept built from the raw text alone.
fn fallback_concept(input_text: &str, preferred_genre: &str) -> ConceptAnalysis {
    let sentences = split_sentences(input_text);
    let names = guess_names(input_text);

    let characters: Vec<CharacterSketch> = if names.is_empty() {
        vec![CharacterSketch {
            name: "Protagonist".to_string(),
            role: "protagonist".to_string(),
            description: "the story's central figure".to_string(),
        }]
    } else {
        names
            .into_iter()
            .take(3)
            .enumerate()
            .map(|(index, name)| CharacterSketch {
                name,
                role: if index == 0 { "protagonist" } else { "ally" }.to_string(),
                description: "drawn from the input text".to_string(),
            })
            .collect()
    };

    let scene_count = sentences.len().clamp(MIN_SCENES, 4);
    let tones = ["calm", "tension", "climax", "calm"];
    let intensities = [3u8, 6, 9, 4];
    let scenes = (0..scene_count)
        .map(|index| {
            let description = chunk_for(&sentences, index, scene_count)
                .unwrap_or_else(|| "the story unfolds".to_string());
            SceneOutline {
                number: index as u32 + 1,
                description,
                emotional_intensity: intensities[index.min(3)],
                importance: if index == 0 || index == 2 {
                    Importance::High
                } else {
                    Importance::Medium
                },
                emotional_tone: tones[index.min(3)].to_string(),
            }
        })
        .collect();

    ConceptAnalysis {
        genre: if preferred_genre.is_empty() {
            "drama".to_string()
        } else {
            preferred_genre.to_string()
        },
        themes: vec!["resolve".to_string(), "connection".to_string()],
        world_setting: WorldSetting {
            time_period: "unspecified".to_string(),
            location: "unspecified".to_string(),
            atmosphere: "grounded".to_string(),
        },
        characters,
        scenes,
        story_beats: vec![
            "setup".to_string(),
            "rising action".to_string(),
            "climax".to_string(),
            "resolution".to_string(),
        ],
        visual_suggestions: vec!["establishing shot of the setting".to_string()],
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Sentence slice assigned to scene `index` of `total` scenes.
fn chunk_for(sentences: &[String], index: usize, total: usize) -> Option<String> {
    if sentences.is_empty() {
        return None;
    }
    let per_scene = sentences.len().div_ceil(total);
    let start = index * per_scene;
    if start >= sentences.len() {
        return None;
    }
    let end = (start + per_scene).min(sentences.len());
    Some(sentences[start..end].join(". "))
}

/// Capitalized words that are not sentence starts, deduplicated in order.
fn guess_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut sentence_start = true;
    for word in text.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphabetic()).collect();
        let capitalized = cleaned
            .chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false);
        if capitalized && cleaned.len() > 2 && !sentence_start && !names.contains(&cleaned) {
            names.push(cleaned.clone());
        }
        sentence_start = word.ends_with(['.', '!', '?']);
    }
    names
}
