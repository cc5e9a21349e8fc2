//! Typed per-phase outputs.
//!
//! The pipeline threads no dynamic dictionaries between phases: every phase
//! produces one of the structs below, and downstream phases consume them as
//! compile-time type relationships through [`PhaseOutputs`]. Serde defaults
//! are deliberately permissive so that partial model JSON still parses; the
//! agents' validators enforce the real structural constraints afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fanout::ImageGenerationResult;

// ── Phase 1: concept analysis ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Default for Importance {
    fn default() -> Self {
        Importance::Medium
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSetting {
    #[serde(default)]
    pub time_period: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub atmosphere: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterSketch {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SceneOutline {
    pub number: u32,
    #[serde(default)]
    pub description: String,
    /// 1..=10.
    #[serde(default = "default_intensity")]
    pub emotional_intensity: u8,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub emotional_tone: String,
}

fn default_intensity() -> u8 {
    5
}

/// Output of phase 1: structured analysis of the raw input text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptAnalysis {
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub world_setting: WorldSetting,
    #[serde(default)]
    pub characters: Vec<CharacterSketch>,
    /// 3..=12 entries once validated.
    #[serde(default)]
    pub scenes: Vec<SceneOutline>,
    #[serde(default)]
    pub story_beats: Vec<String>,
    #[serde(default)]
    pub visual_suggestions: Vec<String>,
}

// ── Phase 2: character design ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub archetype: String,
    /// 0..=1; how central the character is to the story.
    #[serde(default)]
    pub prominence: f64,
    #[serde(default)]
    pub appearance: BTreeMap<String, String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relationship {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub strength: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterArc {
    pub character: String,
    #[serde(default)]
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StyleGuide {
    #[serde(default)]
    pub overall_style: String,
    #[serde(default)]
    pub color_palette: BTreeMap<String, String>,
    #[serde(default)]
    pub design_principles: Vec<String>,
}

/// Output of phase 2: character roster, arcs and the visual style guide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterDesign {
    #[serde(default)]
    pub characters: Vec<CharacterProfile>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub arcs: Vec<CharacterArc>,
    #[serde(default)]
    pub style_guide: StyleGuide,
}

// ── Phase 3: story structure ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Act {
    pub number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmotionalDesign {
    /// Intensity per scene, 0..=1.
    #[serde(default)]
    pub curve: Vec<f64>,
    #[serde(default)]
    pub peak_scenes: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageAllocation {
    pub scene_number: u32,
    pub pages: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    pub number: u32,
    #[serde(default)]
    pub scene_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub key_actions: Vec<String>,
    #[serde(default)]
    pub emotional_tone: String,
    #[serde(default)]
    pub characters: Vec<String>,
}

/// Output of phase 3: the narrative skeleton the visual phases build on.
///
/// The field name `scenes` is canonical; the deprecated `scene_breakdown`
/// alias from older producers is rejected at rehydration time rather than
/// silently accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrativeStructure {
    #[serde(default)]
    pub acts: Vec<Act>,
    #[serde(default)]
    pub plot_points: Vec<String>,
    #[serde(default)]
    pub conflict_layers: Vec<String>,
    #[serde(default)]
    pub emotional_design: EmotionalDesign,
    #[serde(default)]
    pub page_allocation: Vec<PageAllocation>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

// ── Phase 4: panel layout ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelSize {
    Small,
    Medium,
    Large,
    Splash,
}

impl Default for PanelSize {
    fn default() -> Self {
        PanelSize::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraAngle {
    CloseUp,
    Medium,
    Wide,
    BirdsEye,
    WormsEye,
    Dutch,
}

impl Default for CameraAngle {
    fn default() -> Self {
        CameraAngle::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionRule {
    RuleOfThirds,
    Center,
    Diagonal,
    Symmetry,
    GoldenRatio,
}

impl Default for CompositionRule {
    fn default() -> Self {
        CompositionRule::RuleOfThirds
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelCharacter {
    pub name: String,
    /// 0..=1 visual prominence within the panel.
    #[serde(default)]
    pub prominence: f64,
}

/// One panel with a normalized position and size, all in [0, 1].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Panel {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub size: PanelSize,
    #[serde(default)]
    pub camera_angle: CameraAngle,
    #[serde(default)]
    pub composition: CompositionRule,
    #[serde(default)]
    pub scene_number: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub emotional_tone: String,
    #[serde(default)]
    pub characters: Vec<PanelCharacter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageLayout {
    pub page_number: u32,
    #[serde(default)]
    pub panels: Vec<Panel>,
    /// Panel ids sorted top-to-bottom, then right-to-left.
    #[serde(default)]
    pub reading_order: Vec<String>,
    /// Overlapping panel pairs are tolerated but recorded.
    #[serde(default)]
    pub overlap_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutAnalysis {
    #[serde(default)]
    pub average_panels_per_page: f64,
    #[serde(default)]
    pub layout_variety: f64,
    #[serde(default)]
    pub composition_quality: f64,
    #[serde(default)]
    pub readability: f64,
}

/// Output of phase 4: per-page panel layouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageLayouts {
    #[serde(default)]
    pub pages: Vec<PageLayout>,
    #[serde(default)]
    pub total_panels: u32,
    #[serde(default)]
    pub analysis: LayoutAnalysis,
}

impl PageLayouts {
    pub fn panels(&self) -> impl Iterator<Item = &Panel> {
        self.pages.iter().flat_map(|p| p.panels.iter())
    }
}

// ── Phase 5: image generation ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageDescription {
    pub panel_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub character: f64,
    pub style: f64,
    pub quality_variance: f64,
    pub overall: f64,
    #[serde(default)]
    pub per_character: BTreeMap<String, f64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Output of phase 5: one image per panel plus the aggregate analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageryResult {
    pub images: Vec<ImageGenerationResult>,
    pub image_descriptions: Vec<ImageDescription>,
    pub consistency: ConsistencyReport,
    pub success_rate: f64,
    pub average_quality: f64,
    pub parallel_efficiency: f64,
    pub cache_hit_rate: f64,
}

// ── Phase 6: dialogue placement ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleStyle {
    Speech,
    Thought,
    Shout,
    Whisper,
    Narration,
}

impl Default for BubbleStyle {
    fn default() -> Self {
        BubbleStyle::Speech
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogueLine {
    pub character: String,
    pub text: String,
    #[serde(default)]
    pub bubble: BubbleStyle,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelDialogue {
    pub panel_id: String,
    #[serde(default)]
    pub entries: Vec<DialogueLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typography {
    pub font: String,
    pub font_size: u32,
    pub bubble_corner: String,
}

impl Default for Typography {
    fn default() -> Self {
        Self {
            font: "NotoSans".to_string(),
            font_size: 12,
            bubble_corner: "rounded".to_string(),
        }
    }
}

/// Output of phase 6: dialogue anchored to panels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialoguePlan {
    #[serde(default)]
    pub placements: Vec<PanelDialogue>,
    #[serde(default)]
    pub typography: Typography,
    #[serde(default)]
    pub reading_flow: f64,
}

// ── Phase 7: final integration ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledPage {
    pub page_number: u32,
    #[serde(default)]
    pub description: String,
    pub panel_count: u32,
    pub dialogue_count: u32,
    #[serde(default)]
    pub quality: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputManifest {
    #[serde(default)]
    pub formats: BTreeMap<String, String>,
    pub total_pages: u32,
}

/// Output of phase 7: compiled page descriptions and the output manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalComposition {
    #[serde(default)]
    pub pages: Vec<CompiledPage>,
    #[serde(default)]
    pub manifest: OutputManifest,
    #[serde(default)]
    pub issues: Vec<String>,
}

// ── The tagged union threaded between phases ─────────────────────────────

/// Any phase's typed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseOutput {
    Concept(ConceptAnalysis),
    Characters(CharacterDesign),
    Narrative(NarrativeStructure),
    Layout(PageLayouts),
    Imagery(ImageryResult),
    Dialogue(DialoguePlan),
    Integration(FinalComposition),
}

impl PhaseOutput {
    pub fn phase_number(&self) -> u8 {
        match self {
            PhaseOutput::Concept(_) => 1,
            PhaseOutput::Characters(_) => 2,
            PhaseOutput::Narrative(_) => 3,
            PhaseOutput::Layout(_) => 4,
            PhaseOutput::Imagery(_) => 5,
            PhaseOutput::Dialogue(_) => 6,
            PhaseOutput::Integration(_) => 7,
        }
    }

    /// Rehydrate a bare (untagged) output document for the given phase.
    ///
    /// Older producers used a `scene_breakdown` key in phase 3 documents;
    /// that alias is rejected here so the contract violation surfaces at the
    /// boundary instead of downstream.
    pub fn from_value(phase: u8, value: &serde_json::Value) -> Result<Self, String> {
        if phase == 3
            && let Some(obj) = value.as_object()
            && obj.contains_key("scene_breakdown")
            && !obj.contains_key("scenes")
        {
            return Err(
                "phase 3 output uses deprecated 'scene_breakdown' field; expected 'scenes'"
                    .to_string(),
            );
        }
        let parse_err = |e: serde_json::Error| format!("phase {} output malformed: {}", phase, e);
        match phase {
            1 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Concept)
                .map_err(parse_err),
            2 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Characters)
                .map_err(parse_err),
            3 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Narrative)
                .map_err(parse_err),
            4 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Layout)
                .map_err(parse_err),
            5 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Imagery)
                .map_err(parse_err),
            6 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Dialogue)
                .map_err(parse_err),
            7 => serde_json::from_value(value.clone())
                .map(PhaseOutput::Integration)
                .map_err(parse_err),
            other => Err(format!("unknown phase number {}", other)),
        }
    }

    /// Serialize the bare output document (without the phase tag).
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            PhaseOutput::Concept(v) => serde_json::to_value(v),
            PhaseOutput::Characters(v) => serde_json::to_value(v),
            PhaseOutput::Narrative(v) => serde_json::to_value(v),
            PhaseOutput::Layout(v) => serde_json::to_value(v),
            PhaseOutput::Imagery(v) => serde_json::to_value(v),
            PhaseOutput::Dialogue(v) => serde_json::to_value(v),
            PhaseOutput::Integration(v) => serde_json::to_value(v),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Compact phase summary surfaced to the UI and feedback requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasePreview {
    pub phase: u8,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
}

/// Everything a completed phase persists: the typed output, its preview and
/// any feedback metadata attached after a HITL revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseArtifact {
    pub output: PhaseOutput,
    pub preview: PhasePreview,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_applied: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_at: Option<DateTime<Utc>>,
}

impl PhaseArtifact {
    pub fn new(output: PhaseOutput, preview: PhasePreview) -> Self {
        Self {
            output,
            preview,
            feedback_applied: None,
            revised_at: None,
        }
    }

    /// Storage form: the output as a bare document (no phase tag) next to
    /// its preview and feedback metadata. The phase number lives on the
    /// surrounding `PhaseResult` row.
    pub fn to_stored(&self) -> serde_json::Value {
        let mut stored = serde_json::json!({
            "output": self.output.to_value(),
            "preview": self.preview,
        });
        if let Some(feedback) = &self.feedback_applied {
            stored["feedback_applied"] = feedback.clone();
        }
        if let Some(revised_at) = &self.revised_at {
            stored["revised_at"] = serde_json::json!(revised_at);
        }
        stored
    }

    /// Rehydrate from the storage form, re-running the per-phase boundary
    /// checks (including the deprecated-alias rejection) on the bare
    /// output document.
    pub fn from_stored(phase: u8, stored: &serde_json::Value) -> Result<Self, String> {
        let output_value = stored
            .get("output")
            .ok_or_else(|| format!("phase {} artifact is missing its output", phase))?;
        let output = PhaseOutput::from_value(phase, output_value)?;
        let preview = stored
            .get("preview")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("phase {} preview malformed: {}", phase, e))?
            .unwrap_or_default();
        let revised_at = stored
            .get("revised_at")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("phase {} revised_at malformed: {}", phase, e))?;
        Ok(Self {
            output,
            preview,
            feedback_applied: stored.get("feedback_applied").cloned(),
            revised_at,
        })
    }
}

/// Outputs of the phases completed so far, one slot per phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutputs {
    pub concept: Option<ConceptAnalysis>,
    pub characters: Option<CharacterDesign>,
    pub narrative: Option<NarrativeStructure>,
    pub layout: Option<PageLayouts>,
    pub imagery: Option<ImageryResult>,
    pub dialogue: Option<DialoguePlan>,
    pub integration: Option<FinalComposition>,
}

impl PhaseOutputs {
    pub fn set(&mut self, output: PhaseOutput) {
        match output {
            PhaseOutput::Concept(v) => self.concept = Some(v),
            PhaseOutput::Characters(v) => self.characters = Some(v),
            PhaseOutput::Narrative(v) => self.narrative = Some(v),
            PhaseOutput::Layout(v) => self.layout = Some(v),
            PhaseOutput::Imagery(v) => self.imagery = Some(v),
            PhaseOutput::Dialogue(v) => self.dialogue = Some(v),
            PhaseOutput::Integration(v) => self.integration = Some(v),
        }
    }

    pub fn has_phase(&self, phase: u8) -> bool {
        match phase {
            1 => self.concept.is_some(),
            2 => self.characters.is_some(),
            3 => self.narrative.is_some(),
            4 => self.layout.is_some(),
            5 => self.imagery.is_some(),
            6 => self.dialogue.is_some(),
            7 => self.integration.is_some(),
            _ => false,
        }
    }

    /// Phases 1..=7 with an output present, in order.
    pub fn completed(&self) -> Vec<u8> {
        (1..=7).filter(|p| self.has_phase(*p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phase_output_round_trips_through_value() {
        let concept = ConceptAnalysis {
            genre: "fantasy".into(),
            themes: vec!["courage".into()],
            ..Default::default()
        };
        let value = PhaseOutput::Concept(concept).to_value();
        let back = PhaseOutput::from_value(1, &value).unwrap();
        match back {
            PhaseOutput::Concept(c) => assert_eq!(c.genre, "fantasy"),
            other => panic!("expected concept, got phase {}", other.phase_number()),
        }
    }

    #[test]
    fn deprecated_scene_breakdown_alias_is_rejected() {
        let legacy = json!({
            "scene_breakdown": [{"number": 1, "description": "opening"}],
            "acts": []
        });
        let err = PhaseOutput::from_value(3, &legacy).unwrap_err();
        assert!(err.contains("scene_breakdown"));

        // A document carrying the canonical key parses even if the legacy
        // key is also present.
        let both = json!({
            "scenes": [{"number": 1}],
            "scene_breakdown": []
        });
        assert!(PhaseOutput::from_value(3, &both).is_ok());
    }

    #[test]
    fn unknown_phase_number_is_an_error() {
        assert!(PhaseOutput::from_value(8, &json!({})).is_err());
        assert!(PhaseOutput::from_value(0, &json!({})).is_err());
    }

    #[test]
    fn outputs_track_completed_phases() {
        let mut outputs = PhaseOutputs::default();
        assert!(outputs.completed().is_empty());
        outputs.set(PhaseOutput::Concept(ConceptAnalysis::default()));
        outputs.set(PhaseOutput::Narrative(NarrativeStructure::default()));
        assert_eq!(outputs.completed(), vec![1, 3]);
        assert!(outputs.has_phase(1));
        assert!(!outputs.has_phase(2));
    }

    #[test]
    fn permissive_parse_fills_defaults() {
        // A minimal model response parses; validation happens elsewhere.
        let sparse = json!({"genre": "mystery"});
        let parsed = PhaseOutput::from_value(1, &sparse).unwrap();
        match parsed {
            PhaseOutput::Concept(c) => {
                assert_eq!(c.genre, "mystery");
                assert!(c.scenes.is_empty());
            }
            _ => panic!("wrong variant"),
        }
    }
}
