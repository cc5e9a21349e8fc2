//! Image generation tasks and their priority computation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agents::outputs::{Panel, PanelSize};
use crate::util::content_hash;

/// Default retry budget per image task.
pub const DEFAULT_IMAGE_MAX_RETRIES: u32 = 3;

/// One unit of work for the fan-out engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationTask {
    pub panel_id: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub style_parameters: BTreeMap<String, String>,
    /// Characters featured in the panel, used by the consistency analysis.
    pub characters: Vec<String>,
    /// 1..=10; higher runs earlier.
    pub priority: u8,
    pub max_retries: u32,
}

impl ImageGenerationTask {
    /// Content-addressed cache key: SHA-256 over the canonicalized prompt
    /// triple. Identical prompts dedupe to one backend invocation.
    pub fn cache_key(&self) -> String {
        content_hash(&json!({
            "prompt": self.prompt,
            "negative_prompt": self.negative_prompt,
            "style_parameters": self.style_parameters,
        }))
    }
}

/// Outcome of one image task, success or not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageGenerationResult {
    pub panel_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    pub generation_duration_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub from_cache: bool,
}

/// Priority for a panel's image task.
///
/// Base 5, +2 on the first page, +1 for the first panel of its page,
/// +2 for climax/tension tone, +1 for large or splash panels, +1 when any
/// character dominates the frame. Clamped to 1..=10.
pub fn panel_priority(panel: &Panel, page_number: u32, panel_index: usize) -> u8 {
    let mut priority: i32 = 5;

    if page_number == 1 {
        priority += 2;
    }
    if panel_index == 0 {
        priority += 1;
    }
    if matches!(panel.emotional_tone.as_str(), "climax" | "tension") {
        priority += 2;
    }
    if matches!(panel.size, PanelSize::Large | PanelSize::Splash) {
        priority += 1;
    }
    if panel.characters.iter().any(|c| c.prominence > 0.8) {
        priority += 1;
    }

    priority.clamp(1, 10) as u8
}
