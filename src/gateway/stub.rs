//! Deterministic in-process gateway for development and tests.
//!
//! Text responses are canned per phase (routed on the `# Phase N:` header
//! every agent puts at the top of its prompt) and wrapped in a markdown
//! fence, which doubles as coverage for the lenient JSON extraction path.
//! Failure and latency injection knobs drive the fallback and timeout tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{ImageGeneration, ImageRequest, ModelGateway, TextGeneration, TokenUsage};
use crate::errors::GatewayError;
use crate::util::content_hash;
use mangaforge_common::ModelConfig;

pub struct StubGateway {
    fail_text: bool,
    fail_images: bool,
    text_latency: Duration,
    image_latency: Duration,
    text_calls: AtomicUsize,
    image_calls: AtomicUsize,
}

impl Default for StubGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl StubGateway {
    pub fn new() -> Self {
        Self {
            fail_text: false,
            fail_images: false,
            text_latency: Duration::ZERO,
            image_latency: Duration::ZERO,
            text_calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
        }
    }

    /// Make every text call fail with a backend error.
    pub fn with_failing_text(mut self) -> Self {
        self.fail_text = true;
        self
    }

    /// Make every image call fail with a backend error.
    pub fn with_failing_images(mut self) -> Self {
        self.fail_images = true;
        self
    }

    pub fn with_text_latency(mut self, latency: Duration) -> Self {
        self.text_latency = latency;
        self
    }

    pub fn with_image_latency(mut self, latency: Duration) -> Self {
        self.image_latency = latency;
        self
    }

    /// Number of text generations attempted so far.
    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    /// Number of image generations attempted so far.
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    fn phase_of(prompt: &str) -> Option<u8> {
        let re = Regex::new(r"# Phase (\d)").expect("static regex");
        re.captures(prompt)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn canned_response(phase: u8) -> Value {
        match phase {
            1 => json!({
                "genre": "fantasy",
                "themes": ["courage", "friendship"],
                "world_setting": {
                    "time_period": "medieval",
                    "location": "mountain kingdom",
                    "atmosphere": "stormy"
                },
                "characters": [
                    {"name": "Aya", "role": "protagonist", "description": "a determined knight"},
                    {"name": "Ren", "role": "ally", "description": "a wry dragon keeper"}
                ],
                "scenes": [
                    {"number": 1, "description": "Aya receives the summons", "emotional_intensity": 3, "importance": "high", "emotional_tone": "calm"},
                    {"number": 2, "description": "the climb through the pass", "emotional_intensity": 5, "importance": "medium", "emotional_tone": "tension"},
                    {"number": 3, "description": "confrontation at the peak", "emotional_intensity": 9, "importance": "high", "emotional_tone": "climax"},
                    {"number": 4, "description": "an unexpected truce", "emotional_intensity": 4, "importance": "medium", "emotional_tone": "calm"}
                ],
                "story_beats": ["call to adventure", "rising action", "climax", "resolution"],
                "visual_suggestions": ["storm-lit ridgelines", "scale contrast between Aya and the dragon"]
            }),
            2 => json!({
                "characters": [
                    {
                        "name": "Aya",
                        "archetype": "protagonist",
                        "prominence": 1.0,
                        "appearance": {"hair": "black, cropped", "armor": "weathered steel"},
                        "traits": ["stubborn", "loyal"],
                        "goals": ["bring the dragon home"]
                    },
                    {
                        "name": "Ren",
                        "archetype": "ally",
                        "prominence": 0.7,
                        "appearance": {"hair": "silver braid", "clothes": "keeper robes"},
                        "traits": ["wry", "patient"],
                        "goals": ["keep the peace"]
                    }
                ],
                "relationships": [
                    {"from": "Aya", "to": "Ren", "kind": "uneasy alliance", "strength": 0.8}
                ],
                "arcs": [
                    {"character": "Aya", "stages": ["doubt", "resolve", "trust"]}
                ],
                "style_guide": {
                    "overall_style": "shonen",
                    "color_palette": {"primary": "#2B3A67", "accent": "#E84545"},
                    "design_principles": ["readable silhouettes", "heavy weather shading"]
                }
            }),
            3 => json!({
                "acts": [
                    {"number": 1, "title": "The Summons", "summary": "Aya is sent to the peak"},
                    {"number": 2, "title": "The Climb", "summary": "the pass tests her resolve"},
                    {"number": 3, "title": "The Truce", "summary": "an enemy becomes an ally"}
                ],
                "plot_points": ["summons arrives", "bridge collapses", "dragon speaks", "truce sworn"],
                "conflict_layers": ["duty vs mercy", "kingdom vs wilds"],
                "emotional_design": {"curve": [0.3, 0.5, 0.9, 0.4], "peak_scenes": [3]},
                "page_allocation": [
                    {"scene_number": 1, "pages": 1},
                    {"scene_number": 2, "pages": 1},
                    {"scene_number": 3, "pages": 1},
                    {"scene_number": 4, "pages": 1}
                ],
                "scenes": [
                    {"number": 1, "scene_type": "introduction", "location": "castle hall", "description": "Aya receives the summons", "key_actions": ["kneel", "accept"], "emotional_tone": "calm", "characters": ["Aya"]},
                    {"number": 2, "scene_type": "development", "location": "mountain pass", "description": "the climb through the storm", "key_actions": ["climb", "slip", "recover"], "emotional_tone": "tension", "characters": ["Aya", "Ren"]},
                    {"number": 3, "scene_type": "climax", "location": "the peak", "description": "confrontation with the dragon", "key_actions": ["draw sword", "lower sword"], "emotional_tone": "climax", "characters": ["Aya", "Ren"]},
                    {"number": 4, "scene_type": "resolution", "location": "the peak", "description": "an unexpected truce", "key_actions": ["swear truce"], "emotional_tone": "calm", "characters": ["Aya", "Ren"]}
                ]
            }),
            4 => json!({
                "pages": [
                    {
                        "page_number": 1,
                        "panels": [
                            {"id": "p1-1", "x": 0.05, "y": 0.05, "width": 0.9, "height": 0.4, "size": "large", "camera_angle": "wide", "composition": "rule_of_thirds", "scene_number": 1, "description": "Aya kneels in the storm-lit hall", "emotional_tone": "calm", "characters": [{"name": "Aya", "prominence": 0.9}]},
                            {"id": "p1-2", "x": 0.5, "y": 0.5, "width": 0.45, "height": 0.45, "size": "medium", "camera_angle": "medium", "composition": "center", "scene_number": 2, "description": "boots on a crumbling ledge", "emotional_tone": "tension", "characters": [{"name": "Aya", "prominence": 0.7}]},
                            {"id": "p1-3", "x": 0.05, "y": 0.5, "width": 0.4, "height": 0.45, "size": "medium", "camera_angle": "close_up", "composition": "diagonal", "scene_number": 2, "description": "Ren reaches down through the rain", "emotional_tone": "tension", "characters": [{"name": "Ren", "prominence": 0.8}]}
                        ],
                        "reading_order": ["p1-1", "p1-2", "p1-3"],
                        "overlap_count": 0
                    },
                    {
                        "page_number": 2,
                        "panels": [
                            {"id": "p2-1", "x": 0.05, "y": 0.05, "width": 0.9, "height": 0.55, "size": "splash", "camera_angle": "worms_eye", "composition": "golden_ratio", "scene_number": 3, "description": "the dragon unfurls against the lightning", "emotional_tone": "climax", "characters": [{"name": "Aya", "prominence": 0.85}, {"name": "Ren", "prominence": 0.4}]},
                            {"id": "p2-2", "x": 0.05, "y": 0.65, "width": 0.9, "height": 0.3, "size": "medium", "camera_angle": "medium", "composition": "symmetry", "scene_number": 4, "description": "sword lowered, a hand extended", "emotional_tone": "calm", "characters": [{"name": "Aya", "prominence": 0.6}, {"name": "Ren", "prominence": 0.6}]}
                        ],
                        "reading_order": ["p2-1", "p2-2"],
                        "overlap_count": 0
                    }
                ],
                "total_panels": 5,
                "analysis": {
                    "average_panels_per_page": 2.5,
                    "layout_variety": 0.7,
                    "composition_quality": 0.8,
                    "readability": 0.85
                }
            }),
            6 => json!({
                "placements": [
                    {"panel_id": "p1-1", "entries": [
                        {"character": "Aya", "text": "I will bring it back alive.", "bubble": "speech", "x": 0.65, "y": 0.1, "width": 0.25, "height": 0.15}
                    ]},
                    {"panel_id": "p1-2", "entries": [
                        {"character": "Aya", "text": "Don't look down.", "bubble": "thought", "x": 0.55, "y": 0.55, "width": 0.3, "height": 0.12}
                    ]},
                    {"panel_id": "p1-3", "entries": [
                        {"character": "Ren", "text": "Take my hand!", "bubble": "shout", "x": 0.1, "y": 0.55, "width": 0.28, "height": 0.14}
                    ]},
                    {"panel_id": "p2-1", "entries": [
                        {"character": "Ren", "text": "She only wants her egg returned.", "bubble": "speech", "x": 0.6, "y": 0.1, "width": 0.3, "height": 0.16}
                    ]},
                    {"panel_id": "p2-2", "entries": [
                        {"character": "Aya", "text": "Then the kingdom owes her a debt.", "bubble": "narration", "x": 0.1, "y": 0.7, "width": 0.35, "height": 0.12}
                    ]}
                ],
                "typography": {"font": "NotoSans", "font_size": 12, "bubble_corner": "rounded"},
                "reading_flow": 0.9
            }),
            7 => json!({
                "pages": [
                    {"page_number": 1, "description": "summons and the climb, three panels descending into the storm", "panel_count": 3, "dialogue_count": 3, "quality": 0.86},
                    {"page_number": 2, "description": "splash confrontation resolving into the truce", "panel_count": 2, "dialogue_count": 2, "quality": 0.88}
                ],
                "manifest": {
                    "formats": {
                        "web_preview": "/output/preview.jpg",
                        "print_ready": "/output/print_ready.pdf"
                    },
                    "total_pages": 2
                },
                "issues": []
            }),
            other => json!({"phase": other, "note": "no canned response"}),
        }
    }
}

#[async_trait]
impl ModelGateway for StubGateway {
    async fn generate_text(
        &self,
        prompt: &str,
        _config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<TextGeneration, GatewayError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);

        if !self.text_latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(self.text_latency) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        if self.fail_text {
            return Err(GatewayError::Backend("stub configured to fail".into()));
        }

        let phase = Self::phase_of(prompt)
            .ok_or_else(|| GatewayError::Backend("prompt missing phase header".into()))?;
        let body = serde_json::to_string_pretty(&Self::canned_response(phase))
            .map_err(|e| GatewayError::Backend(e.to_string()))?;
        let content = format!("Here is the requested output.\n```json\n{}\n```\n", body);
        let tokens = TokenUsage {
            input: prompt.len() as u32 / 4,
            output: content.len() as u32 / 4,
            total: (prompt.len() + content.len()) as u32 / 4,
        };
        Ok(TextGeneration { content, tokens })
    }

    async fn generate_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<ImageGeneration, GatewayError> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);

        if !self.image_latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                _ = tokio::time::sleep(self.image_latency) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        if self.fail_images {
            return Err(GatewayError::Backend("stub configured to fail".into()));
        }

        let digest = content_hash(&serde_json::json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "style_parameters": request.style_parameters,
        }));
        let short = &digest[..12];
        // Quality is a pure function of the prompt triple, so identical
        // requests always score identically.
        let first_byte = u8::from_str_radix(&digest[..2], 16).unwrap_or(0);
        let quality = 0.75 + (first_byte as f64 / 255.0) * 0.2;

        Ok(ImageGeneration {
            image_url: format!("https://img.stub.local/{}.png", short),
            thumbnail_url: format!("https://img.stub.local/{}_t.png", short),
            quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn routes_on_phase_header() {
        let stub = StubGateway::new();
        let out = stub
            .generate_text("# Phase 1: concept analysis\n...", &ModelConfig::default(), &cancel())
            .await
            .unwrap();
        assert!(out.content.contains("```json"));
        assert!(out.content.contains("fantasy"));
        assert_eq!(stub.text_calls(), 1);
    }

    #[tokio::test]
    async fn failing_text_returns_backend_error() {
        let stub = StubGateway::new().with_failing_text();
        let err = stub
            .generate_text("# Phase 1: concept analysis", &ModelConfig::default(), &cancel())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(stub.text_calls(), 1);
    }

    #[tokio::test]
    async fn image_quality_is_deterministic() {
        let stub = StubGateway::new();
        let request = ImageRequest {
            prompt: "knight on a ridge".into(),
            negative_prompt: "blurry".into(),
            style_parameters: Default::default(),
        };
        let a = stub.generate_image(&request, &cancel()).await.unwrap();
        let b = stub.generate_image(&request, &cancel()).await.unwrap();
        assert_eq!(a.image_url, b.image_url);
        assert_eq!(a.quality, b.quality);
        assert!((0.75..=0.95).contains(&a.quality));
        assert_eq!(stub.image_calls(), 2);
    }

    #[tokio::test]
    async fn latency_observes_cancellation() {
        let stub = StubGateway::new().with_text_latency(Duration::from_secs(60));
        let token = cancel();
        token.cancel();
        let err = stub
            .generate_text("# Phase 1: x", &ModelConfig::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }
}
