//! Phase 7: final integration.
//!
//! Compiles per-page composite descriptions from everything the earlier
//! phases produced and emits the output manifest. The cross-phase quality
//! assessment itself lives in the quality module; this agent surfaces the
//! material it runs on.

use std::collections::BTreeMap;

use serde_json::Value;

use super::outputs::{CompiledPage, FinalComposition, OutputManifest, PhaseOutput, PhasePreview};
use super::{AgentRequest, PhaseAgent};

pub struct IntegrationAgent;

impl PhaseAgent for IntegrationAgent {
    fn phase_number(&self) -> u8 {
        7
    }

    fn name(&self) -> &'static str {
        "final integration"
    }

    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>> {
        let missing: Vec<String> = (1..=6u8)
            .filter(|phase| !req.previous.has_phase(*phase))
            .map(|phase| format!("phase {} results are required", phase))
            .collect();
        if missing.is_empty() { Ok(()) } else { Err(missing) }
    }

    fn build_prompt(&self, req: &AgentRequest<'_>) -> String {
        let layout = req.previous.layout.as_ref().expect("validated");
        let dialogue = req.previous.dialogue.as_ref().expect("validated");
        let imagery = req.previous.imagery.as_ref().expect("validated");
        let pages: Vec<Value> = layout
            .pages
            .iter()
            .map(|page| {
                serde_json::json!({
                    "page_number": page.page_number,
                    "panels": page.panels.iter().map(|p| &p.id).collect::<Vec<_>>(),
                })
            })
            .collect();
        let mut prompt = format!(
            "# Phase 7: final integration\n\n\
             ## Pages and panels\n{}\n\n\
             ## Dialogue line count\n{}\n\n\
             ## Image success rate\n{:.2}\n\n\
             ## Task\n\
             Compile a composite description for every page, note any issues\n\
             that need a human eye, and emit the output manifest.\n\n\
             Respond with a single JSON object with the fields: pages\n\
             [{{page_number, description, panel_count, dialogue_count,\n\
             quality}}], manifest {{formats, total_pages}}, issues.\n",
            serde_json::to_string_pretty(&pages).unwrap_or_default(),
            dialogue
                .placements
                .iter()
                .map(|p| p.entries.len())
                .sum::<usize>(),
            imagery.success_rate,
        );
        if let Some(feedback) = req.feedback {
            prompt.push_str(&format!("\n## Reviewer feedback to address\n{}\n", feedback));
        }
        prompt
    }

    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput> {
        let parsed = PhaseOutput::from_value(7, raw).ok()?;
        match &parsed {
            PhaseOutput::Integration(composition) if composition.pages.is_empty() => None,
            _ => Some(parsed),
        }
    }

    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput {
        let layout = req.previous.layout.as_ref().expect("validated");
        let dialogue = req.previous.dialogue.as_ref().expect("validated");
        let imagery = req.previous.imagery.as_ref().expect("validated");

        let pages: Vec<CompiledPage> = layout
            .pages
            .iter()
            .map(|page| {
                let panel_ids: Vec<&str> = page.panels.iter().map(|p| p.id.as_str()).collect();
                let dialogue_count = dialogue
                    .placements
                    .iter()
                    .filter(|p| panel_ids.contains(&p.panel_id.as_str()))
                    .map(|p| p.entries.len())
                    .sum::<usize>();
                let description = page
                    .panels
                    .iter()
                    .map(|p| p.description.as_str())
                    .filter(|d| !d.is_empty())
                    .collect::<Vec<_>>()
                    .join("; ");
                CompiledPage {
                    page_number: page.page_number,
                    description: if description.is_empty() {
                        format!("page {} composite", page.page_number)
                    } else {
                        description
                    },
                    panel_count: page.panels.len() as u32,
                    dialogue_count: dialogue_count as u32,
                    quality: imagery.average_quality,
                }
            })
            .collect();

        let failed_images = imagery.images.iter().filter(|i| !i.success).count();
        let mut issues = Vec::new();
        if failed_images > 0 {
            issues.push(format!("{} panel image(s) missing", failed_images));
        }

        PhaseOutput::Integration(FinalComposition {
            manifest: OutputManifest {
                formats: BTreeMap::from([
                    ("web_preview".to_string(), "/output/preview.jpg".to_string()),
                    (
                        "print_ready".to_string(),
                        "/output/print_ready.pdf".to_string(),
                    ),
                ]),
                total_pages: pages.len() as u32,
            },
            pages,
            issues,
        })
    }

    fn complete_with_defaults(&self, output: PhaseOutput, _req: &AgentRequest<'_>) -> PhaseOutput {
        let mut composition = match output {
            PhaseOutput::Integration(composition) => composition,
            other => return other,
        };
        composition.manifest.total_pages = composition.pages.len() as u32;
        if composition.manifest.formats.is_empty() {
            composition
                .manifest
                .formats
                .insert("web_preview".to_string(), "/output/preview.jpg".to_string());
        }
        PhaseOutput::Integration(composition)
    }

    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>> {
        let PhaseOutput::Integration(composition) = output else {
            return Err(vec!["expected a final composition output".to_string()]);
        };
        let mut errors = Vec::new();
        if composition.pages.is_empty() {
            errors.push("no compiled pages".to_string());
        }
        if composition.manifest.total_pages != composition.pages.len() as u32 {
            errors.push(format!(
                "manifest claims {} pages but {} were compiled",
                composition.manifest.total_pages,
                composition.pages.len()
            ));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn preview(&self, output: &PhaseOutput) -> PhasePreview {
        let PhaseOutput::Integration(composition) = output else {
            return PhasePreview::default();
        };
        let mut counts = BTreeMap::new();
        counts.insert("pages".to_string(), composition.pages.len() as u64);
        counts.insert("issues".to_string(), composition.issues.len() as u64);
        PhasePreview {
            phase: 7,
            title: "Final integration".to_string(),
            summary: format!(
                "{} pages compiled, {} issue(s) flagged",
                composition.pages.len(),
                composition.issues.len()
            ),
            counts,
        }
    }

    fn self_scores(&self, output: &PhaseOutput) -> BTreeMap<String, f64> {
        let PhaseOutput::Integration(composition) = output else {
            return BTreeMap::new();
        };
        let described = composition
            .pages
            .iter()
            .filter(|p| !p.description.is_empty())
            .count();
        let completeness = if composition.pages.is_empty() {
            0.0
        } else {
            described as f64 / composition.pages.len() as f64
        };
        let issue_penalty = (composition.issues.len() as f64 * 0.2).min(1.0);
        BTreeMap::from([
            ("completeness".to_string(), completeness),
            ("composite".to_string(), (1.0 - issue_penalty).max(0.0)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::super::PhaseOutputs;
    use super::super::outputs::{
        CharacterDesign, ConceptAnalysis, DialogueLine, DialoguePlan, ImageryResult,
        NarrativeStructure, PageLayout, PageLayouts, Panel, PanelDialogue,
    };
    use super::*;
    use crate::fanout::ImageGenerationResult;
    use mangaforge_common::GenerationParameters;
    use uuid::Uuid;

    fn previous() -> PhaseOutputs {
        let mut previous = PhaseOutputs::default();
        previous.set(PhaseOutput::Concept(ConceptAnalysis::default()));
        previous.set(PhaseOutput::Characters(CharacterDesign::default()));
        previous.set(PhaseOutput::Narrative(NarrativeStructure::default()));
        previous.set(PhaseOutput::Layout(PageLayouts {
            pages: vec![PageLayout {
                page_number: 1,
                panels: vec![Panel {
                    id: "p1-1".into(),
                    description: "the hall".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            total_panels: 1,
            ..Default::default()
        }));
        previous.set(PhaseOutput::Imagery(ImageryResult {
            images: vec![ImageGenerationResult {
                panel_id: "p1-1".into(),
                success: false,
                error_message: Some("backend down".into()),
                ..Default::default()
            }],
            average_quality: 0.0,
            ..Default::default()
        }));
        previous.set(PhaseOutput::Dialogue(DialoguePlan {
            placements: vec![PanelDialogue {
                panel_id: "p1-1".into(),
                entries: vec![DialogueLine {
                    character: "Aya".into(),
                    text: "Onward.".into(),
                    ..Default::default()
                }],
            }],
            ..Default::default()
        }));
        previous
    }

    #[test]
    fn requires_all_six_upstream_phases() {
        let empty = PhaseOutputs::default();
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &empty,
            params: &params,
            feedback: None,
        };
        let errors = IntegrationAgent.validate_inputs(&req).unwrap_err();
        assert_eq!(errors.len(), 6);
    }

    #[test]
    fn fallback_compiles_pages_and_flags_missing_images() {
        let previous = previous();
        let params = GenerationParameters::default();
        let req = AgentRequest {
            session_id: Uuid::nil(),
            input_text: "story",
            previous: &previous,
            params: &params,
            feedback: None,
        };
        let output =
            IntegrationAgent.complete_with_defaults(IntegrationAgent.fallback(&req), &req);
        IntegrationAgent.validate_output(&output).unwrap();
        let PhaseOutput::Integration(composition) = output else {
            panic!()
        };
        assert_eq!(composition.pages.len(), 1);
        assert_eq!(composition.pages[0].panel_count, 1);
        assert_eq!(composition.pages[0].dialogue_count, 1);
        assert_eq!(composition.manifest.total_pages, 1);
        assert!(composition.issues[0].contains("1 panel image(s) missing"));
    }

    #[test]
    fn manifest_page_count_is_enforced() {
        let output = PhaseOutput::Integration(FinalComposition {
            pages: vec![CompiledPage {
                page_number: 1,
                ..Default::default()
            }],
            manifest: OutputManifest {
                total_pages: 5,
                ..Default::default()
            },
            issues: vec![],
        });
        let errors = IntegrationAgent.validate_output(&output).unwrap_err();
        assert!(errors[0].contains("manifest claims 5"));
    }
}
