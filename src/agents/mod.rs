//! The per-phase execution contract shared by all seven agents.
//!
//! Every agent implements [`PhaseAgent`]; the provided `execute` runs the
//! common contract: validate inputs, build the prompt, invoke the model with
//! timeout and retry, leniently parse the response, fall back to the
//! deterministic generator when the model path yields nothing usable, top up
//! defaults, validate the output, and build a preview. The image phase
//! overrides `execute` to run the parallel fan-out engine instead of the
//! text endpoint.
//!
//! Transient backend trouble never leaves this module: an agent either
//! succeeds via the model or succeeds via its fallback. Only input
//! validation, invalid fallback output, retry exhaustion with fallback
//! disabled, and cancellation propagate to the orchestrator.

pub mod character;
pub mod concept;
pub mod dialogue;
pub mod imagery;
pub mod integration;
pub mod layout;
pub mod metrics;
pub mod narrative;
pub mod outputs;
pub mod parse;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AgentError, GatewayError};
use crate::gateway::ModelGateway;
use mangaforge_common::{GenerationParameters, ModelConfig};

pub use metrics::{MetricsRegistry, PhaseMetricsSnapshot};
pub use outputs::{PhaseArtifact, PhaseOutput, PhaseOutputs, PhasePreview};
pub use parse::extract_json;

/// Shared dependencies injected into every agent execution.
pub struct AgentDeps {
    pub gateway: Arc<dyn ModelGateway>,
    /// Attempt budget for the model call inside one phase execution.
    pub phase_max_retries: u32,
    /// Backoff base for text retries; the delay is `base * 2^attempt`.
    pub backoff_base: Duration,
    /// Backoff base for image-task retries inside the fan-out engine.
    pub image_backoff_base: Duration,
    /// Image result cache shared across fan-out runs.
    pub image_cache: Arc<Mutex<HashMap<String, crate::fanout::engine::CachedImage>>>,
}

impl AgentDeps {
    pub fn new(gateway: Arc<dyn ModelGateway>) -> Self {
        Self {
            gateway,
            phase_max_retries: 3,
            backoff_base: Duration::from_secs(1),
            image_backoff_base: Duration::from_secs(2),
            image_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry_policy(
        mut self,
        phase_max_retries: u32,
        backoff_base: Duration,
        image_backoff_base: Duration,
    ) -> Self {
        self.phase_max_retries = phase_max_retries;
        self.backoff_base = backoff_base;
        self.image_backoff_base = image_backoff_base;
        self
    }
}

/// Inputs for one phase execution.
pub struct AgentRequest<'a> {
    pub session_id: Uuid,
    pub input_text: &'a str,
    pub previous: &'a PhaseOutputs,
    pub params: &'a GenerationParameters,
    /// HITL feedback injected when the phase re-runs after a rejection.
    pub feedback: Option<&'a Value>,
}

/// What an agent hands back to the orchestrator.
#[derive(Debug)]
pub struct AgentOutcome {
    pub artifact: PhaseArtifact,
    /// True when the model produced the output; false on the fallback path.
    pub ai_assisted: bool,
    /// Transient-failure retries consumed by this execution.
    pub retry_count: u32,
    /// Agent-specific raw scores folded into the quality assessment.
    pub self_scores: BTreeMap<String, f64>,
}

#[async_trait]
pub trait PhaseAgent: Send + Sync {
    fn phase_number(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Deterministic, no I/O. Errors here mean an upstream contract
    /// violation and are never retried.
    fn validate_inputs(&self, req: &AgentRequest<'_>) -> Result<(), Vec<String>>;

    /// Pure function from inputs to the model prompt. The first line is
    /// always `# Phase N: <name>` so backends and logs can route on it.
    fn build_prompt(&self, req: &AgentRequest<'_>) -> String;

    /// Parse an extracted JSON document into the typed output, applying any
    /// agent-specific structural post-checks. `None` triggers the fallback.
    fn parse_output(&self, raw: &Value) -> Option<PhaseOutput>;

    /// Rule-based generator used when the model path fails.
    fn fallback(&self, req: &AgentRequest<'_>) -> PhaseOutput;

    /// Fill mandatory derived fields with neutral defaults. Runs on both
    /// the model and the fallback path.
    fn complete_with_defaults(&self, output: PhaseOutput, _req: &AgentRequest<'_>) -> PhaseOutput {
        output
    }

    /// Schema and structural constraints on the finished output.
    fn validate_output(&self, output: &PhaseOutput) -> Result<(), Vec<String>>;

    fn preview(&self, output: &PhaseOutput) -> PhasePreview;

    /// Small dictionary of raw scores in [0, 1] specific to this phase.
    fn self_scores(&self, _output: &PhaseOutput) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    /// Merge HITL feedback into the artifact metadata. Agents that re-prompt
    /// instead override `build_prompt` to include `req.feedback`.
    fn apply_feedback(&self, artifact: &mut PhaseArtifact, feedback: &Value) {
        artifact.feedback_applied = Some(feedback.clone());
        artifact.revised_at = Some(Utc::now());
    }

    /// Run the shared execution contract.
    async fn execute(
        &self,
        deps: &AgentDeps,
        req: AgentRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let phase = self.phase_number();

        self.validate_inputs(&req)
            .map_err(|errors| AgentError::InputValidation { phase, errors })?;

        let prompt = self.build_prompt(&req);
        let model_config = req.params.model_for(phase);
        let timeout = req.params.timeout_for(phase);

        let (raw_text, retry_count) = invoke_model(
            deps,
            phase,
            &prompt,
            &model_config,
            timeout,
            cancel,
        )
        .await?;

        let structured = raw_text
            .as_deref()
            .and_then(extract_json)
            .and_then(|value| self.parse_output(&value));
        let mut ai_assisted = structured.is_some();

        let output = match structured {
            Some(output) => output,
            None => {
                if !req.params.fallback_enabled {
                    return Err(AgentError::RetryExhausted {
                        phase,
                        attempts: retry_count.max(1),
                    });
                }
                debug!(phase, "model path unusable, running fallback generator");
                self.fallback(&req)
            }
        };

        let mut output = self.complete_with_defaults(output, &req);

        if let Err(errors) = self.validate_output(&output) {
            if ai_assisted && req.params.fallback_enabled {
                warn!(phase, ?errors, "model output failed validation, falling back");
                ai_assisted = false;
                output = self.complete_with_defaults(self.fallback(&req), &req);
                self.validate_output(&output)
                    .map_err(|errors| AgentError::FallbackInvalid { phase, errors })?;
            } else if ai_assisted {
                return Err(AgentError::RetryExhausted {
                    phase,
                    attempts: retry_count.max(1),
                });
            } else {
                return Err(AgentError::FallbackInvalid { phase, errors });
            }
        }

        let preview = self.preview(&output);
        let self_scores = self.self_scores(&output);
        let mut artifact = PhaseArtifact::new(output, preview);
        if let Some(feedback) = req.feedback {
            self.apply_feedback(&mut artifact, feedback);
        }

        Ok(AgentOutcome {
            artifact,
            ai_assisted,
            retry_count,
            self_scores,
        })
    }
}

/// Invoke the text endpoint with a bounded wait and exponential backoff.
///
/// Returns the raw response (or `None` when every attempt failed
/// transiently) plus the number of failed attempts. A timeout counts as one
/// attempt. Only cancellation is an error.
pub(crate) async fn invoke_model(
    deps: &AgentDeps,
    phase: u8,
    prompt: &str,
    config: &ModelConfig,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(Option<String>, u32), AgentError> {
    let attempts = deps.phase_max_retries.max(1);
    let mut retry_count = 0;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled { phase });
        }

        let call = deps.gateway.generate_text(prompt, config, cancel);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(generation)) => {
                if generation.content.trim().is_empty() {
                    retry_count += 1;
                    debug!(phase, attempt, "empty model response");
                } else {
                    return Ok((Some(generation.content), retry_count));
                }
            }
            Ok(Err(GatewayError::Cancelled)) => {
                return Err(AgentError::Cancelled { phase });
            }
            Ok(Err(err)) => {
                retry_count += 1;
                debug!(phase, attempt, error = %err, "transient backend error");
            }
            Err(_elapsed) => {
                retry_count += 1;
                debug!(phase, attempt, timeout_ms = timeout.as_millis() as u64, "model call timed out");
            }
        }

        if attempt + 1 < attempts {
            let delay = deps.backoff_base * 2u32.saturating_pow(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled { phase }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    Ok((None, retry_count))
}

/// The seven agents, indexed by phase number.
pub struct AgentSet {
    agents: Vec<Arc<dyn PhaseAgent>>,
}

impl Default for AgentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentSet {
    pub fn new() -> Self {
        Self {
            agents: vec![
                Arc::new(concept::ConceptAgent),
                Arc::new(character::CharacterAgent),
                Arc::new(narrative::NarrativeAgent),
                Arc::new(layout::LayoutAgent),
                Arc::new(imagery::ImageryAgent),
                Arc::new(dialogue::DialogueAgent),
                Arc::new(integration::IntegrationAgent),
            ],
        }
    }

    pub fn for_phase(&self, phase: u8) -> Option<&Arc<dyn PhaseAgent>> {
        self.agents.get(phase.checked_sub(1)? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StubGateway;

    #[test]
    fn agent_set_covers_all_phases() {
        let set = AgentSet::new();
        for phase in 1..=7u8 {
            let agent = set.for_phase(phase).expect("agent registered");
            assert_eq!(agent.phase_number(), phase);
        }
        assert!(set.for_phase(0).is_none());
        assert!(set.for_phase(8).is_none());
    }

    #[tokio::test]
    async fn invoke_model_counts_timeouts_as_attempts() {
        let gateway = Arc::new(StubGateway::new().with_text_latency(Duration::from_secs(60)));
        let deps = AgentDeps::new(Arc::clone(&gateway) as Arc<dyn ModelGateway>)
            .with_retry_policy(3, Duration::from_millis(1), Duration::from_millis(1));

        let (text, retries) = invoke_model(
            &deps,
            1,
            "# Phase 1: concept analysis",
            &ModelConfig::default(),
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(text.is_none());
        assert_eq!(retries, 3);
        assert_eq!(gateway.text_calls(), 3);
    }

    #[tokio::test]
    async fn invoke_model_returns_content_on_first_success() {
        let gateway = Arc::new(StubGateway::new());
        let deps = AgentDeps::new(Arc::clone(&gateway) as Arc<dyn ModelGateway>);

        let (text, retries) = invoke_model(
            &deps,
            1,
            "# Phase 1: concept analysis",
            &ModelConfig::default(),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(text.unwrap().contains("json"));
        assert_eq!(retries, 0);
    }

    #[tokio::test]
    async fn invoke_model_surfaces_cancellation() {
        let gateway = Arc::new(StubGateway::new());
        let deps = AgentDeps::new(gateway as Arc<dyn ModelGateway>);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = invoke_model(
            &deps,
            2,
            "# Phase 2: character design",
            &ModelConfig::default(),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(err.phase(), 2);
    }
}
