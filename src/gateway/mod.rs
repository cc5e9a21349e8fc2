//! Thin adapter in front of the external generative backend.
//!
//! The trait is transport-agnostic: [`HttpGateway`] speaks JSON over HTTP
//! to a real backend, [`StubGateway`] is a deterministic in-process stand-in
//! for development and tests. Gateways return errors, never panic, and
//! observe the shared cancellation token at every suspension point.

pub mod http;
pub mod stub;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::errors::GatewayError;
use mangaforge_common::ModelConfig;

pub use http::HttpGateway;
pub use stub::StubGateway;

/// Token accounting for one text generation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

/// Successful text generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextGeneration {
    pub content: String,
    pub tokens: TokenUsage,
}

/// One image request: the prompt triple that also forms the cache identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub style_parameters: BTreeMap<String, String>,
}

/// Successful image generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGeneration {
    pub image_url: String,
    pub thumbnail_url: String,
    pub quality: f64,
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate_text(
        &self,
        prompt: &str,
        config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<TextGeneration, GatewayError>;

    async fn generate_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<ImageGeneration, GatewayError>;
}
