//! HTTP implementation of the model gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{ImageGeneration, ImageRequest, ModelGateway, TextGeneration, TokenUsage};
use crate::errors::GatewayError;
use mangaforge_common::ModelConfig;

/// Default outer HTTP timeout. Phase-level timeouts are tighter and enforced
/// by the orchestrator; this only guards against wedged connections.
const HTTP_TIMEOUT_SECS: u64 = 60;

pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct TextResponse {
    text: String,
    #[serde(default)]
    usage: UsageBody,
}

#[derive(Deserialize, Default)]
struct UsageBody {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ImageResponse {
    url: String,
    #[serde(default)]
    thumbnail_url: String,
    #[serde(default)]
    quality: f64,
}

impl HttpGateway {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| GatewayError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> GatewayError {
        if status.as_u16() == 429 {
            GatewayError::RateLimited
        } else {
            GatewayError::Backend(format!("{}: {}", status, body))
        }
    }

    fn classify_transport(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Backend(err.to_string())
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            res = request => res.map_err(Self::classify_transport)?,
        };

        let status = response.status();
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            body = response.text() => body.map_err(Self::classify_transport)?,
        };

        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }
        if text.trim().is_empty() {
            return Err(GatewayError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl ModelGateway for HttpGateway {
    async fn generate_text(
        &self,
        prompt: &str,
        config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<TextGeneration, GatewayError> {
        let body = json!({
            "model": config.model_id,
            "prompt": prompt,
            "temperature": config.temperature,
            "top_p": config.top_p,
            "top_k": config.top_k,
            "max_tokens": config.max_tokens,
        });
        let raw = self.post_json("/v1/text:generate", body, cancel).await?;
        let parsed: TextResponse =
            serde_json::from_str(&raw).map_err(|e| GatewayError::Backend(e.to_string()))?;
        if parsed.text.trim().is_empty() {
            return Err(GatewayError::EmptyResponse);
        }
        Ok(TextGeneration {
            content: parsed.text,
            tokens: TokenUsage {
                input: parsed.usage.input_tokens,
                output: parsed.usage.output_tokens,
                total: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn generate_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<ImageGeneration, GatewayError> {
        let body = json!({
            "prompt": request.prompt,
            "negative_prompt": request.negative_prompt,
            "style": request.style_parameters,
        });
        let raw = self.post_json("/v1/images:generate", body, cancel).await?;
        let parsed: ImageResponse =
            serde_json::from_str(&raw).map_err(|e| GatewayError::Backend(e.to_string()))?;
        Ok(ImageGeneration {
            image_url: parsed.url,
            thumbnail_url: parsed.thumbnail_url,
            quality: parsed.quality,
        })
    }
}
