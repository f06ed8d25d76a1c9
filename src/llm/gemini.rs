use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::{ParleyError, Result};
use crate::llm::typing::typing_effect;
use crate::llm::{prompts, BackendAdapter, BackendKind, GenerationRequest, TokenStream};

/// Remote fallback backed by the Gemini `generateContent` REST API.
///
/// The API is called without streaming; the reply is replayed word by word
/// so callers see the same incremental contract as every other backend.
pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    typing_delay: Duration,
}

// -- Request/response types ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_k: u32,
    top_p: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GeminiAdapter {
    pub fn new(config: &RemoteConfig, typing_delay: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ParleyError::Config(format!("failed to create HTTP client: {e}")))?;

        info!(
            model = %config.model,
            base_url = %config.base_url,
            has_key = !config.api_key.is_empty(),
            "Gemini adapter initialized"
        );

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            typing_delay,
        })
    }

    /// One non-streaming call; returns the full reply text.
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let prompt = prompts::history_prefixed(request);

        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: request.sampling.temperature,
                top_k: request.sampling.top_k,
                top_p: request.sampling.top_p,
                max_output_tokens: request.sampling.max_tokens,
            },
        };

        debug!(model = %self.model, "invoking Gemini API");

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| ParleyError::GenerationFailed(format!("Gemini request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Gemini API error");
            return Err(ParleyError::GenerationFailed(format!(
                "Gemini API returned {status}: {error_text}"
            )));
        }

        let parsed: GenerateResponse = resp.json().await.map_err(|e| {
            ParleyError::GenerationFailed(format!("failed to parse Gemini response: {e}"))
        })?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| {
                ParleyError::GenerationFailed("Gemini response had no candidates".into())
            })?;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(ParleyError::EmptyResponse);
        }

        info!(response_len = text.len(), model = %self.model, "Gemini response received");
        Ok(text)
    }
}

#[async_trait::async_trait]
impl BackendAdapter for GeminiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::RemoteApi
    }

    fn name(&self) -> &str {
        "Gemini API"
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        if self.api_key.is_empty() {
            return Err(ParleyError::BackendUnavailable(
                "Gemini API key not configured (set GEMINI_API_KEY or remote.api_key)".into(),
            ));
        }

        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Box::pin(futures::stream::empty())),
            result = self.complete(request) => result?,
        };

        Ok(typing_effect(text, self.typing_delay, cancel.clone()))
    }
}
