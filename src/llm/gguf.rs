use llama_gguf::{ChatEngine, Engine, EngineConfig};
use tracing::{debug, info};

use crate::error::{ParleyError, Result};
use crate::llm::context::SamplingParams;
use crate::llm::local::{InferenceOptions, InferenceRuntime, LoadedModel, ModelSpec};

/// Embedded runtime backed by llama-gguf.
///
/// Sampling and the system prompt are fixed when the engine is loaded, so
/// the values passed here are the ones every generation uses.
pub struct GgufRuntime {
    sampling: SamplingParams,
    system_prompt: String,
}

impl GgufRuntime {
    pub fn new(sampling: SamplingParams, system_prompt: impl Into<String>) -> Self {
        Self {
            sampling,
            system_prompt: system_prompt.into(),
        }
    }

    /// System prompt handed to the chat engine; `None` when blank.
    fn chat_system_prompt(&self) -> Option<String> {
        let prompt = self.system_prompt.trim();
        (!prompt.is_empty()).then(|| prompt.to_string())
    }
}

struct GgufModel {
    chat: ChatEngine,
}

impl InferenceRuntime for GgufRuntime {
    fn init(&self, spec: &ModelSpec, progress: &mut dyn FnMut(f32)) -> Result<Box<dyn LoadedModel>> {
        let engine_config = EngineConfig {
            model_path: spec.path.to_string_lossy().into_owned(),
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            max_tokens: self.sampling.max_tokens as usize,
            ..Default::default()
        };

        progress(0.0);
        let engine = Engine::load(engine_config)
            .map_err(|e| ParleyError::GenerationFailed(format!("failed to load GGUF model: {e}")))?;
        progress(1.0);

        info!(
            chat_template = ?engine.chat_template(),
            vocab_size = engine.model_config().vocab_size,
            max_seq_len = engine.model_config().max_seq_len,
            context_size = spec.context_size,
            "GGUF model loaded"
        );

        Ok(Box::new(GgufModel {
            chat: ChatEngine::new(engine, self.chat_system_prompt()),
        }))
    }
}

impl LoadedModel for GgufModel {
    fn generate(
        &mut self,
        messages_json: &str,
        _options: &InferenceOptions,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let messages: serde_json::Value = serde_json::from_str(messages_json)?;

        // The chat engine keeps its own history in the KV cache; only the
        // newest user turn is fed.
        let prompt = messages
            .as_array()
            .and_then(|all| {
                all.iter()
                    .rev()
                    .find(|m| m["role"] == "user")
                    .and_then(|m| m["content"].as_str())
            })
            .ok_or_else(|| ParleyError::GenerationFailed("no user message to answer".into()))?
            .to_string();

        debug!(prompt_len = prompt.len(), "running GGUF inference");

        let response = self
            .chat
            .chat(&prompt)
            .map_err(|e| ParleyError::GenerationFailed(format!("local inference failed: {e}")))?;

        if !response.is_empty() {
            on_token(&response);
        }
        Ok(())
    }
}
