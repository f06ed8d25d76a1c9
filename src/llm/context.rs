use crate::config::SamplingConfig;
use crate::conversation::Message;
use crate::llm::BackendKind;

/// Sampling parameters forwarded to every backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingConfig::default().into()
    }
}

impl From<SamplingConfig> for SamplingParams {
    fn from(c: SamplingConfig) -> Self {
        Self {
            temperature: c.temperature,
            top_k: c.top_k,
            top_p: c.top_p,
            max_tokens: c.max_tokens,
        }
    }
}

/// Per-call generation input, built once per send or regenerate.
///
/// `conversation_snapshot` holds the prior turns only; `user_input` is the
/// (possibly augmented) prompt being answered.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_snapshot: Vec<Message>,
    pub user_input: String,
    pub system_prompt: String,
    pub backend: BackendKind,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    /// A request with no history, used by tests and one-shot calls.
    pub fn single(user_input: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            conversation_snapshot: Vec::new(),
            user_input: user_input.into(),
            system_prompt: String::new(),
            backend,
            sampling: SamplingParams::default(),
        }
    }
}
