use thiserror::Error;

use crate::conversation::{ConversationId, MessageId};

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A backend's prerequisite (model, API key, platform capability) is not met.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("missing API key for {0}")]
    MissingApiKey(String),

    #[error("invalid API key for {0}")]
    InvalidApiKey(String),

    #[error("server error: HTTP {0}")]
    ServerError(u16),

    #[error("no assistant message with id {0}")]
    TargetNotFound(MessageId),

    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("backend returned an empty response")]
    EmptyResponse,
}

impl ParleyError {
    /// Text shown in place of the assistant turn when generation fails.
    pub fn display_text(&self) -> String {
        match self {
            ParleyError::Timeout(detail) => format!("Error: {detail}"),
            ParleyError::GenerationFailed(detail) => format!("Error: {detail}"),
            other => format!("Error: {other}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
