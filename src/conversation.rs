use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -- Identifiers ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// -- Messages ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A web source cited by an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Source {
    pub fn new(title: impl Into<String>, url: impl Into<String>, snippet: Option<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            snippet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    /// `None` until the refusal check has run on a finished turn.
    #[serde(default)]
    pub censored: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, text.into())
    }

    fn with_role(role: Role, text: String) -> Self {
        Self {
            id: MessageId::new(),
            role,
            text,
            sources: Vec::new(),
            censored: None,
            created_at: Utc::now(),
        }
    }

    /// True for assistant turns whose text is a surfaced generation error.
    pub fn is_error(&self) -> bool {
        self.role == Role::Assistant && self.text.starts_with("Error: ")
    }

    pub fn is_censored(&self) -> bool {
        self.censored == Some(true)
    }
}

// -- Conversation -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        let title = title.into();
        Self {
            id: ConversationId::new(),
            title: if title.trim().is_empty() {
                "New Conversation".to_string()
            } else {
                title
            },
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.messages.push(message);
        id
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Index of the assistant message with the given id.
    pub fn assistant_position(&self, id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.id == id && m.role == Role::Assistant)
    }

    /// The user message immediately preceding `index`, if any.
    pub fn prompt_before(&self, index: usize) -> Option<&Message> {
        self.messages[..index.min(self.messages.len())]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// The last `n` messages, excluding empty turns.
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let filled: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| !m.text.trim().is_empty())
            .collect();
        let skip = filled.len().saturating_sub(n);
        filled.into_iter().skip(skip).cloned().collect()
    }

    /// Serialize the conversation as an OpenAI-style `[{role, content}]` array.
    pub fn to_json(&self) -> serde_json::Value {
        messages_json(None, &self.messages)
    }
}

/// Build an OpenAI-style chat array, optionally led by a system message.
pub fn messages_json(system: Option<&str>, messages: &[Message]) -> serde_json::Value {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        out.push(serde_json::json!({ "role": "system", "content": system }));
    }
    for m in messages {
        out.push(serde_json::json!({ "role": m.role.as_str(), "content": m.text }));
    }
    serde_json::Value::Array(out)
}
