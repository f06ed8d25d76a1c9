use crate::conversation::{messages_json, Role};
use crate::llm::GenerationRequest;

/// Flatten a request into one prompt string for backends that take a single
/// text input (remote API, shortcut handshake).
///
/// With no system prompt and no history the user input is passed through
/// unchanged.
pub fn history_prefixed(request: &GenerationRequest) -> String {
    if request.system_prompt.is_empty() && request.conversation_snapshot.is_empty() {
        return request.user_input.clone();
    }

    let mut out = String::new();
    if !request.system_prompt.is_empty() {
        out.push_str(&request.system_prompt);
        out.push_str("\n\n");
    }

    for message in &request.conversation_snapshot {
        let label = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(label);
        out.push_str(": ");
        out.push_str(message.text.trim());
        out.push('\n');
    }

    out.push_str("User: ");
    out.push_str(&request.user_input);
    out.push_str("\nAssistant:");
    out
}

/// OpenAI-style message array: system, prior turns, then the user input.
pub fn chat_messages(request: &GenerationRequest) -> serde_json::Value {
    let mut value = messages_json(Some(&request.system_prompt), &request.conversation_snapshot);
    if let Some(arr) = value.as_array_mut() {
        arr.push(serde_json::json!({ "role": "user", "content": request.user_input }));
    }
    value
}
