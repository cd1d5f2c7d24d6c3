//! Text chat via `generateContent`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{api_error, get_http_client, GenAiError, API_BASE};
use crate::settings::AppSettings;

/// Reply used when the model returns no text
pub const EMPTY_REPLY: &str = "No response text generated.";

/// Shown in place of a reply when the request fails
pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

/// One prior turn sent as context
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

/// A message in a conversation, as kept by the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: ChatRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_error: bool,
}

impl ChatMessage {
    pub fn new(role: ChatRole, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(ChatRole::Model, text)
        }
    }

    pub fn as_turn(&self) -> ChatTurn {
        ChatTurn {
            role: self.role,
            text: self.text.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    /// Thought summaries are not part of the reply
    #[serde(default)]
    thought: bool,
}

/// Model used for a chat request under `settings`
pub fn chat_model(settings: &AppSettings) -> &str {
    if settings.use_deep_thinking {
        &settings.deep_thinking_model
    } else {
        &settings.chat_model
    }
}

/// Build the `generateContent` body: history, then the new prompt.
pub fn build_request(prompt: &str, settings: &AppSettings, history: &[ChatTurn]) -> Value {
    let mut contents: Vec<Value> = history
        .iter()
        .map(|turn| json!({ "role": turn.role.as_str(), "parts": [{ "text": turn.text }] }))
        .collect();
    contents.push(json!({ "role": "user", "parts": [{ "text": prompt }] }));

    let mut body = json!({
        "contents": contents,
        "systemInstruction": { "parts": [{ "text": settings.chat_system_instruction }] },
    });

    // No maxOutputTokens alongside a thinking budget
    if settings.use_deep_thinking {
        body["generationConfig"] = json!({
            "thinkingConfig": { "thinkingBudget": settings.thinking_budget }
        });
    }

    body
}

/// Concatenated text of the first candidate, or [`EMPTY_REPLY`].
fn reply_text(response: &GenerateContentResponse) -> String {
    let text: String = response
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter(|p| !p.thought)
                .filter_map(|p| p.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        EMPTY_REPLY.to_string()
    } else {
        text
    }
}

/// Send one chat message with `history` as context and return the reply.
pub async fn send_message(
    api_key: &str,
    prompt: &str,
    settings: &AppSettings,
    history: &[ChatTurn],
) -> Result<String, GenAiError> {
    if api_key.is_empty() {
        return Err(GenAiError::MissingApiKey);
    }

    let model = chat_model(settings);
    log::info!(
        "Sending chat message ({} chars, {} turns of history) to {}",
        prompt.len(),
        history.len(),
        model
    );

    let response = get_http_client()
        .post(format!("{}/models/{}:generateContent", API_BASE, model))
        .header("x-goog-api-key", api_key)
        .json(&build_request(prompt, settings, history))
        .send()
        .await
        .map_err(|e| GenAiError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let parsed: GenerateContentResponse = response
        .json()
        .await
        .map_err(|e| GenAiError::ParseError(e.to_string()))?;

    let reply = reply_text(&parsed);
    log::info!("Chat reply: {} chars", reply.len());
    Ok(reply)
}

/// A running conversation. Every exchange sends the messages before it as
/// history, failed exchanges included.
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.messages.iter().map(ChatMessage::as_turn).collect()
    }

    /// Send `text` and record both sides. A failed request is recorded as an
    /// error message rather than returned.
    pub async fn send(&mut self, api_key: &str, text: &str, settings: &AppSettings) -> &ChatMessage {
        let history = self.history();
        self.messages.push(ChatMessage::new(ChatRole::User, text));

        let reply = match send_message(api_key, text, settings, &history).await {
            Ok(reply) => ChatMessage::new(ChatRole::Model, reply),
            Err(e) => {
                log::error!("Chat request failed: {}", e);
                ChatMessage::error(ERROR_REPLY)
            }
        };
        self.messages.push(reply);
        &self.messages[self.messages.len() - 1]
    }
}
