//! Common types used throughout the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Maximum number of characters WeChat accepts in a single text message.
pub const MAX_MESSAGE_CHARS: usize = 600;

/// Role of a message in a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message from the chat user
    User,
    /// Operator-provided instructions
    System,
}

/// WeChat `MsgType` of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    Video,
    ShortVideo,
    Location,
    Link,
    Event,
    #[strum(default)]
    Other(String),
}

/// A message received from the webhook, already decrypted and parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// OpenID of the user who sent the message
    pub source_user_id: String,
    /// Account the message was sent to
    pub target_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub received_at: DateTime<Utc>,
    pub msg_id: Option<String>,
}

impl InboundMessage {
    /// Text to relay, if this message carries any.
    pub fn text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text if !self.content.trim().is_empty() => Some(self.content.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Body of a chat completion call.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(
        model: &str,
        system_prompt: Option<&str>,
        prompt: &str,
        temperature: f32,
    ) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = system_prompt {
            messages.push(ChatMessage {
                role: MessageRole::System,
                content: system_prompt.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: MessageRole::User,
            content: prompt.to_string(),
        });

        Self {
            model: model.to_string(),
            messages,
            temperature,
        }
    }
}

/// Failure classes surfaced by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Network,
    Upstream,
    ResponseShape,
    Timeout,
    Signature,
    Config,
    Crypto,
    MessageFormat,
}

impl ErrorKind {
    /// Fallback text shown to the chat user for this kind of failure.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::Auth => "Sorry, I could not authenticate with WeChat. Please try again later.",
            ErrorKind::Network => {
                "Sorry, I'm having network issues. Please try again in a moment."
            }
            ErrorKind::Upstream => {
                "Sorry, the AI service is experiencing issues right now. Please try again later."
            }
            ErrorKind::ResponseShape => {
                "Sorry, I received an unexpected response from the AI service. Please try again."
            }
            ErrorKind::Timeout => "Request timed out, please retry later.",
            ErrorKind::Signature => "Invalid signature",
            ErrorKind::Config => {
                "Sorry, there's a configuration issue on my end. Please contact the administrator."
            }
            ErrorKind::Crypto | ErrorKind::MessageFormat => {
                "Sorry, I could not read that message."
            }
        }
    }
}

/// Outcome of asking the completion API for a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    Success(String),
    Failure { kind: ErrorKind, detail: String },
}

impl CompletionResult {
    /// Text to deliver to the user. Failures become a fallback message; the
    /// detail is only meant for logs.
    pub fn display_text(&self) -> &str {
        match self {
            CompletionResult::Success(text) => text,
            CompletionResult::Failure { kind, .. } => kind.user_message(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionResult::Success(_))
    }
}

/// Result of pushing a reply to the user. Logged, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub used_fallback: bool,
}

impl DeliveryOutcome {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error: None,
            used_fallback: false,
        }
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
