use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolCallError};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Images and audio are represented as data URLs (`data:<mime>;base64,<b64>`)
/// or HTTPS URLs for providers that accept remote references.  Reasoning
/// parts hold the model's thinking output; providers decide whether these
/// are replayed in subsequent requests (see `ReasoningHistory`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        image: String,
        /// Vision detail level: `"low"`, `"high"`, or `"auto"`.
        ///
        /// `"low"` is a fixed 85-token cost regardless of image size;
        /// anything else is estimated at 765 tokens.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Audio {
        audio: String,
        /// Container format, e.g. `"wav"` or `"mp3"`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Reasoning {
        reasoning: String,
        /// Provider marked this block as redacted/encrypted; only the
        /// summary (if any) is countable.
        #[serde(default)]
        redacted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image: impl Into<String>) -> Self {
        Self::Image {
            image: image.into(),
            detail: None,
        }
    }

    pub fn image_with_detail(image: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Image {
            image: image.into(),
            detail: Some(detail.into()),
        }
    }

    pub fn reasoning(reasoning: impl Into<String>) -> Self {
        Self::Reasoning {
            reasoning: reasoning.into(),
            redacted: false,
            summary: None,
        }
    }
}

/// The content payload of a message – either a plain string or an ordered
/// sequence of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Content>),
}

impl MessageContent {
    /// Plain text of this content; multi-part content concatenates its
    /// text parts (reasoning and media are omitted).
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Content::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn parts(&self) -> Vec<Content> {
        match self {
            Self::Text(t) => vec![Content::text(t.clone())],
            Self::Parts(parts) => parts.clone(),
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, Content::Image { .. })))
    }

    pub fn has_reasoning(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, Content::Reasoning { .. })))
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

// ─── Chat messages ────────────────────────────────────────────────────────────

fn message_id() -> Option<String> {
    Some(uuid::Uuid::new_v4().to_string())
}

/// A single message in a model conversation.
///
/// Tagged union over the four roles.  Assistant messages may carry tool
/// calls; tool messages carry the id and function of the call they answer
/// plus an optional typed error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System {
        #[serde(default = "message_id")]
        id: Option<String>,
        content: MessageContent,
    },
    User {
        #[serde(default = "message_id")]
        id: Option<String>,
        content: MessageContent,
        /// Set when this user message was fabricated to carry images pulled
        /// out of tool results for providers that reject them there.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_call_ids: Vec<String>,
    },
    Assistant {
        #[serde(default = "message_id")]
        id: Option<String>,
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        /// Model that produced this message (for multi-model transcripts).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Tool {
        #[serde(default = "message_id")]
        id: Option<String>,
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolCallError>,
    },
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            id: message_id(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            id: message_id(),
            content: MessageContent::Text(text.into()),
            tool_call_ids: Vec::new(),
        }
    }

    pub fn user_with_parts(parts: Vec<Content>) -> Self {
        Self::User {
            id: message_id(),
            content: MessageContent::Parts(parts),
            tool_call_ids: Vec::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            id: message_id(),
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            model: None,
        }
    }

    pub fn assistant_with_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            id: message_id(),
            content: MessageContent::Text(text.into()),
            tool_calls: Some(calls),
            model: None,
        }
    }

    pub fn tool(
        tool_call_id: impl Into<String>,
        function: impl Into<String>,
        content: impl Into<MessageContent>,
    ) -> Self {
        Self::Tool {
            id: message_id(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            function: Some(function.into()),
            error: None,
        }
    }

    pub fn tool_error(
        tool_call_id: impl Into<String>,
        function: impl Into<String>,
        error: ToolCallError,
    ) -> Self {
        Self::Tool {
            id: message_id(),
            content: MessageContent::Text(error.message.clone()),
            tool_call_id: Some(tool_call_id.into()),
            function: Some(function.into()),
            error: Some(error),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::System { id, .. }
            | Self::User { id, .. }
            | Self::Assistant { id, .. }
            | Self::Tool { id, .. } => id.as_deref(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    pub fn content(&self) -> &MessageContent {
        match self {
            Self::System { content, .. }
            | Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    pub fn content_mut(&mut self) -> &mut MessageContent {
        match self {
            Self::System { content, .. }
            | Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    /// Plain-text rendering of the message content.
    pub fn text(&self) -> String {
        self.content().as_text()
    }

    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls.as_deref(),
            _ => None,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Self::Assistant { .. })
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Self::Tool { .. })
    }
}

/// Collapse runs of consecutive messages of the given role into one message.
///
/// Some providers reject histories that violate strict role alternation.
/// Text contents are joined with a blank line; part lists are concatenated.
pub fn collapse_consecutive(messages: Vec<ChatMessage>, role: &str) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        let collapsible = message.role() == role
            && out.last().map(|m: &ChatMessage| m.role()) == Some(role)
            // never merge tool-calling assistants; the calls anchor results
            && message.tool_calls().is_none()
            && out.last().and_then(|m| m.tool_calls()).is_none();
        if collapsible {
            let last = out.last_mut().unwrap();
            let merged = merge_content(last.content(), message.content());
            *last.content_mut() = merged;
        } else {
            out.push(message);
        }
    }
    out
}

fn merge_content(a: &MessageContent, b: &MessageContent) -> MessageContent {
    match (a, b) {
        (MessageContent::Text(x), MessageContent::Text(y)) => {
            MessageContent::Text(format!("{x}\n\n{y}"))
        }
        _ => {
            let mut parts = a.parts();
            parts.extend(b.parts());
            MessageContent::Parts(parts)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
