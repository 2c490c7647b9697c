// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use verdict_model::{
    tool::{ToolCallError, ToolCallErrorKind},
    types::{Content, MessageContent},
    ToolInfo,
};

/// Error raised by a tool implementation.
///
/// All variants are non-fatal: the tool engine converts them into tool
/// messages so the model sees what went wrong and can correct course.
/// `Parsing` is reserved for argument problems (also produced by the
/// engine itself for unknown tools and schema violations).
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Parsing(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Permission(String),
    #[error("{0}")]
    FileNotFound(String),
    #[error("{0}")]
    IsADirectory(String),
    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn to_call_error(&self) -> ToolCallError {
        let (kind, message) = match self {
            Self::Parsing(m) => (ToolCallErrorKind::Parsing, m),
            Self::Timeout(m) => (ToolCallErrorKind::Timeout, m),
            Self::Permission(m) => (ToolCallErrorKind::Permission, m),
            Self::FileNotFound(m) => (ToolCallErrorKind::FileNotFound, m),
            Self::IsADirectory(m) => (ToolCallErrorKind::IsADirectory, m),
            Self::Failed(m) => (ToolCallErrorKind::Unknown, m),
        };
        ToolCallError::new(kind, message.clone())
    }
}

/// The value returned by a successful tool execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    Text(String),
    Number(f64),
    Bool(bool),
    Parts(Vec<Content>),
}

impl ToolResult {
    /// Render into message content for the tool message.
    pub fn into_content(self) -> MessageContent {
        match self {
            Self::Text(t) => MessageContent::Text(t),
            Self::Number(n) => MessageContent::Text(n.to_string()),
            Self::Bool(b) => MessageContent::Text(b.to_string()),
            Self::Parts(parts) => MessageContent::Parts(parts),
        }
    }
}

impl From<String> for ToolResult {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for ToolResult {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Trait implemented by every tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Whether this tool may be dispatched in parallel with others in the
    /// same assistant turn.  A single serial-only tool (e.g. a stateful
    /// browser) forces the whole batch serial.
    fn parallel(&self) -> bool {
        true
    }

    /// Transform a historical tool-result message before it is sent to the
    /// model.  `index`/`total` count this tool's result messages in
    /// conversation order.  Return `None` to leave the content untouched.
    /// Used by screenshot-heavy tools to drop images past a recency window.
    fn model_input(
        &self,
        _index: usize,
        _total: usize,
        _content: &MessageContent,
    ) -> Option<MessageContent> {
        None
    }

    /// Execute the tool with validated arguments.
    async fn execute(
        &self,
        arguments: &BTreeMap<String, Value>,
    ) -> Result<ToolResult, ToolError>;

    /// The schema handed to the model.
    fn info(&self) -> ToolInfo {
        ToolInfo::new(self.name(), self.description(), self.parameters_schema())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }
        async fn execute(
            &self,
            arguments: &BTreeMap<String, Value>,
        ) -> Result<ToolResult, ToolError> {
            let text = arguments
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::Parsing("missing 'text'".into()))?;
            Ok(ToolResult::Text(text.to_string()))
        }
    }

    #[tokio::test]
    async fn execute_returns_text_result() {
        let mut args = BTreeMap::new();
        args.insert("text".to_string(), json!("hi"));
        let result = EchoTool.execute(&args).await.unwrap();
        assert_eq!(result, ToolResult::Text("hi".into()));
    }

    #[test]
    fn tool_defaults_to_parallel() {
        assert!(EchoTool.parallel());
        assert!(EchoTool.model_input(0, 1, &MessageContent::Text("x".into())).is_none());
    }

    #[test]
    fn info_carries_schema() {
        let info = EchoTool.info();
        assert_eq!(info.name, "echo");
        assert!(info.parameters["required"][0] == json!("text"));
    }

    #[test]
    fn tool_error_maps_to_call_error_kinds() {
        assert_eq!(
            ToolError::Timeout("slow".into()).to_call_error().kind,
            ToolCallErrorKind::Timeout
        );
        assert_eq!(
            ToolError::Failed("boom".into()).to_call_error().kind,
            ToolCallErrorKind::Unknown
        );
        assert_eq!(
            ToolError::Parsing("bad".into()).to_call_error().message,
            "bad"
        );
    }

    #[test]
    fn result_renders_scalars_as_text() {
        assert_eq!(
            ToolResult::Number(4.0).into_content(),
            MessageContent::Text("4".into())
        );
        assert_eq!(
            ToolResult::Bool(true).into_content(),
            MessageContent::Text("true".into())
        );
    }
}
