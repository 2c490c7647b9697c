// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use verdict_model::tool::ToolCallError;
use verdict_model::types::{Content, MessageContent};
use verdict_model::{ChatMessage, ToolCall};
use verdict_tools::{Tool, ToolError, ToolRegistry, ToolResult};

use crate::generate::GenerateContext;
use crate::transcript::Event;

/// Execute the tool calls of one assistant message.
///
/// Returns one tool message per call, in call order, each keyed by the
/// originating `tool_call_id` — even when dispatch ran in parallel.
/// Unknown tools and argument failures become tool messages with a parsing
/// error; runtime `ToolError`s become tool messages with their typed
/// error.  Nothing here is fatal to the sample: the model sees every
/// failure and can correct course.
///
/// Calls run in parallel unless `parallel` is false or any called tool is
/// marked serial-only, in which case the whole batch runs serially.
pub async fn execute_tools(
    ctx: &GenerateContext,
    assistant: &ChatMessage,
    tools: &ToolRegistry,
    max_tool_output: Option<usize>,
    parallel: bool,
) -> Vec<ChatMessage> {
    let calls: Vec<ToolCall> = assistant
        .tool_calls()
        .map(|calls| calls.to_vec())
        .unwrap_or_default();
    if calls.is_empty() {
        return Vec::new();
    }

    // phase 1: record a pending event per call, in call order, and
    // pre-resolve everything that can fail before execution
    let mut prepared: Vec<PreparedCall> = Vec::with_capacity(calls.len());
    for call in calls {
        let event_id = ctx.transcript.event(Event::Tool {
            call: call.clone(),
            result: None,
            error: None,
            time: None,
            pending: true,
        });

        let resolution = resolve_call(&call, tools);
        prepared.push(PreparedCall {
            call,
            event_id,
            resolution,
        });
    }

    // a single serial-only tool in the batch forces serial dispatch
    let batch_parallel = parallel
        && prepared.iter().all(|p| match &p.resolution {
            Resolution::Ready { tool, .. } => tool.parallel(),
            Resolution::Failed(_) => true,
        });

    // phase 2: execute
    let outcomes = if batch_parallel {
        let mut handles = Vec::with_capacity(prepared.len());
        for p in &prepared {
            handles.push(match &p.resolution {
                Resolution::Ready { tool, arguments } => {
                    let tool = Arc::clone(tool);
                    let arguments = arguments.clone();
                    Some(tokio::spawn(async move {
                        let started = Instant::now();
                        let result = tool.execute(&arguments).await;
                        (result, started.elapsed().as_secs_f64())
                    }))
                }
                Resolution::Failed(_) => None,
            });
        }
        let mut outcomes = Vec::with_capacity(prepared.len());
        for handle in handles {
            outcomes.push(match handle {
                Some(handle) => Some(match handle.await {
                    Ok(outcome) => outcome,
                    Err(err) => (
                        Err(ToolError::Failed(format!("tool execution panicked: {err}"))),
                        0.0,
                    ),
                }),
                None => None,
            });
        }
        outcomes
    } else {
        let mut outcomes = Vec::with_capacity(prepared.len());
        for p in &prepared {
            outcomes.push(match &p.resolution {
                Resolution::Ready { tool, arguments } => {
                    let started = Instant::now();
                    let result = tool.execute(arguments).await;
                    Some((result, started.elapsed().as_secs_f64()))
                }
                Resolution::Failed(_) => None,
            });
        }
        outcomes
    };

    // phase 3: complete events and build tool messages, in call order
    let mut messages = Vec::with_capacity(prepared.len());
    for (p, outcome) in prepared.into_iter().zip(outcomes) {
        let (content, error, time) = match (&p.resolution, outcome) {
            (Resolution::Failed(error), _) => (
                MessageContent::Text(error.message.clone()),
                Some(error.clone()),
                None,
            ),
            (Resolution::Ready { .. }, Some((Ok(result), time))) => {
                let content = truncate_content(result.into_content(), max_tool_output);
                (content, None, Some(time))
            }
            (Resolution::Ready { .. }, Some((Err(err), time))) => {
                let error = err.to_call_error();
                (
                    MessageContent::Text(error.message.clone()),
                    Some(error),
                    Some(time),
                )
            }
            // resolution ready but no outcome cannot happen; treat as unknown
            (Resolution::Ready { .. }, None) => {
                let error = ToolCallError::unknown("tool did not execute");
                (
                    MessageContent::Text(error.message.clone()),
                    Some(error),
                    None,
                )
            }
        };

        debug!(
            tool = %p.call.function,
            call_id = %p.call.id,
            error = error.is_some(),
            "tool call finished"
        );
        ctx.transcript.event_updated(
            p.event_id,
            Event::Tool {
                call: p.call.clone(),
                result: Some(content.clone()),
                error: error.clone(),
                time,
                pending: false,
            },
        );

        messages.push(ChatMessage::Tool {
            id: Some(uuid::Uuid::new_v4().to_string()),
            content,
            tool_call_id: Some(p.call.id.clone()),
            function: Some(p.call.function.clone()),
            error,
        });
    }
    messages
}

struct PreparedCall {
    call: ToolCall,
    event_id: usize,
    resolution: Resolution,
}

enum Resolution {
    Ready {
        tool: Arc<dyn Tool>,
        arguments: std::collections::BTreeMap<String, serde_json::Value>,
    },
    Failed(ToolCallError),
}

fn resolve_call(call: &ToolCall, tools: &ToolRegistry) -> Resolution {
    if let Some(parse_error) = &call.parse_error {
        return Resolution::Failed(ToolCallError::parsing(parse_error.clone()));
    }
    let Some(tool) = tools.get(&call.function) else {
        return Resolution::Failed(ToolCallError::parsing(format!(
            "Tool not found: {}",
            call.function
        )));
    };
    match verdict_tools::validate_arguments(&tool.parameters_schema(), &call.arguments) {
        Ok(arguments) => Resolution::Ready { tool, arguments },
        Err(err) => Resolution::Failed(err.to_call_error()),
    }
}

/// Truncate oversized text content, keeping head and tail halves with an
/// annotation in the middle.  Non-text parts pass through untouched.
fn truncate_content(content: MessageContent, max_tool_output: Option<usize>) -> MessageContent {
    let Some(max) = max_tool_output else {
        return content;
    };
    if max == 0 {
        return content;
    }
    match content {
        MessageContent::Text(text) if text.len() > max => {
            MessageContent::Text(truncate_text(&text, max))
        }
        MessageContent::Parts(parts) => MessageContent::Parts(
            parts
                .into_iter()
                .map(|part| match part {
                    Content::Text { text } if text.len() > max => Content::Text {
                        text: truncate_text(&text, max),
                    },
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn truncate_text(text: &str, max: usize) -> String {
    let half = max / 2;
    let head_end = text
        .char_indices()
        .take_while(|(i, _)| *i <= half)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail_start = text
        .char_indices()
        .find(|(i, _)| *i >= text.len().saturating_sub(half))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    format!(
        "{}\n...[tool output truncated: {} of {} bytes shown]...\n{}",
        &text[..head_end],
        max,
        text.len(),
        &text[tail_start..]
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes text"
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
            Ok(ToolResult::Text(
                arguments["text"].as_str().unwrap_or_default().to_string(),
            ))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fails"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _arguments: &BTreeMap<String, Value>,
        ) -> Result<ToolResult, ToolError> {
            Err(ToolError::Timeout("took too long".into()))
        }
    }

    struct SlowTool {
        delay: Duration,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps then answers"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(
            &self,
            _arguments: &BTreeMap<String, Value>,
        ) -> Result<ToolResult, ToolError> {
            tokio::time::sleep(self.delay).await;
            Ok(ToolResult::Text("slept".into()))
        }
    }

    fn call_with_text(id: &str, function: &str, text: &str) -> ToolCall {
        let mut call = ToolCall::new(id, function);
        call.arguments.insert("text".into(), json!(text));
        call
    }

    #[tokio::test]
    async fn results_keep_call_order_even_in_parallel() {
        let mut tools = ToolRegistry::new();
        tools.register(SlowTool { delay: Duration::from_millis(30) });
        tools.register(EchoTool);

        // slow first, fast second; results must still arrive in call order
        let assistant = ChatMessage::assistant_with_tool_calls(
            "",
            vec![
                ToolCall::new("c1", "slow"),
                call_with_text("c2", "echo", "fast"),
            ],
        );
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, None, true).await;

        assert_eq!(messages.len(), 2);
        match &messages[0] {
            ChatMessage::Tool { tool_call_id, .. } => {
                assert_eq!(tool_call_id.as_deref(), Some("c1"))
            }
            _ => panic!("expected tool message"),
        }
        match &messages[1] {
            ChatMessage::Tool { tool_call_id, .. } => {
                assert_eq!(tool_call_id.as_deref(), Some("c2"))
            }
            _ => panic!("expected tool message"),
        }
        assert_eq!(messages[1].text(), "fast");
        assert_eq!(ctx.transcript.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_tool_yields_parsing_error_message() {
        let tools = ToolRegistry::new();
        let assistant = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("c1", "frobnicate")],
        );
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, None, true).await;

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ChatMessage::Tool { error: Some(error), .. } => {
                assert_eq!(error.kind, verdict_model::ToolCallErrorKind::Parsing);
                assert_eq!(error.message, "Tool not found: frobnicate");
            }
            other => panic!("expected tool error message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_arguments_yield_parsing_error() {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        // missing required 'text'
        let assistant =
            ChatMessage::assistant_with_tool_calls("", vec![ToolCall::new("c1", "echo")]);
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, None, true).await;
        match &messages[0] {
            ChatMessage::Tool { error: Some(error), .. } => {
                assert_eq!(error.kind, verdict_model::ToolCallErrorKind::Parsing);
                assert!(error.message.contains("text"));
            }
            other => panic!("expected parsing error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provider_parse_error_surfaces_as_parsing() {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let mut call = ToolCall::new("c1", "echo");
        call.parse_error = Some("unbalanced JSON".into());
        let assistant = ChatMessage::assistant_with_tool_calls("", vec![call]);
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, None, true).await;
        match &messages[0] {
            ChatMessage::Tool { error: Some(error), .. } => {
                assert_eq!(error.kind, verdict_model::ToolCallErrorKind::Parsing);
                assert!(error.message.contains("unbalanced"));
            }
            other => panic!("expected parsing error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_tool_error_keeps_its_kind() {
        let mut tools = ToolRegistry::new();
        tools.register(FailingTool);
        let assistant =
            ChatMessage::assistant_with_tool_calls("", vec![ToolCall::new("c1", "fails")]);
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, None, true).await;
        match &messages[0] {
            ChatMessage::Tool { error: Some(error), .. } => {
                assert_eq!(error.kind, verdict_model::ToolCallErrorKind::Timeout);
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
        // the transcript tool event carries the same error
        match &ctx.transcript.events()[0].event {
            Event::Tool { error: Some(error), pending, .. } => {
                assert_eq!(error.kind, verdict_model::ToolCallErrorKind::Timeout);
                assert!(!pending);
            }
            other => panic!("expected tool event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_annotation() {
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let long = "x".repeat(500);
        let assistant = ChatMessage::assistant_with_tool_calls(
            "",
            vec![call_with_text("c1", "echo", &long)],
        );
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, Some(100), true).await;
        let text = messages[0].text();
        assert!(text.contains("truncated"));
        assert!(text.len() < 500);
    }

    #[tokio::test]
    async fn serial_only_tool_forces_serial_batch() {
        struct SerialProbe;
        #[async_trait]
        impl Tool for SerialProbe {
            fn name(&self) -> &str {
                "serial"
            }
            fn description(&self) -> &str {
                "serial-only"
            }
            fn parameters_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            fn parallel(&self) -> bool {
                false
            }
            async fn execute(
                &self,
                _arguments: &BTreeMap<String, Value>,
            ) -> Result<ToolResult, ToolError> {
                Ok(ToolResult::Text("serial ok".into()))
            }
        }

        let mut tools = ToolRegistry::new();
        tools.register(SerialProbe);
        tools.register(EchoTool);
        let assistant = ChatMessage::assistant_with_tool_calls(
            "",
            vec![
                ToolCall::new("c1", "serial"),
                call_with_text("c2", "echo", "after"),
            ],
        );
        let ctx = GenerateContext::bare();
        let messages = execute_tools(&ctx, &assistant, &tools, None, true).await;
        assert_eq!(messages[0].text(), "serial ok");
        assert_eq!(messages[1].text(), "after");
    }

    #[test]
    fn truncate_keeps_head_and_tail() {
        let text = format!("HEAD{}TAIL", "m".repeat(200));
        let out = truncate_text(&text, 40);
        assert!(out.starts_with("HEAD"));
        assert!(out.ends_with("TAIL"));
        assert!(out.contains("truncated"));
    }
}
