// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Stop,
    MaxTokens,
    ModelLength,
    ToolCalls,
    ContentFilter,
    Unknown,
}

/// Token usage reported by a provider for one generate call.
///
/// Addition is component-wise; optional fields add when either side is set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens_cache_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens_cache_write: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl ModelUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }
}

fn add_opt<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x + y),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

impl std::ops::Add for ModelUsage {
    type Output = ModelUsage;

    fn add(self, rhs: ModelUsage) -> ModelUsage {
        ModelUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
            input_tokens_cache_read: add_opt(
                self.input_tokens_cache_read,
                rhs.input_tokens_cache_read,
            ),
            input_tokens_cache_write: add_opt(
                self.input_tokens_cache_write,
                rhs.input_tokens_cache_write,
            ),
            total_cost: add_opt(self.total_cost, rhs.total_cost),
        }
    }
}

impl std::ops::AddAssign for ModelUsage {
    fn add_assign(&mut self, rhs: ModelUsage) {
        *self = *self + rhs;
    }
}

/// One completion alternative from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChoice {
    pub message: ChatMessage,
    #[serde(default)]
    pub stop_reason: StopReason,
}

/// The result of one generate call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelOutput {
    /// Model identifier as reported by the provider.
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
    /// Seconds spent on the successful provider request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Provider-reported non-fatal error annotation (e.g. content filter).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelOutput {
    /// An output with a single assistant text message.
    pub fn from_content(model: impl Into<String>, content: impl Into<String>) -> Self {
        let model = model.into();
        let mut message = ChatMessage::assistant(content);
        if let ChatMessage::Assistant { model: m, .. } = &mut message {
            *m = Some(model.clone());
        }
        Self {
            model,
            choices: vec![ChatCompletionChoice {
                message,
                stop_reason: StopReason::Stop,
            }],
            usage: None,
            time: None,
            error: None,
        }
    }

    /// An output whose assistant message requests the given tool call.
    pub fn for_tool_call(
        model: impl Into<String>,
        call: crate::tool::ToolCall,
    ) -> Self {
        let model = model.into();
        let mut message = ChatMessage::assistant_with_tool_calls("", vec![call]);
        if let ChatMessage::Assistant { model: m, .. } = &mut message {
            *m = Some(model.clone());
        }
        Self {
            model,
            choices: vec![ChatCompletionChoice {
                message,
                stop_reason: StopReason::ToolCalls,
            }],
            usage: None,
            time: None,
            error: None,
        }
    }

    /// The message of the first choice.
    ///
    /// Generate never returns an output without at least one choice; an
    /// empty-choice output is treated as an empty assistant message.
    pub fn message(&self) -> ChatMessage {
        self.choices
            .first()
            .map(|c| c.message.clone())
            .unwrap_or_else(|| ChatMessage::assistant(""))
    }

    pub fn stop_reason(&self) -> StopReason {
        self.choices
            .first()
            .map(|c| c.stop_reason)
            .unwrap_or(StopReason::Unknown)
    }

    /// Plain text of the first choice's message.
    pub fn completion(&self) -> String {
        self.choices
            .first()
            .map(|c| c.message.text())
            .unwrap_or_default()
    }

    pub fn with_usage(mut self, usage: ModelUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_addition_is_component_wise() {
        let a = ModelUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
            input_tokens_cache_read: Some(3),
            input_tokens_cache_write: None,
            total_cost: Some(0.5),
        };
        let b = ModelUsage {
            input_tokens: 1,
            output_tokens: 2,
            total_tokens: 3,
            input_tokens_cache_read: None,
            input_tokens_cache_write: Some(7),
            total_cost: Some(0.25),
        };
        let sum = a + b;
        assert_eq!(sum.input_tokens, 11);
        assert_eq!(sum.output_tokens, 7);
        assert_eq!(sum.total_tokens, 18);
        assert_eq!(sum.input_tokens_cache_read, Some(3));
        assert_eq!(sum.input_tokens_cache_write, Some(7));
        assert_eq!(sum.total_cost, Some(0.75));
    }

    #[test]
    fn usage_new_totals_tokens() {
        let u = ModelUsage::new(60, 40);
        assert_eq!(u.total_tokens, 100);
    }

    #[test]
    fn from_content_has_single_stop_choice() {
        let out = ModelOutput::from_content("mock/model", "ANSWER: 42");
        assert_eq!(out.choices.len(), 1);
        assert_eq!(out.stop_reason(), StopReason::Stop);
        assert_eq!(out.completion(), "ANSWER: 42");
    }

    #[test]
    fn for_tool_call_sets_tool_calls_stop_reason() {
        let call = crate::tool::ToolCall::new("c1", "bash");
        let out = ModelOutput::for_tool_call("mock/model", call);
        assert_eq!(out.stop_reason(), StopReason::ToolCalls);
        assert_eq!(out.message().tool_calls().unwrap().len(), 1);
    }

    #[test]
    fn empty_choices_yield_empty_message() {
        let out = ModelOutput {
            model: "m".into(),
            choices: vec![],
            usage: None,
            time: None,
            error: None,
        };
        assert_eq!(out.completion(), "");
        assert_eq!(out.stop_reason(), StopReason::Unknown);
    }

    #[test]
    fn output_round_trips_through_json() {
        let out = ModelOutput::from_content("m", "hi").with_usage(ModelUsage::new(1, 2));
        let json = serde_json::to_string(&out).unwrap();
        let back: ModelOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, out);
    }
}
