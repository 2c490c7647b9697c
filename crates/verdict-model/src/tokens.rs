// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use crate::types::{ChatMessage, Content, MessageContent};

/// Character-based token estimate for plain text (chars/4, minimum 1).
pub fn count_text_tokens(text: &str) -> u64 {
    ((text.len() / 4) as u64).max(1)
}

/// Conservative token estimate for a non-text content part.
///
/// Images follow the detail-level convention (85 tokens for `"low"`,
/// 765 otherwise); audio is a flat conservative constant.  Reasoning
/// counts only its summary — the body may be redacted or encrypted and
/// replay behavior varies by provider.
pub fn count_media_tokens(content: &Content) -> u64 {
    match content {
        Content::Text { text } => count_text_tokens(text),
        Content::Image { detail, .. } => {
            if detail.as_deref() == Some("low") {
                85
            } else {
                765
            }
        }
        Content::Audio { .. } => 1000,
        Content::Reasoning { summary, .. } => summary
            .as_deref()
            .map(count_text_tokens)
            .unwrap_or(0),
    }
}

/// Estimate tokens for a whole message using the given text counter.
///
/// Assistant tool calls contribute their function name plus the JSON
/// rendering of their arguments.
pub fn count_message_tokens(
    message: &ChatMessage,
    count_text: impl Fn(&str) -> u64,
) -> u64 {
    let mut total = match message.content() {
        MessageContent::Text(text) => count_text(text),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                Content::Text { text } => count_text(text),
                other => count_media_tokens(other),
            })
            .sum(),
    };

    if let Some(calls) = message.tool_calls() {
        for call in calls {
            total += count_text(&call.function);
            let args = serde_json::to_string(&call.arguments).unwrap_or_default();
            total += count_text(&args);
        }
    }

    total.max(1)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
