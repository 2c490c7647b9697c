// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::GenerateConfig,
    output::{ModelOutput, ModelUsage},
    tokens,
    tool::{ToolChoice, ToolInfo},
    types::{ChatMessage, Content},
};

/// Which assistant reasoning blocks are replayed to the provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningHistory {
    /// Strip all reasoning content from the history.
    None,
    /// Keep reasoning on every assistant message.
    All,
    /// Keep reasoning only on the most recent assistant message.
    Last,
}

/// Contract implemented by each model provider.
///
/// The engine owns retries, caching, concurrency, and history shaping;
/// a provider only turns one normalized request into one `ModelOutput`.
/// Every policy knob has a conservative default so that a minimal provider
/// implements `model_name` and `generate` alone.
#[async_trait]
pub trait ModelApi: Send + Sync {
    /// Model identifier forwarded to the provider API.
    fn model_name(&self) -> &str;

    /// Endpoint base URL, when meaningful for this provider.  Participates
    /// in the cache fingerprint.
    fn base_url(&self) -> Option<&str> {
        None
    }

    /// Execute one generate request.
    async fn generate(
        &self,
        input: &[ChatMessage],
        tools: &[ToolInfo],
        tool_choice: &ToolChoice,
        config: &GenerateConfig,
    ) -> anyhow::Result<ModelOutput>;

    /// Default `max_tokens` for this model when config does not set one.
    fn max_tokens(&self) -> Option<u64> {
        None
    }

    /// Default concurrent connection limit for this endpoint.
    fn max_connections(&self) -> usize {
        10
    }

    /// Scope within which `max_connections` is enforced.  Providers that
    /// authenticate per account should return something derived from the
    /// API key so distinct accounts get distinct connection budgets.
    fn connection_key(&self) -> String {
        "default".to_string()
    }

    /// Whether `err` is transient (429, 5xx, connection reset, ...) and the
    /// attempt should be retried with backoff.
    fn should_retry(&self, _err: &anyhow::Error) -> bool {
        false
    }

    /// Whether `err` is an authentication failure.  With an API-key
    /// override hook configured, auth failures are retried once after the
    /// client is closed and reinitialized.
    fn is_auth_failure(&self, _err: &anyhow::Error) -> bool {
        false
    }

    /// Drop any per-client state (connections, cached credentials) so the
    /// next request builds a fresh client.  Called before an auth retry.
    fn reinitialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Collapse consecutive user messages into one (required by providers
    /// that reject alternation violations).
    fn collapse_user_messages(&self) -> bool {
        false
    }

    fn collapse_assistant_messages(&self) -> bool {
        false
    }

    /// Keep tool definitions in the request even when `tool_choice` is
    /// `None` (some providers reject tool-use history without them).
    fn tools_required(&self) -> bool {
        false
    }

    /// Whether tool results may carry images.  When false, the engine
    /// reflows images out of tool messages into a fabricated user message.
    fn tool_result_images(&self) -> bool {
        false
    }

    /// Reasoning history the provider insists on, overriding config.
    fn force_reasoning_history(&self) -> Option<ReasoningHistory> {
        None
    }

    /// Reasoning history used when config says "auto".
    fn auto_reasoning_history(&self) -> ReasoningHistory {
        ReasoningHistory::All
    }

    /// Token count for a plain text string.  The default is the standard
    /// chars/4 estimate; providers with native tokenizers should override.
    fn count_text_tokens(&self, text: &str) -> u64 {
        tokens::count_text_tokens(text)
    }

    /// Token count for a non-text content part.
    fn count_media_tokens(&self, content: &Content) -> u64 {
        tokens::count_media_tokens(content)
    }

    /// Produce a shorter, semantically equivalent message list together
    /// with the usage the compaction consumed.  `Ok(None)` means the
    /// provider has no native compaction.
    async fn compact(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolInfo],
        _config: &GenerateConfig,
        _instructions: Option<&str>,
    ) -> anyhow::Result<Option<(Vec<ChatMessage>, ModelUsage)>> {
        Ok(None)
    }
}

impl std::fmt::Debug for dyn ModelApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelApi")
            .field("model_name", &self.model_name())
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    #[async_trait]
    impl ModelApi for Minimal {
        fn model_name(&self) -> &str {
            "minimal"
        }
        async fn generate(
            &self,
            _input: &[ChatMessage],
            _tools: &[ToolInfo],
            _tool_choice: &ToolChoice,
            _config: &GenerateConfig,
        ) -> anyhow::Result<ModelOutput> {
            Ok(ModelOutput::from_content("minimal", "ok"))
        }
    }

    #[test]
    fn defaults_are_conservative() {
        let api = Minimal;
        assert_eq!(api.max_connections(), 10);
        assert_eq!(api.connection_key(), "default");
        assert!(!api.tools_required());
        assert!(!api.tool_result_images());
        assert!(api.force_reasoning_history().is_none());
        assert_eq!(api.auto_reasoning_history(), ReasoningHistory::All);
    }

    #[test]
    fn default_text_token_count_is_len_over_four() {
        let api = Minimal;
        assert_eq!(api.count_text_tokens("12345678"), 2);
        assert_eq!(api.count_text_tokens(""), 1);
    }

    #[tokio::test]
    async fn default_compact_is_unsupported() {
        let api = Minimal;
        let result = api
            .compact(&[], &[], &GenerateConfig::default(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
