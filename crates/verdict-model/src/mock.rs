// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    api::ModelApi,
    config::GenerateConfig,
    output::{ModelOutput, ModelUsage},
    tool::{ToolCall, ToolChoice, ToolInfo},
    types::ChatMessage,
};

/// Deterministic mock provider for tests.  Returns a fixed completion for
/// every call, with a small fixed usage so accounting paths are exercised.
pub struct MockApi {
    completion: String,
}

impl MockApi {
    pub fn new(completion: impl Into<String>) -> Self {
        Self {
            completion: completion.into(),
        }
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new("Default output from mock/model")
    }
}

#[async_trait]
impl ModelApi for MockApi {
    fn model_name(&self) -> &str {
        "model"
    }

    fn connection_key(&self) -> String {
        "mock".to_string()
    }

    async fn generate(
        &self,
        _input: &[ChatMessage],
        _tools: &[ToolInfo],
        _tool_choice: &ToolChoice,
        _config: &GenerateConfig,
    ) -> anyhow::Result<ModelOutput> {
        Ok(ModelOutput::from_content("mock/model", self.completion.clone())
            .with_usage(ModelUsage::new(10, 10)))
    }
}

/// One scripted response: a full output, or an error to inject.
pub enum ScriptedStep {
    Output(ModelOutput),
    Error(String),
}

impl ScriptedStep {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Output(
            ModelOutput::from_content("mock/model", content).with_usage(ModelUsage::new(10, 10)),
        )
    }

    pub fn text_with_usage(content: impl Into<String>, usage: ModelUsage) -> Self {
        Self::Output(ModelOutput::from_content("mock/model", content).with_usage(usage))
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self::Output(
            ModelOutput::for_tool_call("mock/model", call).with_usage(ModelUsage::new(10, 10)),
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }
}

/// A pre-scripted mock provider.  Each `generate` pops the next step from
/// the front of the queue, so tests specify exact call sequences —
/// including tool calls and injected transient errors — without network
/// access.  Errors whose message contains `"retryable"` are reported as
/// retryable via `should_retry`; `"401"` marks an auth failure.
pub struct ScriptedApi {
    steps: Mutex<Vec<ScriptedStep>>,
    /// Requests seen by this provider, for test inspection.
    pub requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    /// Count of `reinitialize()` calls, for auth-retry tests.
    pub reinitialized: Arc<Mutex<usize>>,
}

impl ScriptedApi {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps),
            requests: Arc::new(Mutex::new(Vec::new())),
            reinitialized: Arc::new(Mutex::new(0)),
        }
    }

    /// Provider that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(vec![ScriptedStep::text(reply)])
    }
}

#[async_trait]
impl ModelApi for ScriptedApi {
    fn model_name(&self) -> &str {
        "model"
    }

    fn connection_key(&self) -> String {
        "scripted-mock".to_string()
    }

    fn should_retry(&self, err: &anyhow::Error) -> bool {
        err.to_string().contains("retryable")
    }

    fn is_auth_failure(&self, err: &anyhow::Error) -> bool {
        err.to_string().contains("401")
    }

    fn reinitialize(&self) -> anyhow::Result<()> {
        *self.reinitialized.lock().unwrap() += 1;
        Ok(())
    }

    async fn generate(
        &self,
        input: &[ChatMessage],
        _tools: &[ToolInfo],
        _tool_choice: &ToolChoice,
        _config: &GenerateConfig,
    ) -> anyhow::Result<ModelOutput> {
        self.requests.lock().unwrap().push(input.to_vec());
        let step = {
            let mut steps = self.steps.lock().unwrap();
            if steps.is_empty() {
                None
            } else {
                Some(steps.remove(0))
            }
        };
        match step {
            Some(ScriptedStep::Output(output)) => Ok(output),
            Some(ScriptedStep::Error(message)) => Err(anyhow::anyhow!(message)),
            // scripts exhausted: fall back to a fixed reply rather than
            // erroring, so loop tests can overshoot harmlessly
            None => Ok(ModelOutput::from_content("mock/model", "[no more scripts]")
                .with_usage(ModelUsage::new(1, 1))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_fixed_completion_with_usage() {
        let api = MockApi::new("ANSWER: 42");
        let out = api
            .generate(
                &[ChatMessage::user("q")],
                &[],
                &ToolChoice::Auto,
                &GenerateConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.completion(), "ANSWER: 42");
        assert_eq!(out.usage.unwrap().total_tokens, 20);
    }

    #[tokio::test]
    async fn scripted_pops_steps_in_order() {
        let api = ScriptedApi::new(vec![
            ScriptedStep::text("first"),
            ScriptedStep::text("second"),
        ]);
        let req = [ChatMessage::user("q")];
        let cfg = GenerateConfig::default();
        let a = api.generate(&req, &[], &ToolChoice::Auto, &cfg).await.unwrap();
        let b = api.generate(&req, &[], &ToolChoice::Auto, &cfg).await.unwrap();
        assert_eq!(a.completion(), "first");
        assert_eq!(b.completion(), "second");
    }

    #[tokio::test]
    async fn scripted_error_steps_fail_the_call() {
        let api = ScriptedApi::new(vec![
            ScriptedStep::error("retryable: 429"),
            ScriptedStep::text("recovered"),
        ]);
        let req = [ChatMessage::user("q")];
        let cfg = GenerateConfig::default();
        let err = api
            .generate(&req, &[], &ToolChoice::Auto, &cfg)
            .await
            .unwrap_err();
        assert!(api.should_retry(&err));
        let ok = api.generate(&req, &[], &ToolChoice::Auto, &cfg).await.unwrap();
        assert_eq!(ok.completion(), "recovered");
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let api = ScriptedApi::always_text("hi");
        let req = [ChatMessage::user("inspect me")];
        let cfg = GenerateConfig::default();
        api.generate(&req, &[], &ToolChoice::Auto, &cfg).await.unwrap();
        let seen = api.requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0].text(), "inspect me");
    }

    #[tokio::test]
    async fn scripted_exhaustion_falls_back() {
        let api = ScriptedApi::new(vec![]);
        let out = api
            .generate(
                &[ChatMessage::user("q")],
                &[],
                &ToolChoice::Auto,
                &GenerateConfig::default(),
            )
            .await
            .unwrap();
        assert!(out.completion().contains("no more scripts"));
    }
}
