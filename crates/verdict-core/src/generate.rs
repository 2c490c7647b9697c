// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::debug;

use verdict_model::{
    api::{ModelApi, ReasoningHistory},
    cache::{CacheEntry, CachePolicy, ModelCache},
    connection_semaphore,
    retry::{retry, AttemptTimeoutError, RetryPolicy},
    tokens,
    types::{collapse_consecutive, Content, MessageContent},
    ChatMessage, GenerateConfig, ModelOutput, ToolChoice, ToolInfo,
};
use verdict_tools::ToolRegistry;

use crate::limits::SampleLimits;
use crate::transcript::{Event, Transcript};

/// Chat input for a generate call; a bare string becomes a single user
/// message.
pub enum GenerateInput {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl GenerateInput {
    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Self::Text(text) => vec![ChatMessage::user(text)],
            Self::Messages(messages) => messages,
        }
    }
}

impl From<&str> for GenerateInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for GenerateInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<ChatMessage>> for GenerateInput {
    fn from(messages: Vec<ChatMessage>) -> Self {
        Self::Messages(messages)
    }
}

/// Per-sample context threaded through every generate and tool call:
/// the sample's transcript, its limit scope, the shared generate cache,
/// and the epoch (cache entries are per-epoch by default).
pub struct GenerateContext {
    pub transcript: Arc<Transcript>,
    pub limits: Arc<SampleLimits>,
    pub cache: Option<Arc<ModelCache>>,
    pub epoch: u32,
}

impl GenerateContext {
    /// Context with a fresh transcript and no limits — the common test rig.
    pub fn bare() -> Self {
        Self {
            transcript: Arc::new(Transcript::new()),
            limits: Arc::new(SampleLimits::unlimited()),
            cache: None,
            epoch: 1,
        }
    }
}

/// A provider plus its scoped configuration.
///
/// Owns the full generate pipeline: config layering, input normalization,
/// endpoint concurrency, tool filtering, history shaping, caching, retries
/// with working-time accounting, transcript events, and limit enforcement.
/// The provider underneath only turns one normalized request into one
/// output.
pub struct Model {
    api: Arc<dyn ModelApi>,
    name: String,
    config: GenerateConfig,
    /// An API-key override hook is configured, so auth failures are
    /// retried after closing and reinitializing the client.
    auth_retry: bool,
}

impl Model {
    pub fn new(api: Arc<dyn ModelApi>, name: impl Into<String>, config: GenerateConfig) -> Self {
        Self {
            api,
            name: name.into(),
            config,
            auth_retry: false,
        }
    }

    pub fn with_auth_retry(mut self, enabled: bool) -> Self {
        self.auth_retry = enabled;
        self
    }

    /// Display name, typically `provider/model`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<dyn ModelApi> {
        &self.api
    }

    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    /// Generate output from the model.
    ///
    /// Raises `LimitExceeded` (as the error cause) when the sample's token,
    /// message, or cost budget is already exhausted before the call, or
    /// crosses its threshold with the usage this call records.
    pub async fn generate(
        &self,
        ctx: &GenerateContext,
        input: impl Into<GenerateInput>,
        tools: &ToolRegistry,
        tool_choice: Option<ToolChoice>,
        config: &GenerateConfig,
    ) -> anyhow::Result<ModelOutput> {
        let input = input.into().into_messages();

        // check limits up front so an already-exhausted sample never
        // issues a wasteful provider request
        ctx.limits.check_message_limit(input.len() as u64)?;
        ctx.limits.check_token_limit()?;
        ctx.limits.check_cost_limit()?;
        ctx.limits.check_working_limit()?;

        // resolve config: model/task scope, then the call scope
        let mut config = self.config.merge(config);
        if config.max_tokens.is_none() {
            config.max_tokens = self.api.max_tokens();
        }
        // a single serial-only tool disables parallel tool calls
        if !tools.all_parallel() {
            config.parallel_tool_calls = Some(false);
        }

        // normalize input: prepend the configured system message
        let mut messages = input;
        if let Some(system) = &config.system_message {
            messages.insert(0, ChatMessage::system(system));
        }

        let tool_choice = tool_choice.unwrap_or_default();

        // per-endpoint connection permit, shared by every Model instance
        // with the same connection key
        let max_connections = config
            .max_connections
            .unwrap_or_else(|| self.api.max_connections());
        let semaphore = connection_semaphore(&self.api.connection_key(), max_connections);
        let _permit = semaphore
            .acquire_owned()
            .await
            .context("connection semaphore closed")?;

        self.generate_with_retry(ctx, messages, tools, tool_choice, config)
            .await
    }

    async fn generate_with_retry(
        &self,
        ctx: &GenerateContext,
        messages: Vec<ChatMessage>,
        tools: &ToolRegistry,
        tool_choice: ToolChoice,
        config: GenerateConfig,
    ) -> anyhow::Result<ModelOutput> {
        // resolve tools: filter by choice, then fully purge when disabled
        // or absent (some providers misbehave when handed definitions with
        // tool_choice none) unless the provider requires them
        let mut tools_info = tools.infos();
        let mut tool_choice = tool_choice;
        if let ToolChoice::Function(name) = &tool_choice {
            tools_info.retain(|t| &t.name == name);
        }
        if matches!(tool_choice, ToolChoice::None) || tools_info.is_empty() {
            if !self.api.tools_required() {
                tools_info.clear();
            }
            tool_choice = ToolChoice::None;
        }

        // shape the history for this provider
        let messages = resolve_reasoning_history(messages, &config, self.api.as_ref());
        let messages = resolve_tool_model_input(messages, tools);
        let messages = if self.api.tool_result_images() {
            messages
        } else {
            tool_result_images_as_user_messages(messages)
        };
        let messages = if self.api.collapse_user_messages() {
            collapse_consecutive(messages, "user")
        } else {
            messages
        };
        let messages = if self.api.collapse_assistant_messages() {
            collapse_consecutive(messages, "assistant")
        } else {
            messages
        };

        let cache_enabled = config.cache.unwrap_or(false) && ctx.cache.is_some();
        let policy = CachePolicy {
            per_epoch: true,
            ..Default::default()
        };

        let retry_policy = RetryPolicy::default()
            .with_max_retries(config.max_retries)
            .with_timeout(config.timeout.map(Duration::from_secs));

        let limits = ctx.limits.clone();
        let result = retry(
            &retry_policy,
            || self.attempt(ctx, &messages, &tools_info, &tool_choice, &config, cache_enabled, &policy),
            |err| self.is_retryable(err),
            |err| {
                if self.api.is_auth_failure(err) {
                    debug!(model = %self.name, "auth failure, reinitializing client before retry");
                    let _ = self.api.reinitialize();
                }
            },
            |wait| limits.report_waiting(wait),
        )
        .await;

        // retries exhausted (or a non-retryable error): the failing attempt
        // already completed its transcript event; attach the serialized
        // request so the failure is reproducible from the log alone
        result.with_context(|| {
            format!(
                "model generate failed ({}); request: {}",
                self.name,
                serde_json::to_string(&messages).unwrap_or_default()
            )
        })
    }

    /// One attempt: cache probe, pending event, provider call, completion,
    /// usage accounting and post-call limit enforcement.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        ctx: &GenerateContext,
        messages: &[ChatMessage],
        tools_info: &[ToolInfo],
        tool_choice: &ToolChoice,
        config: &GenerateConfig,
        cache_enabled: bool,
        policy: &CachePolicy,
    ) -> anyhow::Result<ModelOutput> {
        let model_event = |output: Option<ModelOutput>,
                           cache: Option<&str>,
                           time: Option<f64>,
                           pending: bool,
                           error: Option<String>,
                           traceback: Option<String>| {
            Event::Model {
                model: self.name.clone(),
                input: messages.to_vec(),
                tools: tools_info.to_vec(),
                tool_choice: tool_choice.clone(),
                config: config.clone(),
                output,
                cache: cache.map(|c| c.to_string()),
                time,
                pending,
                error,
                traceback,
            }
        };

        let cache_entry = if cache_enabled {
            Some(CacheEntry {
                base_url: self.api.base_url(),
                config: config.without_connection_options(),
                input: messages,
                model: &self.name,
                tool_choice,
                tools: tools_info,
                policy,
                epoch: policy.per_epoch.then_some(ctx.epoch),
            })
        } else {
            None
        };

        if let (Some(entry), Some(cache)) = (&cache_entry, &ctx.cache) {
            if let Some(output) = cache.fetch(entry) {
                debug!(model = %self.name, "generate served from cache");
                ctx.transcript.event(model_event(
                    Some(output.clone()),
                    Some("read"),
                    output.time,
                    false,
                    None,
                    None,
                ));
                return Ok(output);
            }
        }

        // record the interaction before the call; completed on every path
        let event_id = ctx.transcript.event(model_event(
            None,
            cache_enabled.then_some("write"),
            None,
            true,
            None,
            None,
        ));

        let started = Instant::now();
        let call = self.api.generate(messages, tools_info, tool_choice, config);
        let result = match config.attempt_timeout {
            Some(secs) => {
                let budget = Duration::from_secs(secs);
                match tokio::time::timeout(budget, call).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::Error::new(AttemptTimeoutError(budget))),
                }
            }
            None => call.await,
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Err(err) => {
                ctx.transcript.event_updated(
                    event_id,
                    model_event(
                        None,
                        cache_enabled.then_some("write"),
                        Some(elapsed),
                        false,
                        Some(format!("{err:#}")),
                        Some(format!("{err:?}")),
                    ),
                );
                Err(err)
            }
            Ok(mut output) => {
                if output.time.is_none() {
                    output.time = Some(elapsed);
                }
                ctx.transcript.event_updated(
                    event_id,
                    model_event(
                        Some(output.clone()),
                        cache_enabled.then_some("write"),
                        output.time,
                        false,
                        None,
                        None,
                    ),
                );

                // record usage, then enforce token/cost budgets immediately;
                // the event above stays completed even when this raises
                if let Some(usage) = &output.usage {
                    ctx.limits.record_usage(usage);
                }
                ctx.limits.check_token_limit()?;
                ctx.limits.check_cost_limit()?;

                if let (Some(entry), Some(cache)) = (&cache_entry, &ctx.cache) {
                    cache.store(entry, &output);
                }
                Ok(output)
            }
        }
    }

    fn is_retryable(&self, err: &anyhow::Error) -> bool {
        // attempt timeouts are always retried; termination comes from
        // max_retries / overall timeout
        if err.downcast_ref::<AttemptTimeoutError>().is_some() {
            return true;
        }
        if self.api.should_retry(err) {
            return true;
        }
        self.auth_retry && self.api.is_auth_failure(err)
    }

    /// Generate in a loop, executing tool calls until the model stops
    /// making them.  Returns the new messages (past the input) and the
    /// final output.  Termination is also forced by any `LimitExceeded`
    /// raised from `generate`.
    pub async fn generate_loop(
        &self,
        ctx: &GenerateContext,
        input: impl Into<GenerateInput>,
        tools: &ToolRegistry,
        config: &GenerateConfig,
    ) -> anyhow::Result<(Vec<ChatMessage>, ModelOutput)> {
        let init = input.into().into_messages();
        let mut messages = init.clone();
        loop {
            let output = self
                .generate(ctx, messages.clone(), tools, None, config)
                .await?;
            let message = output.message();
            messages.push(message.clone());

            let has_tool_calls = message
                .tool_calls()
                .map(|calls| !calls.is_empty())
                .unwrap_or(false);
            if has_tool_calls {
                let merged = self.config.merge(config);
                let tool_messages = crate::tool_exec::execute_tools(
                    ctx,
                    &message,
                    tools,
                    merged.max_tool_output,
                    merged.parallel_tool_calls.unwrap_or(true),
                )
                .await;
                messages.extend(tool_messages);
            } else {
                let new = messages[init.len()..].to_vec();
                return Ok((new, output));
            }
        }
    }

    /// Estimate token count for the input using provider-native counters
    /// where available.
    pub fn count_tokens(&self, messages: &[ChatMessage]) -> u64 {
        messages
            .iter()
            .map(|m| tokens::count_message_tokens(m, |text| self.api.count_text_tokens(text)))
            .sum()
    }

    /// Provider-native history compaction, when implemented.  The usage
    /// the compaction consumed is folded into the sample's accounting.
    pub async fn compact(
        &self,
        ctx: &GenerateContext,
        messages: &[ChatMessage],
        tools: &ToolRegistry,
        config: &GenerateConfig,
        instructions: Option<&str>,
    ) -> anyhow::Result<Option<Vec<ChatMessage>>> {
        let config = self.config.merge(config);
        match self
            .api
            .compact(messages, &tools.infos(), &config, instructions)
            .await?
        {
            Some((compacted, usage)) => {
                ctx.limits.record_usage(&usage);
                Ok(Some(compacted))
            }
            None => Ok(None),
        }
    }
}

// ─── History shaping ──────────────────────────────────────────────────────────

/// Apply the reasoning-history policy to assistant messages.
///
/// `all` keeps every Reasoning part, `last` keeps them only on the most
/// recent assistant message that has any, `none` strips them everywhere.
/// Only reasoning content is elided; the surrounding message structure is
/// left as-is.
fn resolve_reasoning_history(
    messages: Vec<ChatMessage>,
    config: &GenerateConfig,
    api: &dyn ModelApi,
) -> Vec<ChatMessage> {
    let have_reasoning = messages
        .iter()
        .any(|m| m.is_assistant() && m.content().has_reasoning());
    if !have_reasoning {
        return messages;
    }

    let policy = match api.force_reasoning_history() {
        Some(forced) => forced,
        None => config
            .reasoning_history
            .unwrap_or_default()
            .resolved()
            .unwrap_or_else(|| api.auto_reasoning_history()),
    };
    if policy == ReasoningHistory::All {
        return messages;
    }

    // walk from the end so "last" can keep the first reasoning it finds
    let mut found_last = false;
    let mut resolved: Vec<ChatMessage> = messages
        .into_iter()
        .rev()
        .map(|mut message| {
            if message.is_assistant() && message.content().has_reasoning() {
                let strip = policy == ReasoningHistory::None || found_last;
                found_last = true;
                if strip {
                    let parts: Vec<Content> = message
                        .content()
                        .parts()
                        .into_iter()
                        .filter(|p| !matches!(p, Content::Reasoning { .. }))
                        .collect();
                    *message.content_mut() = MessageContent::Parts(parts);
                }
            }
            message
        })
        .collect();
    resolved.reverse();
    resolved
}

/// Run each tool's model-input transformer over its historical result
/// messages (used by screenshot-heavy tools to drop stale images).
fn resolve_tool_model_input(messages: Vec<ChatMessage>, tools: &ToolRegistry) -> Vec<ChatMessage> {
    let total = messages.iter().filter(|m| m.is_tool()).count();
    if total == 0 {
        return messages;
    }

    let mut messages = messages;
    for name in tools.names() {
        let Some(tool) = tools.get(&name) else { continue };
        let mut index = 0usize;
        for message in messages.iter_mut() {
            let ChatMessage::Tool {
                function: Some(function),
                content,
                ..
            } = message
            else {
                continue;
            };
            if function != &name {
                continue;
            }
            if let Some(replaced) = tool.model_input(index, total, content) {
                *content = replaced;
            }
            index += 1;
        }
    }
    messages
}

/// Move images out of tool results into fabricated user messages for
/// providers that reject images in tool messages.  The tool message keeps
/// a textual placeholder; the user message that follows carries the images
/// and the originating tool call ids.
fn tool_result_images_as_user_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut pending_images: Vec<Content> = Vec::new();
    let mut pending_ids: Vec<String> = Vec::new();

    let flush =
        |out: &mut Vec<ChatMessage>, images: &mut Vec<Content>, ids: &mut Vec<String>| {
            if !images.is_empty() {
                out.push(ChatMessage::User {
                    id: Some(uuid::Uuid::new_v4().to_string()),
                    content: MessageContent::Parts(std::mem::take(images)),
                    tool_call_ids: std::mem::take(ids),
                });
            }
        };

    for message in messages {
        let is_tool_with_images = message.is_tool() && message.content().has_image();
        if is_tool_with_images {
            let ChatMessage::Tool {
                id,
                content,
                tool_call_id,
                function,
                error,
            } = message
            else {
                unreachable!()
            };
            let mut edited: Vec<Content> = Vec::new();
            for part in content.parts() {
                match part {
                    Content::Image { .. } => {
                        pending_images.push(part);
                        edited.push(Content::text("Image content is included below."));
                    }
                    other => edited.push(other),
                }
            }
            if let Some(call_id) = &tool_call_id {
                pending_ids.push(call_id.clone());
            }
            out.push(ChatMessage::Tool {
                id,
                content: MessageContent::Parts(edited),
                tool_call_id,
                function,
                error,
            });
        } else {
            flush(&mut out, &mut pending_images, &mut pending_ids);
            out.push(message);
        }
    }
    flush(&mut out, &mut pending_images, &mut pending_ids);
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
