// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod api;
pub mod cache;
pub mod config;
pub mod connections;
pub mod mock;
pub mod output;
pub mod registry;
pub mod retry;
pub mod tokens;
pub mod tool;
pub mod types;

pub use api::{ModelApi, ReasoningHistory};
pub use cache::{CacheEntry, CachePolicy, ModelCache};
pub use config::GenerateConfig;
pub use connections::connection_semaphore;
pub use mock::{MockApi, ScriptedApi};
pub use output::{ChatCompletionChoice, ModelOutput, ModelUsage, StopReason};
pub use registry::{get_api, register_api, ModelApiFactory};
pub use retry::{retry, AttemptTimeoutError, RetryPolicy};
pub use tool::{ToolCall, ToolCallError, ToolCallErrorKind, ToolChoice, ToolInfo};
pub use types::{ChatMessage, Content, MessageContent};
