// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::api::ReasoningHistory;

/// Configuration for a generate call.
///
/// Configs are layered: a task-scoped config is merged with the
/// model-scoped config, then with the call-scoped config — later layers
/// win on any field they set.  Provider-specific knobs that have no
/// enumerated field travel in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateConfig {
    /// Maximum retry attempts for a failing generate (connection options:
    /// excluded from the cache fingerprint).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,
    /// Total wall-clock budget in seconds for a generate including retries
    /// (connection option).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Budget in seconds for a single attempt; an expired attempt is
    /// always retried (connection option).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout: Option<u64>,
    /// Per-endpoint concurrent connection limit (connection option).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    /// System message prepended to the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_seqs: Option<Vec<String>>,
    /// Allow the model to emit several tool calls in one assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    /// Truncate individual tool outputs beyond this many bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_output: Option<usize>,
    /// Enable the on-disk generate cache for this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    /// Which assistant reasoning blocks are replayed to the provider:
    /// none, all, last, or auto (defer to the provider).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_history: Option<ReasoningHistoryConfig>,
    /// Provider-specific pass-through knobs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// `reasoning_history` as written in config: the three policies plus "auto".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningHistoryConfig {
    None,
    All,
    Last,
    #[default]
    Auto,
}

impl ReasoningHistoryConfig {
    pub fn resolved(self) -> Option<ReasoningHistory> {
        match self {
            Self::None => Some(ReasoningHistory::None),
            Self::All => Some(ReasoningHistory::All),
            Self::Last => Some(ReasoningHistory::Last),
            Self::Auto => None,
        }
    }
}

macro_rules! merge_field {
    ($dst:ident, $src:ident, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

impl GenerateConfig {
    /// Merge `other` over `self`: any field `other` sets wins; `extra`
    /// entries are merged key-wise with `other` winning.
    pub fn merge(&self, other: &GenerateConfig) -> GenerateConfig {
        let mut merged = self.clone();
        merge_field!(
            merged,
            other,
            max_retries,
            timeout,
            attempt_timeout,
            max_connections,
            system_message,
            max_tokens,
            temperature,
            top_p,
            top_k,
            seed,
            stop_seqs,
            parallel_tool_calls,
            max_tool_output,
            cache,
            reasoning_history,
        );
        for (k, v) in &other.extra {
            merged.extra.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Copy with connection options cleared — the cache fingerprint must not
    /// vary with retry/timeout/connection tuning.
    pub fn without_connection_options(&self) -> GenerateConfig {
        let mut c = self.clone();
        c.max_retries = None;
        c.timeout = None;
        c.attempt_timeout = None;
        c.max_connections = None;
        c
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
