// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use verdict_model::{ChatMessage, ModelUsage};
use verdict_tools::SandboxSpec;

use crate::limits::LimitExceeded;
use crate::scorer::Score;
use crate::transcript::EventRecord;

/// One input/target pair — the unit of parallel work.  Immutable after
/// creation; each epoch repetition runs the same sample with a distinct
/// epoch id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub id: String,
    pub input: Vec<ChatMessage>,
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Files staged into the sandbox before the solver runs
    /// (path → contents).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSpec>,
}

impl Sample {
    pub fn new(id: impl Into<String>, input: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: vec![ChatMessage::user(input)],
            target: target.into(),
            metadata: BTreeMap::new(),
            files: BTreeMap::new(),
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxSpec) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }
}

/// The persisted result of running one sample for one epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalSample {
    pub id: String,
    pub epoch: u32,
    pub uuid: String,
    /// Final conversation, including tool messages.
    pub messages: Vec<ChatMessage>,
    pub events: Vec<EventRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, Score>,
    /// Set when the sample terminated with an uncaught error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the sample terminated by crossing a budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<LimitExceeded>,
    pub usage: ModelUsage,
    /// Wall-clock seconds for the sample.
    pub total_time: f64,
    /// Wall time minus retry/rate-limit waits, in seconds.
    pub working_time: f64,
}

impl EvalSample {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// A one-line summary for CLI failure reporting.
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            let first = error.lines().next().unwrap_or_default();
            format!("sample {} (epoch {}): error: {first}", self.id, self.epoch)
        } else if let Some(limit) = &self.limit {
            format!("sample {} (epoch {}): {limit}", self.id, self.epoch)
        } else {
            format!("sample {} (epoch {}): ok", self.id, self.epoch)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{LimitExceeded, LimitKind};

    #[test]
    fn sample_new_wraps_input_as_user_message() {
        let s = Sample::new("s1", "What is 6*7?", "42");
        assert_eq!(s.input.len(), 1);
        assert_eq!(s.input[0].role(), "user");
        assert_eq!(s.target, "42");
    }

    #[test]
    fn sample_builder_attaches_files_and_sandbox() {
        let s = Sample::new("s1", "q", "t")
            .with_sandbox(SandboxSpec::local())
            .with_file("data.txt", "payload");
        assert!(s.sandbox.is_some());
        assert_eq!(s.files["data.txt"], "payload");
    }

    #[test]
    fn eval_sample_summary_lines() {
        let base = EvalSample {
            id: "s1".into(),
            epoch: 1,
            uuid: "u".into(),
            messages: vec![],
            events: vec![],
            scores: BTreeMap::new(),
            error: None,
            limit: None,
            usage: ModelUsage::default(),
            total_time: 0.0,
            working_time: 0.0,
        };
        assert!(base.summary().ends_with("ok"));

        let errored = EvalSample {
            error: Some("boom\nbacktrace".into()),
            ..base.clone()
        };
        assert!(errored.is_error());
        assert!(errored.summary().contains("error: boom"));
        assert!(!errored.summary().contains("backtrace"));

        let limited = EvalSample {
            limit: Some(LimitExceeded {
                kind: LimitKind::Tokens,
                limit: 100.0,
                value: 110.0,
            }),
            ..base
        };
        assert!(limited.summary().contains("token limit exceeded"));
    }
}
