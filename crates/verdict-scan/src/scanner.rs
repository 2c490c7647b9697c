// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ScanTranscript, TranscriptContent};

/// One row a scanner emits for a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    /// The scanner's finding: a flag, a label, a measurement.
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ScanResult {
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            answer: None,
            explanation: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    /// Flatten into the columns of the per-scanner artifact.
    pub fn to_columns(&self) -> BTreeMap<String, serde_json::Value> {
        let mut columns = BTreeMap::new();
        columns.insert("value".to_string(), self.value.clone());
        if let Some(answer) = &self.answer {
            columns.insert("answer".to_string(), serde_json::json!(answer));
        }
        if let Some(explanation) = &self.explanation {
            columns.insert("explanation".to_string(), serde_json::json!(explanation));
        }
        for (key, value) in &self.metadata {
            columns.insert(format!("metadata_{key}"), value.clone());
        }
        columns
    }
}

/// Post-hoc analyzer of completed transcripts.
///
/// A scanner declares up front which transcript content it reads; the
/// pool fetches the union of all declarations once per transcript and
/// hands each scanner its narrowed view.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    /// Content this scanner needs.  Defaults to all messages.
    fn content(&self) -> TranscriptContent {
        TranscriptContent::messages_only()
    }

    async fn scan(&self, transcript: &ScanTranscript) -> anyhow::Result<Vec<ScanResult>>;
}

/// Factory building a scanner from its persisted params.
pub type ScannerFactory =
    Arc<dyn Fn(&serde_json::Value) -> anyhow::Result<Arc<dyn Scanner>> + Send + Sync>;

fn registry() -> &'static Mutex<BTreeMap<String, ScannerFactory>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, ScannerFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Register a scanner factory under its registered name so that
/// `scan_resume` can reconstruct scanners from a durable `ScanSpec`.
pub fn register_scanner(name: &str, factory: ScannerFactory) {
    registry().lock().unwrap().insert(name.to_string(), factory);
}

/// Instantiate a registered scanner from its name and params.
pub fn get_scanner(name: &str, params: &serde_json::Value) -> anyhow::Result<Arc<dyn Scanner>> {
    let map = registry().lock().unwrap();
    let factory = map
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("unknown scanner: {name}"))?;
    factory(params)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
