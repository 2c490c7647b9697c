// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use verdict_model::ModelUsage;

use crate::sample::EvalSample;

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
    Cancelled,
}

/// Durable description of one eval run, written when the run starts and
/// re-read on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalSpec {
    pub eval_id: String,
    pub task_name: String,
    pub model: String,
    pub created: DateTime<Utc>,
    pub epochs: u32,
    /// Snapshot of the task configuration for log round-tripping.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl EvalSpec {
    pub fn new(task_name: impl Into<String>, model: impl Into<String>, epochs: u32) -> Self {
        Self {
            eval_id: uuid::Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            model: model.into(),
            created: Utc::now(),
            epochs,
            config: serde_json::Value::Null,
        }
    }
}

/// Aggregate results of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalResults {
    pub status: TaskStatus,
    pub total_samples: usize,
    pub completed_samples: usize,
    pub error_samples: usize,
    pub limit_samples: usize,
    /// Headline metric per scorer (accuracy over reduced scores).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
    /// Aggregate usage per model.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub usage: BTreeMap<String, ModelUsage>,
}

/// Durable sink for in-progress and final eval state.
///
/// A recorder exclusively owns one output location.  Samples are recorded
/// as they complete; `flush` makes buffered records durable; `complete`
/// finalizes the location and returns it.  `is_recorded` makes interrupted
/// runs resumable without repeating finished samples.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Claim the location and start a run.  Samples already durable at
    /// the location (from a prior interrupted run) are preserved so the
    /// scheduler can skip them.
    async fn init(&self, spec: &EvalSpec) -> anyhow::Result<()>;

    async fn resume(&self, location: &str) -> anyhow::Result<EvalSpec>;

    async fn is_recorded(&self, sample_id: &str, epoch: u32) -> anyhow::Result<bool>;

    async fn record_sample(&self, sample: &EvalSample) -> anyhow::Result<()>;

    async fn record_results(&self, results: &EvalResults) -> anyhow::Result<()>;

    async fn flush(&self) -> anyhow::Result<()>;

    /// Finalize and return the location of the durable log.
    async fn complete(&self) -> anyhow::Result<String>;

    /// Read back all recorded samples (for resume and re-scoring).
    async fn read_samples(&self) -> anyhow::Result<Vec<EvalSample>>;
}

/// In-memory recorder used by tests and dry runs.
#[derive(Default)]
pub struct MemoryRecorder {
    state: std::sync::Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    spec: Option<EvalSpec>,
    samples: Vec<EvalSample>,
    results: Option<EvalResults>,
    flushes: usize,
    completed: bool,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Option<EvalResults> {
        self.state.lock().unwrap().results.clone()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }

    pub fn completed(&self) -> bool {
        self.state.lock().unwrap().completed
    }

    /// Pre-load samples, simulating a prior interrupted run.
    pub fn preload(&self, samples: Vec<EvalSample>) {
        self.state.lock().unwrap().samples.extend(samples);
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn init(&self, spec: &EvalSpec) -> anyhow::Result<()> {
        self.state.lock().unwrap().spec = Some(spec.clone());
        Ok(())
    }

    async fn resume(&self, _location: &str) -> anyhow::Result<EvalSpec> {
        self.state
            .lock()
            .unwrap()
            .spec
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no spec recorded"))
    }

    async fn is_recorded(&self, sample_id: &str, epoch: u32) -> anyhow::Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .samples
            .iter()
            .any(|s| s.id == sample_id && s.epoch == epoch))
    }

    async fn record_sample(&self, sample: &EvalSample) -> anyhow::Result<()> {
        self.state.lock().unwrap().samples.push(sample.clone());
        Ok(())
    }

    async fn record_results(&self, results: &EvalResults) -> anyhow::Result<()> {
        self.state.lock().unwrap().results = Some(results.clone());
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }

    async fn complete(&self) -> anyhow::Result<String> {
        self.state.lock().unwrap().completed = true;
        Ok("memory://".to_string())
    }

    async fn read_samples(&self) -> anyhow::Result<Vec<EvalSample>> {
        Ok(self.state.lock().unwrap().samples.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
