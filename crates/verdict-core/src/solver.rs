// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use verdict_model::{ChatMessage, GenerateConfig, ModelOutput};
use verdict_tools::{SandboxEnvironment, ToolRegistry};

use crate::generate::{GenerateContext, Model};
use crate::transcript::Event;

/// Mutable state threaded through a solver pipeline.
///
/// A solver reads and extends the conversation, may call the model, and
/// may stash intermediate values in `store`.  The final state is what the
/// scorers see.
pub struct TaskState {
    pub sample_id: String,
    pub epoch: u32,
    pub model: Arc<Model>,
    pub tools: Arc<ToolRegistry>,
    pub ctx: Arc<GenerateContext>,
    pub messages: Vec<ChatMessage>,
    pub output: Option<ModelOutput>,
    pub target: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub store: BTreeMap<String, serde_json::Value>,
    pub sandbox: Option<Arc<dyn SandboxEnvironment>>,
    /// Task-scoped generate overrides applied to every call.
    pub config: GenerateConfig,
}

impl TaskState {
    /// Call the model once over the current conversation and append its
    /// message.
    pub async fn generate(&mut self) -> anyhow::Result<()> {
        let output = self
            .model
            .generate(
                &self.ctx,
                self.messages.clone(),
                &self.tools,
                None,
                &self.config,
            )
            .await?;
        self.messages.push(output.message());
        self.output = Some(output);
        Ok(())
    }

    /// Write a store value, snapshotting the change into the transcript.
    pub fn store_set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.ctx.transcript.event(Event::State {
            changes: serde_json::json!({ &key: value.clone() }),
        });
        self.store.insert(key, value);
    }

    /// Plain text of the latest model output.
    pub fn completion(&self) -> String {
        self.output
            .as_ref()
            .map(|o| o.completion())
            .unwrap_or_default()
    }
}

/// One step of a task's agent.  Steps mutate [`TaskState`] and compose
/// with [`chain`].
#[async_trait]
pub trait Solver: Send + Sync {
    fn name(&self) -> &str;

    async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()>;
}

/// Solver that calls the model exactly once.
pub struct GenerateSolver;

#[async_trait]
impl Solver for GenerateSolver {
    fn name(&self) -> &str {
        "generate"
    }

    async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()> {
        state.generate().await
    }
}

/// Solver that runs the generate/tool loop until the model answers in
/// text.  Loop termination is forced by any `LimitExceeded` raised from
/// generate (token, message, time, or cost budgets).
pub struct ToolLoopSolver;

#[async_trait]
impl Solver for ToolLoopSolver {
    fn name(&self) -> &str {
        "tool_loop"
    }

    async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()> {
        let (new_messages, output) = state
            .model
            .generate_loop(
                &state.ctx,
                state.messages.clone(),
                &state.tools,
                &state.config,
            )
            .await?;
        state.messages.extend(new_messages);
        state.output = Some(output);
        Ok(())
    }
}

/// Compose solvers into a pipeline; each runs to completion before the
/// next, all sharing one state.
pub fn chain(solvers: Vec<Arc<dyn Solver>>) -> Arc<dyn Solver> {
    Arc::new(ChainSolver { solvers })
}

struct ChainSolver {
    solvers: Vec<Arc<dyn Solver>>,
}

#[async_trait]
impl Solver for ChainSolver {
    fn name(&self) -> &str {
        "chain"
    }

    async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()> {
        for solver in &self.solvers {
            let span = state.ctx.transcript.begin_span(solver.name());
            let result = solver.solve(state).await;
            state.ctx.transcript.end_span(span);
            result?;
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
