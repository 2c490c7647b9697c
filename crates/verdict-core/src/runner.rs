// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use verdict_model::cache::ModelCache;
use verdict_model::GenerateConfig;
use verdict_tools::{CleanupPolicy, SandboxEnvironment, SandboxProvider, ToolRegistry};

use crate::generate::{GenerateContext, Model};
use crate::limits::{LimitExceeded, LimitKind, LimitsConfig, SampleLimits};
use crate::sample::{EvalSample, Sample};
use crate::scorer::{Score, Scorer};
use crate::solver::{Solver, TaskState};
use crate::transcript::{Event, Transcript};

/// Per-sample execution options, shared by every sample of a task.
pub struct SampleOptions {
    pub limits: LimitsConfig,
    pub cache: Option<Arc<ModelCache>>,
    pub sandbox_provider: Option<Arc<dyn SandboxProvider>>,
    pub cleanup: CleanupPolicy,
    /// Task-scoped generate overrides.
    pub config: GenerateConfig,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            cache: None,
            sandbox_provider: None,
            cleanup: CleanupPolicy::Always,
            config: GenerateConfig::default(),
        }
    }
}

enum Outcome {
    Solved(TaskState),
    Limited(TaskState, LimitExceeded),
    Errored(String, String),
    Cancelled,
}

/// Run one sample for one epoch: sandbox setup, solver pipeline, scoring,
/// teardown, transcript finalization.
///
/// Never fails: every exit path (success, limit, error, cancellation)
/// produces an `EvalSample` with a finalized transcript — no pending
/// events remain, and the sandbox is torn down on all paths.
pub async fn run_sample(
    sample: &Sample,
    epoch: u32,
    model: Arc<Model>,
    tools: Arc<ToolRegistry>,
    solver: Arc<dyn Solver>,
    scorers: &[Arc<dyn Scorer>],
    options: &SampleOptions,
    mut cancel: watch::Receiver<bool>,
) -> EvalSample {
    let transcript = Arc::new(Transcript::new());
    let limits = Arc::new(SampleLimits::new(options.limits));
    let ctx = Arc::new(GenerateContext {
        transcript: transcript.clone(),
        limits: limits.clone(),
        cache: options.cache.clone(),
        epoch,
    });

    transcript.event(Event::SampleInit {
        sample_id: sample.id.clone(),
        epoch,
        input: sample.input.clone(),
        target: sample.target.clone(),
    });

    // sandbox setup; a failure here errors the sample without running the
    // solver
    let sandbox = match setup_sandbox(sample, options, &transcript).await {
        Ok(sandbox) => sandbox,
        Err(err) => {
            let message = format!("sandbox setup failed: {err:#}");
            transcript.event(Event::Error {
                error: message.clone(),
                traceback: Some(format!("{err:?}")),
            });
            return finalize(sample, epoch, &transcript, &limits, vec![], BTreeMap::new(), Some(message), None);
        }
    };

    let mut state = TaskState {
        sample_id: sample.id.clone(),
        epoch,
        model,
        tools,
        ctx: ctx.clone(),
        messages: sample.input.clone(),
        output: None,
        target: sample.target.clone(),
        metadata: sample.metadata.clone(),
        store: BTreeMap::new(),
        sandbox: sandbox.clone(),
        config: options.config.clone(),
    };

    let outcome = solve(&mut state, solver, limits.clone(), &mut cancel).await;
    let outcome = match outcome {
        SolveResult::Ok => Outcome::Solved(state),
        SolveResult::Limit(limit) => Outcome::Limited(state, limit),
        SolveResult::Error(message, traceback) => Outcome::Errored(message, traceback),
        SolveResult::Cancelled => Outcome::Cancelled,
    };

    // scoring; scorers are independent of each other, but any scorer
    // error discards all scores and errors the sample
    let (messages, scores, error, limit) = match outcome {
        Outcome::Solved(state) => match run_scorers(&state, scorers, &transcript).await {
            Ok(scores) => (state.messages, scores, None, None),
            Err(err) => {
                let message = format!("scorer failed: {err:#}");
                transcript.event(Event::Error {
                    error: message.clone(),
                    traceback: Some(format!("{err:?}")),
                });
                (state.messages, BTreeMap::new(), Some(message), None)
            }
        },
        Outcome::Limited(state, limit) => {
            transcript.event(Event::SampleLimit {
                limit: limit.clone(),
            });
            // a limited sample is still scored on its final state
            match run_scorers(&state, scorers, &transcript).await {
                Ok(scores) => (state.messages, scores, None, Some(limit)),
                Err(err) => {
                    let message = format!("scorer failed: {err:#}");
                    transcript.event(Event::Error {
                        error: message.clone(),
                        traceback: Some(format!("{err:?}")),
                    });
                    (state.messages, BTreeMap::new(), Some(message), Some(limit))
                }
            }
        }
        Outcome::Errored(message, traceback) => {
            transcript.event(Event::Error {
                error: message.clone(),
                traceback: Some(traceback),
            });
            (vec![], BTreeMap::new(), Some(message), None)
        }
        Outcome::Cancelled => {
            transcript.event(Event::Error {
                error: "cancelled".to_string(),
                traceback: None,
            });
            (vec![], BTreeMap::new(), Some("cancelled".to_string()), None)
        }
    };

    // teardown on every path; failures are warnings, never sample errors
    if let Some(sandbox) = sandbox {
        transcript.event(Event::Sandbox {
            action: "teardown".to_string(),
            detail: None,
        });
        if let Err(err) = sandbox.teardown().await {
            warn!(sample = %sample.id, "sandbox teardown failed: {err:#}");
        }
    }

    finalize(sample, epoch, &transcript, &limits, messages, scores, error, limit)
}

enum SolveResult {
    Ok,
    Limit(LimitExceeded),
    Error(String, String),
    Cancelled,
}

async fn solve(
    state: &mut TaskState,
    solver: Arc<dyn Solver>,
    limits: Arc<SampleLimits>,
    cancel: &mut watch::Receiver<bool>,
) -> SolveResult {
    if *cancel.borrow() {
        return SolveResult::Cancelled;
    }

    let time_limit = limits.time_limit();
    let solve = async {
        match time_limit {
            Some(budget) => match tokio::time::timeout(budget, solver.solve(state)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::Error::new(LimitExceeded {
                    kind: LimitKind::Time,
                    limit: budget.as_secs_f64(),
                    value: budget.as_secs_f64(),
                })),
            },
            None => solver.solve(state).await,
        }
    };

    let result = tokio::select! {
        biased;
        // both an explicit cancel and a dropped sender end the sample
        _ = cancel.changed() => return SolveResult::Cancelled,
        result = solve => result,
    };

    match result {
        Ok(()) => SolveResult::Ok,
        Err(err) => match err.downcast_ref::<LimitExceeded>() {
            Some(limit) => SolveResult::Limit(limit.clone()),
            None => SolveResult::Error(format!("{err:#}"), format!("{err:?}")),
        },
    }
}

async fn setup_sandbox(
    sample: &Sample,
    options: &SampleOptions,
    transcript: &Transcript,
) -> anyhow::Result<Option<Arc<dyn SandboxEnvironment>>> {
    let Some(spec) = &sample.sandbox else {
        return Ok(None);
    };
    let provider = options
        .sandbox_provider
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("sample requests a sandbox but none is configured"))?;

    transcript.event(Event::Sandbox {
        action: "init".to_string(),
        detail: Some(spec.kind.clone()),
    });
    let sandbox = provider.init(spec, options.cleanup).await?;

    for (path, contents) in &sample.files {
        sandbox
            .write_file(path, contents.as_bytes())
            .await
            .map_err(|err| anyhow::anyhow!("staging {path}: {err}"))?;
        debug!(sample = %sample.id, path, "staged sample file");
    }
    Ok(Some(sandbox))
}

async fn run_scorers(
    state: &TaskState,
    scorers: &[Arc<dyn Scorer>],
    transcript: &Transcript,
) -> anyhow::Result<BTreeMap<String, Score>> {
    let mut scores = BTreeMap::new();
    for scorer in scorers {
        let score = scorer.score(state, &state.target).await?;
        transcript.event(Event::Score {
            scorer: scorer.name().to_string(),
            score: score.clone(),
        });
        scores.insert(scorer.name().to_string(), score);
    }
    Ok(scores)
}

#[allow(clippy::too_many_arguments)]
fn finalize(
    sample: &Sample,
    epoch: u32,
    transcript: &Transcript,
    limits: &SampleLimits,
    messages: Vec<verdict_model::ChatMessage>,
    scores: BTreeMap<String, Score>,
    error: Option<String>,
    limit: Option<LimitExceeded>,
) -> EvalSample {
    // a cancel or time limit may have interrupted a call between its
    // pending event and its completion
    transcript.complete_pending("cancelled");
    EvalSample {
        id: sample.id.clone(),
        epoch,
        uuid: uuid::Uuid::new_v4().to_string(),
        messages,
        events: transcript.events(),
        scores,
        error,
        limit,
        usage: limits.total_usage(),
        total_time: limits.wall_time().as_secs_f64(),
        working_time: limits.working_time().as_secs_f64(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use verdict_model::mock::{ScriptedApi, ScriptedStep};
    use verdict_model::ModelUsage;
    use verdict_tools::sandbox::LocalSandboxProvider;
    use verdict_tools::SandboxSpec;

    use crate::scorer::MatchScorer;
    use crate::solver::GenerateSolver;

    fn mock_model(api: ScriptedApi) -> Arc<Model> {
        Arc::new(Model::new(
            Arc::new(api),
            "mock/model",
            GenerateConfig::default(),
        ))
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // keep the sender alive for the duration of the test process
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn successful_sample_is_scored() {
        let sample = Sample::new("s1", "what is 6*7?", "42");
        let result = run_sample(
            &sample,
            1,
            mock_model(ScriptedApi::always_text("ANSWER: 42")),
            Arc::new(ToolRegistry::new()),
            Arc::new(GenerateSolver),
            &[Arc::new(MatchScorer::numeric()) as Arc<dyn Scorer>],
            &SampleOptions::default(),
            no_cancel(),
        )
        .await;

        assert!(result.error.is_none());
        assert!(result.limit.is_none());
        assert_eq!(result.scores["match"].value, 1.0);
        assert_eq!(result.usage.total_tokens, 20);
        // transcript is finalized: init, model, score — nothing pending
        assert!(result
            .events
            .iter()
            .all(|record| !record.event.is_pending()));
    }

    #[tokio::test]
    async fn solver_error_marks_sample_without_scores() {
        struct Explodes;
        #[async_trait]
        impl Solver for Explodes {
            fn name(&self) -> &str {
                "explodes"
            }
            async fn solve(&self, _state: &mut TaskState) -> anyhow::Result<()> {
                anyhow::bail!("solver exploded")
            }
        }

        let sample = Sample::new("s1", "q", "t");
        let result = run_sample(
            &sample,
            1,
            mock_model(ScriptedApi::always_text("unused")),
            Arc::new(ToolRegistry::new()),
            Arc::new(Explodes),
            &[Arc::new(MatchScorer::new()) as Arc<dyn Scorer>],
            &SampleOptions::default(),
            no_cancel(),
        )
        .await;

        assert!(result.error.as_deref().unwrap().contains("solver exploded"));
        assert!(result.scores.is_empty());
        assert!(result
            .events
            .iter()
            .any(|record| matches!(record.event, Event::Error { .. })));
    }

    #[tokio::test]
    async fn token_limit_terminates_sample_cleanly() {
        let sample = Sample::new("s1", "q", "42");
        let options = SampleOptions {
            limits: LimitsConfig {
                token_limit: Some(100),
                ..Default::default()
            },
            ..Default::default()
        };
        // two generates of 60 + 50 tokens; second crosses the limit
        struct TwoCalls;
        #[async_trait]
        impl Solver for TwoCalls {
            fn name(&self) -> &str {
                "two_calls"
            }
            async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()> {
                state.generate().await?;
                state.generate().await?;
                Ok(())
            }
        }

        let result = run_sample(
            &sample,
            1,
            mock_model(ScriptedApi::new(vec![
                ScriptedStep::text_with_usage("first", ModelUsage::new(40, 20)),
                ScriptedStep::text_with_usage("second", ModelUsage::new(30, 20)),
            ])),
            Arc::new(ToolRegistry::new()),
            Arc::new(TwoCalls),
            &[],
            &options,
            no_cancel(),
        )
        .await;

        assert!(result.error.is_none(), "limit is not an error: {result:?}");
        let limit = result.limit.expect("expected a limit");
        assert_eq!(limit.kind, LimitKind::Tokens);
        assert_eq!(limit.limit, 100.0);
        assert_eq!(limit.value, 110.0);
        assert!(result
            .events
            .iter()
            .any(|record| matches!(record.event, Event::SampleLimit { .. })));
    }

    #[tokio::test]
    async fn sandbox_lifecycle_with_staged_files() {
        let sample = Sample::new("s1", "q", "t")
            .with_sandbox(SandboxSpec::local())
            .with_file("input.txt", "payload");

        struct ReadsFile;
        #[async_trait]
        impl Solver for ReadsFile {
            fn name(&self) -> &str {
                "reads_file"
            }
            async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()> {
                let sandbox = state.sandbox.as_ref().unwrap();
                let bytes = sandbox
                    .read_file("input.txt")
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                state.store_set("file", serde_json::json!(String::from_utf8_lossy(&bytes)));
                Ok(())
            }
        }

        let options = SampleOptions {
            sandbox_provider: Some(Arc::new(LocalSandboxProvider)),
            ..Default::default()
        };
        let result = run_sample(
            &sample,
            1,
            mock_model(ScriptedApi::always_text("unused")),
            Arc::new(ToolRegistry::new()),
            Arc::new(ReadsFile),
            &[],
            &options,
            no_cancel(),
        )
        .await;

        assert!(result.error.is_none(), "{:?}", result.error);
        // init + teardown sandbox events
        let sandbox_events = result
            .events
            .iter()
            .filter(|r| matches!(r.event, Event::Sandbox { .. }))
            .count();
        assert_eq!(sandbox_events, 2);
    }

    #[tokio::test]
    async fn sandbox_without_provider_errors_sample() {
        let sample = Sample::new("s1", "q", "t").with_sandbox(SandboxSpec::local());
        let result = run_sample(
            &sample,
            1,
            mock_model(ScriptedApi::always_text("unused")),
            Arc::new(ToolRegistry::new()),
            Arc::new(GenerateSolver),
            &[],
            &SampleOptions::default(),
            no_cancel(),
        )
        .await;
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .contains("sandbox setup failed"));
    }

    #[tokio::test]
    async fn cancellation_marks_sample_cancelled() {
        struct Forever;
        #[async_trait]
        impl Solver for Forever {
            fn name(&self) -> &str {
                "forever"
            }
            async fn solve(&self, _state: &mut TaskState) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let (tx, rx) = watch::channel(false);
        let sample = Sample::new("s1", "q", "t");
        let handle = tokio::spawn({
            let sample = sample.clone();
            async move {
                run_sample(
                    &sample,
                    1,
                    mock_model(ScriptedApi::always_text("unused")),
                    Arc::new(ToolRegistry::new()),
                    Arc::new(Forever),
                    &[],
                    &SampleOptions::default(),
                    rx,
                )
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result.error.as_deref(), Some("cancelled"));
        assert!(result
            .events
            .iter()
            .any(|r| matches!(&r.event, Event::Error { error, .. } if error == "cancelled")));
    }

    #[tokio::test]
    async fn time_limit_is_reported_as_sample_limit() {
        struct Slow;
        #[async_trait]
        impl Solver for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn solve(&self, _state: &mut TaskState) -> anyhow::Result<()> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let sample = Sample::new("s1", "q", "t");
        let options = SampleOptions {
            limits: LimitsConfig {
                time_limit: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        tokio::time::pause();
        let result = run_sample(
            &sample,
            1,
            mock_model(ScriptedApi::always_text("unused")),
            Arc::new(ToolRegistry::new()),
            Arc::new(Slow),
            &[],
            &options,
            no_cancel(),
        )
        .await;
        assert_eq!(result.limit.unwrap().kind, LimitKind::Time);
        assert!(result.error.is_none());
    }
}
