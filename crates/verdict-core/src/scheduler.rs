// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use verdict_config::{EvalConfig, FailOnError};
use verdict_model::cache::ModelCache;
use verdict_model::GenerateConfig;
use verdict_tools::{CleanupPolicy, SandboxProvider, ToolRegistry};

use crate::generate::Model;
use crate::limits::LimitsConfig;
use crate::recorder::{EvalResults, EvalSpec, Recorder, TaskStatus};
use crate::runner::{run_sample, SampleOptions};
use crate::sample::{EvalSample, Sample};
use crate::scorer::{accuracy, reduce_scores, Score, Scorer};
use crate::solver::Solver;

/// A named bundle of dataset, solver, scorers, tools, and generate config.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub dataset: Vec<Sample>,
    pub solver: Arc<dyn Solver>,
    pub scorers: Vec<Arc<dyn Scorer>>,
    pub tools: Arc<ToolRegistry>,
    pub config: GenerateConfig,
}

/// Run-wide scheduling options.
pub struct EvalOptions {
    pub eval: EvalConfig,
    pub cache: Option<Arc<ModelCache>>,
    pub sandbox_provider: Option<Arc<dyn SandboxProvider>>,
    /// Bumped once per finished (or resumed-as-done) sample.
    pub progress: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            eval: EvalConfig::default(),
            cache: None,
            sandbox_provider: None,
            progress: None,
        }
    }
}

impl EvalOptions {
    fn sample_options(&self, task: &Task) -> SampleOptions {
        SampleOptions {
            limits: LimitsConfig {
                token_limit: self.eval.token_limit,
                message_limit: self.eval.message_limit,
                time_limit: self.eval.time_limit,
                working_limit: self.eval.working_limit,
                cost_limit: self.eval.cost_limit,
            },
            cache: self.cache.clone(),
            sandbox_provider: self.sandbox_provider.clone(),
            cleanup: if self.eval.no_sandbox_cleanup {
                CleanupPolicy::Never
            } else {
                CleanupPolicy::Always
            },
            config: task.config.clone(),
        }
    }

    fn bump_progress(&self) {
        if let Some(progress) = &self.progress {
            progress();
        }
    }
}

/// The outcome of one task.
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
    pub samples: Vec<EvalSample>,
    pub results: EvalResults,
    pub location: Option<String>,
}

/// Execute one task: fan its samples (× epochs) out over a bounded worker
/// pool, record every completed sample, and finalize results.
///
/// `sample_permits` bounds concurrently running samples; when several
/// tasks run at once they share one permit pool rather than multiplying
/// it.  The recorder is always flushed before this returns, on every
/// path.  Samples already durable in the recorder (an interrupted run
/// being resumed) are skipped with a progress bump.
pub async fn eval_task(
    task: Task,
    model: Arc<Model>,
    recorder: Arc<dyn Recorder>,
    options: Arc<EvalOptions>,
    cancel: watch::Receiver<bool>,
    sample_permits: Arc<Semaphore>,
) -> anyhow::Result<TaskResult> {
    let epochs = options.eval.epochs.max(1);
    let mut spec = EvalSpec::new(task.name.as_str(), model.name(), epochs);
    spec.config = serde_json::to_value(&task.config).unwrap_or_default();
    recorder.init(&spec).await?;

    // previously recorded samples count as done (resume)
    let mut samples: Vec<EvalSample> = recorder.read_samples().await?;
    let mut queue: Vec<(Sample, u32)> = Vec::new();
    for epoch in 1..=epochs {
        for sample in &task.dataset {
            if samples.iter().any(|s| s.id == sample.id && s.epoch == epoch) {
                debug!(task = %task.name, sample = %sample.id, epoch, "already recorded, skipping");
                options.bump_progress();
            } else {
                queue.push((sample.clone(), epoch));
            }
        }
    }
    let total = task.dataset.len() * epochs as usize;

    // per-task cancel overlay: triggered by the run-wide cancel and by the
    // fail-fast policy
    let (task_cancel_tx, task_cancel_rx) = watch::channel(false);
    let task_cancel_tx = Arc::new(task_cancel_tx);
    {
        let mut outer = cancel.clone();
        let forward = task_cancel_tx.clone();
        tokio::spawn(async move {
            loop {
                if *outer.borrow() {
                    let _ = forward.send(true);
                    break;
                }
                if outer.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    let sample_options = Arc::new(options.sample_options(&task));
    let fail_fast = matches!(options.eval.fail_on_error, FailOnError::Flag(true));

    let mut pool: JoinSet<EvalSample> = JoinSet::new();
    for (sample, epoch) in queue {
        let permits = sample_permits.clone();
        let model = model.clone();
        let tools = task.tools.clone();
        let solver = task.solver.clone();
        let scorers = task.scorers.clone();
        let sample_options = sample_options.clone();
        let cancel = task_cancel_rx.clone();
        pool.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("sample semaphore closed");
            run_sample(
                &sample,
                epoch,
                model,
                tools,
                solver,
                &scorers,
                &sample_options,
                cancel,
            )
            .await
        });
    }

    let mut errors = 0usize;
    while let Some(joined) = pool.join_next().await {
        let sample = match joined {
            Ok(sample) => sample,
            Err(err) => {
                // a panicking sample never produced an EvalSample; count it
                // as an error but keep the task going
                warn!(task = %task.name, "sample task panicked: {err}");
                errors += 1;
                continue;
            }
        };
        if sample.is_error() {
            errors += 1;
            if fail_fast {
                let _ = task_cancel_tx.send(true);
            }
        }
        if let Err(err) = recorder.record_sample(&sample).await {
            // a recorder that cannot write is fatal: cancel and surface
            let _ = task_cancel_tx.send(true);
            let _ = recorder.flush().await;
            return Err(err.context("recording sample"));
        }
        options.bump_progress();
        samples.push(sample);
    }

    // completion order across samples is nondeterministic; normalize
    samples.sort_by(|a, b| (a.id.clone(), a.epoch).cmp(&(b.id.clone(), b.epoch)));

    let cancelled = *cancel.borrow();
    let status = if cancelled {
        TaskStatus::Cancelled
    } else if options.eval.fail_on_error.exceeded(errors, total) {
        TaskStatus::Error
    } else {
        TaskStatus::Success
    };

    let results = build_results(&samples, total, status, &options.eval);
    recorder.record_results(&results).await?;
    recorder.flush().await?;
    let location = recorder.complete().await.ok();

    Ok(TaskResult {
        name: task.name,
        status,
        samples,
        results,
        location,
    })
}

/// Execute several tasks, at most `max_tasks` at a time, all competing for
/// one shared sample-concurrency budget.
pub async fn eval_tasks(
    tasks: Vec<(Task, Arc<dyn Recorder>)>,
    model: Arc<Model>,
    options: Arc<EvalOptions>,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<Vec<TaskResult>> {
    let max_samples = options
        .eval
        .max_samples
        .unwrap_or_else(|| model.api().max_connections());
    if let Some(max_subprocesses) = options.eval.max_subprocesses {
        verdict_tools::set_max_subprocesses(max_subprocesses);
    }
    let sample_permits = Arc::new(Semaphore::new(max_samples.max(1)));
    let task_permits = Arc::new(Semaphore::new(options.eval.max_tasks.max(1)));

    let mut pool: JoinSet<(usize, anyhow::Result<TaskResult>)> = JoinSet::new();
    for (index, (task, recorder)) in tasks.into_iter().enumerate() {
        let model = model.clone();
        let options = options.clone();
        let cancel = cancel.clone();
        let sample_permits = sample_permits.clone();
        let task_permits = task_permits.clone();
        pool.spawn(async move {
            let _permit = task_permits
                .acquire_owned()
                .await
                .expect("task semaphore closed");
            let result = eval_task(task, model, recorder, options, cancel, sample_permits).await;
            (index, result)
        });
    }

    let mut indexed: Vec<(usize, TaskResult)> = Vec::new();
    while let Some(joined) = pool.join_next().await {
        let (index, result) = joined.map_err(|err| anyhow::anyhow!("task panicked: {err}"))?;
        indexed.push((index, result?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, result)| result).collect())
}

/// Reduce per-epoch scores and aggregate usage into final results.
fn build_results(
    samples: &[EvalSample],
    total: usize,
    status: TaskStatus,
    eval: &EvalConfig,
) -> EvalResults {
    let reducer = eval.epochs_reducer.as_deref().unwrap_or("mean");

    // scorer -> sample id -> scores across epochs
    let mut by_scorer: BTreeMap<String, BTreeMap<String, Vec<Score>>> = BTreeMap::new();
    for sample in samples.iter().filter(|s| !s.is_error()) {
        for (scorer, score) in &sample.scores {
            by_scorer
                .entry(scorer.clone())
                .or_default()
                .entry(sample.id.clone())
                .or_default()
                .push(score.clone());
        }
    }

    let mut scores = BTreeMap::new();
    for (scorer, by_sample) in by_scorer {
        let reduced: Vec<Score> = by_sample
            .values()
            .filter_map(|epoch_scores| reduce_scores(reducer, epoch_scores))
            .collect();
        scores.insert(scorer, accuracy(&reduced));
    }

    // per-model totals: sum the usage of every completed (non-cache-read)
    // model event across all samples; this equals the sum of per-sample
    // usage since the sample accumulators record exactly those events
    let mut usage: BTreeMap<String, verdict_model::ModelUsage> = BTreeMap::new();
    for sample in samples {
        for record in &sample.events {
            if let crate::transcript::Event::Model {
                model,
                output: Some(output),
                cache,
                ..
            } = &record.event
            {
                if cache.as_deref() == Some("read") {
                    continue;
                }
                if let Some(event_usage) = output.usage {
                    *usage.entry(model.clone()).or_default() += event_usage;
                }
            }
        }
    }

    EvalResults {
        status,
        total_samples: total,
        completed_samples: samples.iter().filter(|s| !s.is_error()).count(),
        error_samples: samples.iter().filter(|s| s.is_error()).count(),
        limit_samples: samples.iter().filter(|s| s.limit.is_some()).count(),
        scores,
        usage,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use verdict_model::mock::MockApi;
    use verdict_model::ModelOutput;

    use crate::recorder::MemoryRecorder;
    use crate::scorer::MatchScorer;
    use crate::solver::{GenerateSolver, Solver, TaskState};

    fn mock_model(answer: &str) -> Arc<Model> {
        Arc::new(Model::new(
            Arc::new(MockApi::new(answer)),
            "mock/model",
            GenerateConfig::default(),
        ))
    }

    fn basic_task(n: usize) -> Task {
        Task {
            name: "basic".into(),
            dataset: (0..n)
                .map(|i| Sample::new(format!("s{i}"), "what is 6*7?", "42"))
                .collect(),
            solver: Arc::new(GenerateSolver),
            scorers: vec![Arc::new(MatchScorer::numeric()) as Arc<dyn Scorer>],
            tools: Arc::new(ToolRegistry::new()),
            config: GenerateConfig::default(),
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn basic_eval_scores_all_samples() {
        let recorder = Arc::new(MemoryRecorder::new());
        let result = eval_task(
            basic_task(3),
            mock_model("ANSWER: 42"),
            recorder.clone(),
            Arc::new(EvalOptions::default()),
            no_cancel(),
            Arc::new(Semaphore::new(4)),
        )
        .await
        .unwrap();

        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.samples.len(), 3);
        assert_eq!(result.results.error_samples, 0);
        assert!((result.results.scores["match"] - 1.0).abs() < 1e-9);
        assert!(recorder.completed());
        assert!(recorder.flushes() > 0);
    }

    struct FailForIds {
        ids: Vec<String>,
    }

    #[async_trait]
    impl Solver for FailForIds {
        fn name(&self) -> &str {
            "fail_for_ids"
        }
        async fn solve(&self, state: &mut TaskState) -> anyhow::Result<()> {
            if self.ids.contains(&state.sample_id) {
                anyhow::bail!("induced failure")
            }
            state.output = Some(ModelOutput::from_content("mock/model", "ANSWER: 42"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn fail_on_error_fraction_exceeded_marks_task_error() {
        let mut task = basic_task(10);
        task.solver = Arc::new(FailForIds {
            ids: vec!["s1".into(), "s4".into(), "s7".into()],
        });
        let options = EvalOptions {
            eval: EvalConfig {
                fail_on_error: FailOnError::Threshold(0.25),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = eval_task(
            task,
            mock_model("unused"),
            Arc::new(MemoryRecorder::new()),
            Arc::new(options),
            no_cancel(),
            Arc::new(Semaphore::new(4)),
        )
        .await
        .unwrap();

        // 3/10 > 0.25: task errors, but every sample was attempted and the
        // healthy seven were scored
        assert_eq!(result.status, TaskStatus::Error);
        assert_eq!(result.samples.len(), 10);
        assert_eq!(result.results.error_samples, 3);
        assert_eq!(result.results.completed_samples, 7);
        let scored = result
            .samples
            .iter()
            .filter(|s| !s.scores.is_empty())
            .count();
        assert_eq!(scored, 7);
    }

    #[tokio::test]
    async fn fail_on_error_fraction_within_threshold_is_success() {
        let mut task = basic_task(10);
        task.solver = Arc::new(FailForIds {
            ids: vec!["s1".into(), "s4".into()],
        });
        let options = EvalOptions {
            eval: EvalConfig {
                fail_on_error: FailOnError::Threshold(0.25),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = eval_task(
            task,
            mock_model("unused"),
            Arc::new(MemoryRecorder::new()),
            Arc::new(options),
            no_cancel(),
            Arc::new(Semaphore::new(4)),
        )
        .await
        .unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.results.error_samples, 2);
    }

    #[tokio::test]
    async fn epochs_fan_out_and_reduce() {
        let task = basic_task(2);
        let options = EvalOptions {
            eval: EvalConfig {
                epochs: 3,
                epochs_reducer: Some("mean".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let result = eval_task(
            task,
            mock_model("ANSWER: 42"),
            Arc::new(MemoryRecorder::new()),
            Arc::new(options),
            no_cancel(),
            Arc::new(Semaphore::new(4)),
        )
        .await
        .unwrap();

        assert_eq!(result.samples.len(), 6);
        // each sample id appears once per epoch
        for id in ["s0", "s1"] {
            let epochs: Vec<u32> = result
                .samples
                .iter()
                .filter(|s| s.id == id)
                .map(|s| s.epoch)
                .collect();
            assert_eq!(epochs, [1, 2, 3]);
        }
        assert!((result.results.scores["match"] - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn resume_skips_recorded_samples() {
        let recorder = Arc::new(MemoryRecorder::new());
        let task = basic_task(3);

        // simulate a prior run that already finished s0
        let prior = run_sample(
            &task.dataset[0],
            1,
            mock_model("ANSWER: 42"),
            task.tools.clone(),
            task.solver.clone(),
            &task.scorers,
            &SampleOptions::default(),
            no_cancel(),
        )
        .await;
        recorder.preload(vec![prior]);

        let progress_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = progress_count.clone();
        let options = EvalOptions {
            progress: Some(Arc::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let result = eval_task(
            task,
            mock_model("ANSWER: 42"),
            recorder.clone(),
            Arc::new(options),
            no_cancel(),
            Arc::new(Semaphore::new(4)),
        )
        .await
        .unwrap();

        // all three samples present, progress bumped for skip + 2 runs
        assert_eq!(result.samples.len(), 3);
        assert_eq!(
            progress_count.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
        // only two freshly recorded
        assert_eq!(recorder.read_samples().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn max_samples_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct TrackPeak {
            current: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Solver for TrackPeak {
            fn name(&self) -> &str {
                "track_peak"
            }
            async fn solve(&self, _state: &mut TaskState) -> anyhow::Result<()> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut task = basic_task(8);
        task.solver = Arc::new(TrackPeak {
            current: current.clone(),
            peak: peak.clone(),
        });
        task.scorers = vec![];

        eval_task(
            task,
            mock_model("unused"),
            Arc::new(MemoryRecorder::new()),
            Arc::new(EvalOptions::default()),
            no_cancel(),
            Arc::new(Semaphore::new(2)),
        )
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn eval_tasks_share_sample_budget_and_preserve_order() {
        let tasks: Vec<(Task, Arc<dyn Recorder>)> = vec![
            (
                Task {
                    name: "alpha".into(),
                    ..basic_task(2)
                },
                Arc::new(MemoryRecorder::new()),
            ),
            (
                Task {
                    name: "beta".into(),
                    ..basic_task(2)
                },
                Arc::new(MemoryRecorder::new()),
            ),
        ];
        let options = EvalOptions {
            eval: EvalConfig {
                max_tasks: 2,
                max_samples: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let results = eval_tasks(
            tasks,
            mock_model("ANSWER: 42"),
            Arc::new(options),
            no_cancel(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "alpha");
        assert_eq!(results[1].name, "beta");
        assert!(results.iter().all(|r| r.status == TaskStatus::Success));
    }

    #[tokio::test]
    async fn cancellation_cancels_in_flight_samples_and_flushes() {
        struct Slow;
        #[async_trait]
        impl Solver for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn solve(&self, _state: &mut TaskState) -> anyhow::Result<()> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            }
        }

        let mut task = basic_task(2);
        task.solver = Arc::new(Slow);
        task.scorers = vec![];
        let recorder = Arc::new(MemoryRecorder::new());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(eval_task(
            task,
            mock_model("unused"),
            recorder.clone(),
            Arc::new(EvalOptions::default()),
            rx,
            Arc::new(Semaphore::new(4)),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        // in-flight samples were marked cancelled in their transcripts
        assert!(result
            .samples
            .iter()
            .all(|s| s.error.as_deref() == Some("cancelled")));
        assert!(recorder.flushes() > 0);
    }
}
