// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{
    CacheCommands, Cli, Commands, LogCommands, ScorerArg, SolverArg, EXIT_FAILURE, EXIT_SUCCESS,
};
use verdict_config::{Config, FailOnError};
use verdict_core::{
    eval_tasks, EvalOptions, GenerateSolver, MatchScorer, Sample, Scorer, Solver, Task,
    TaskStatus, ToolLoopSolver,
};
use verdict_model::{cache::ModelCache, GenerateConfig};
use verdict_scan::{
    register_scanner, ContentFilter, ScanOptions, ScanResult, ScanScanner, ScanTranscript,
    Scanner, TranscriptContent, Transcripts,
};
use verdict_tools::{sandbox::LocalSandboxProvider, ToolRegistry};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    register_builtin_scanners();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = verdict_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(EXIT_SUCCESS)
        }
        command @ Commands::Eval { .. } => run_eval(command, config).await,
        Commands::Score { log, scorer } => run_score(&log, scorer),
        Commands::Scan {
            name,
            log_dir,
            scanners,
            scan_dir,
            max_tasks,
            max_queue_size,
            limit,
            shuffle,
        } => {
            let log_dir = log_dir.unwrap_or_else(|| config.log.dir.clone());
            let scan_dir = scan_dir.unwrap_or_else(|| config.scan.dir.clone());
            let options = ScanOptions {
                max_tasks: max_tasks.unwrap_or(config.scan.max_tasks),
                max_queue_size: max_queue_size.or(config.scan.max_queue_size),
                limit,
                shuffle,
            };
            let scanners = parse_scanner_args(&scanners)?;
            let transcripts = Transcripts::from_logs(&log_dir)?;
            let results =
                verdict_scan::scan(&name, transcripts, &scanners, &scan_dir, &options, None)
                    .await?;
            print_scan_results(&results);
            Ok(EXIT_SUCCESS)
        }
        Commands::ScanResume { scan } => {
            let results = verdict_scan::scan_resume(&scan, None).await?;
            print_scan_results(&results);
            Ok(EXIT_SUCCESS)
        }
        Commands::Log { command } => run_log(command, &config).await,
        Commands::Cache { command } => run_cache(command, &config),
    }
}

// ── eval ──────────────────────────────────────────────────────────────────────

/// Dataset file entry: one sample to run.
#[derive(Debug, Deserialize)]
struct DatasetSample {
    id: String,
    input: String,
    target: String,
    #[serde(default)]
    files: BTreeMap<String, String>,
    #[serde(default)]
    sandbox: Option<String>,
}

async fn run_eval(command: Commands, mut config: Config) -> anyhow::Result<i32> {
    let Commands::Eval {
        task,
        dataset,
        model,
        model_args,
        solver,
        scorer,
        epochs,
        epochs_reducer,
        max_samples,
        max_connections,
        token_limit,
        message_limit,
        time_limit,
        working_limit,
        fail_on_error,
        cache,
        no_sandbox_cleanup,
        log_dir,
        log_format,
        log,
    } = command
    else {
        unreachable!("run_eval dispatched for a non-eval command")
    };

    // CLI flags override config-file (and env-derived) settings
    if let Some(v) = epochs {
        config.eval.epochs = v;
    }
    if epochs_reducer.is_some() {
        config.eval.epochs_reducer = epochs_reducer;
    }
    if max_samples.is_some() {
        config.eval.max_samples = max_samples;
    }
    if max_connections.is_some() {
        config.eval.max_connections = max_connections;
    }
    if token_limit.is_some() {
        config.eval.token_limit = token_limit;
    }
    if message_limit.is_some() {
        config.eval.message_limit = message_limit;
    }
    if time_limit.is_some() {
        config.eval.time_limit = time_limit;
    }
    if working_limit.is_some() {
        config.eval.working_limit = working_limit;
    }
    if let Some(raw) = fail_on_error {
        config.eval.fail_on_error = parse_fail_on_error(&raw)?;
    }
    if no_sandbox_cleanup {
        config.eval.no_sandbox_cleanup = true;
    }
    if cache {
        config.cache.enabled = true;
    }
    if let Some(dir) = log_dir {
        config.log.dir = dir;
    }
    if let Some(format) = log_format {
        config.log.format = format;
    }

    // dataset
    let text = std::fs::read_to_string(&dataset)
        .with_context(|| format!("reading dataset {}", dataset.display()))?;
    let entries: Vec<DatasetSample> = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing dataset {}", dataset.display()))?;
    if entries.is_empty() {
        anyhow::bail!("dataset {} has no samples", dataset.display());
    }
    let samples: Vec<Sample> = entries
        .into_iter()
        .map(|entry| {
            let mut sample = Sample::new(entry.id, entry.input, entry.target);
            for (path, contents) in entry.files {
                sample = sample.with_file(path, contents);
            }
            if let Some(kind) = entry.sandbox {
                sample = sample.with_sandbox(verdict_tools::SandboxSpec {
                    kind,
                    options: serde_json::Value::Null,
                });
            }
            sample
        })
        .collect();

    // model
    let model_args: serde_json::Value = match model_args {
        Some(raw) => serde_json::from_str(&raw).context("parsing --model-args")?,
        None => serde_json::json!({}),
    };
    let api = verdict_model::get_api(&model, &model_args)?;
    let generate_config = GenerateConfig {
        max_connections: config.eval.max_connections,
        cache: Some(config.cache.enabled),
        ..Default::default()
    };
    let model = Arc::new(verdict_core::Model::new(api, &model, generate_config));

    let solver: Arc<dyn Solver> = match solver {
        SolverArg::Generate => Arc::new(GenerateSolver),
        SolverArg::ToolLoop => Arc::new(ToolLoopSolver),
    };
    let scorer: Arc<dyn Scorer> = match scorer {
        ScorerArg::Match => Arc::new(MatchScorer::new()),
        ScorerArg::MatchNumeric => Arc::new(MatchScorer::numeric()),
    };

    let task = Task {
        name: task,
        dataset: samples,
        solver,
        scorers: vec![scorer],
        tools: Arc::new(ToolRegistry::new()),
        config: GenerateConfig::default(),
    };

    // recorder; --log retries an interrupted run into the same file
    let location = match log {
        Some(location) => {
            if let Some(ext) = location.extension().and_then(|e| e.to_str()) {
                config.log.format = ext.to_string();
            }
            location
        }
        None => {
            let extension = verdict_log::extension_for_format(&config.log.format);
            config.log.dir.join(format!(
                "{}_{}_{}.{extension}",
                chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S"),
                task.name,
                &uuid::Uuid::new_v4().simple().to_string()[..8],
            ))
        }
    };
    let recorder = verdict_log::recorder_for_format(&config.log.format, &location)?;

    let model_cache = config.cache.enabled.then(|| {
        Arc::new(ModelCache::new(
            config
                .cache
                .dir
                .clone()
                .unwrap_or_else(ModelCache::default_dir),
        ))
    });

    let options = Arc::new(EvalOptions {
        eval: config.eval.clone(),
        cache: model_cache,
        sandbox_provider: Some(Arc::new(LocalSandboxProvider)),
        progress: None,
    });

    // ctrl-c cancels the run; in-flight samples are marked cancelled and
    // the recorder is flushed before exit
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let results = eval_tasks(vec![(task, recorder)], model, options, cancel_rx).await?;
    let mut all_success = true;
    for result in &results {
        print_task_result(result);
        if result.status != TaskStatus::Success {
            all_success = false;
        }
    }
    Ok(if all_success { EXIT_SUCCESS } else { EXIT_FAILURE })
}

fn parse_fail_on_error(raw: &str) -> anyhow::Result<FailOnError> {
    if let Ok(flag) = raw.parse::<bool>() {
        return Ok(FailOnError::Flag(flag));
    }
    if let Ok(threshold) = raw.parse::<f64>() {
        return Ok(FailOnError::Threshold(threshold));
    }
    anyhow::bail!("--fail-on-error must be true, false, or a number (got '{raw}')")
}

fn print_task_result(result: &verdict_core::TaskResult) {
    for sample in result.samples.iter().filter(|s| s.is_error()) {
        println!("FAILED  {}", sample.summary());
    }
    for sample in result.samples.iter().filter(|s| s.limit.is_some()) {
        println!("LIMIT   {}", sample.summary());
    }

    let results = &result.results;
    println!("─── {} ───", result.name);
    println!("  status:   {:?}", result.status);
    println!(
        "  samples:  {} total, {} completed, {} errors, {} limits",
        results.total_samples,
        results.completed_samples,
        results.error_samples,
        results.limit_samples
    );
    for (scorer, accuracy) in &results.scores {
        println!("  {scorer}:    {accuracy:.3}");
    }
    for (model, usage) in &results.usage {
        println!(
            "  {model}: {} input + {} output = {} tokens",
            usage.input_tokens, usage.output_tokens, usage.total_tokens
        );
    }
    if let Some(location) = &result.location {
        println!("  log:      {location}");
    }
}

// ── score ─────────────────────────────────────────────────────────────────────

fn run_score(log: &Path, scorer: ScorerArg) -> anyhow::Result<i32> {
    let document = verdict_log::read_log(log)?;
    let scorer = match scorer {
        ScorerArg::Match => MatchScorer::new(),
        ScorerArg::MatchNumeric => MatchScorer::numeric(),
    };

    let mut scores = Vec::new();
    for sample in &document.samples {
        if sample.is_error() {
            continue;
        }
        // the target travels in the sample's init event
        let target = sample.events.iter().find_map(|record| match &record.event {
            verdict_core::Event::SampleInit { target, .. } => Some(target.clone()),
            _ => None,
        });
        let Some(target) = target else { continue };
        let completion = sample
            .messages
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .map(|m| m.text())
            .unwrap_or_default();
        let score = scorer.score_completion(&completion, &target)?;
        println!(
            "sample {} (epoch {}): {}",
            sample.id, sample.epoch, score.value
        );
        scores.push(score);
    }

    println!(
        "accuracy: {:.3} ({} samples)",
        verdict_core::accuracy(&scores),
        scores.len()
    );
    Ok(EXIT_SUCCESS)
}

// ── scan ──────────────────────────────────────────────────────────────────────

/// Parse `--scanner name` / `--scanner name={json}` arguments.
fn parse_scanner_args(args: &[String]) -> anyhow::Result<Vec<ScanScanner>> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((name, params)) => Ok(ScanScanner {
                name: name.to_string(),
                params: serde_json::from_str(params)
                    .with_context(|| format!("parsing params for scanner '{name}'"))?,
            }),
            None => Ok(ScanScanner {
                name: arg.clone(),
                params: serde_json::json!({}),
            }),
        })
        .collect()
}

fn print_scan_results(results: &verdict_scan::ScanResults) {
    println!("─── scan {} ───", results.spec.scan_name);
    for (scanner, rows) in &results.scanners {
        println!("  {scanner}: {} rows", rows.len());
    }
    println!("  location: {}", results.location.display());
}

/// Scanner counting the messages of each transcript.
struct MessageCountScanner;

#[async_trait]
impl Scanner for MessageCountScanner {
    fn name(&self) -> &str {
        "message_count"
    }

    async fn scan(&self, transcript: &ScanTranscript) -> anyhow::Result<Vec<ScanResult>> {
        Ok(vec![ScanResult::value(transcript.messages.len() as u64)])
    }
}

/// Scanner emitting one row per errored tool call.
struct ToolErrorScanner;

#[async_trait]
impl Scanner for ToolErrorScanner {
    fn name(&self) -> &str {
        "tool_errors"
    }

    fn content(&self) -> TranscriptContent {
        TranscriptContent {
            messages: ContentFilter::None,
            events: ContentFilter::only(&["tool"]),
        }
    }

    async fn scan(&self, transcript: &ScanTranscript) -> anyhow::Result<Vec<ScanResult>> {
        let mut rows = Vec::new();
        for record in &transcript.events {
            if let verdict_core::Event::Tool {
                call,
                error: Some(error),
                ..
            } = &record.event
            {
                let mut row = ScanResult::value(error.message.clone());
                row.metadata
                    .insert("function".into(), serde_json::json!(call.function));
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

fn register_builtin_scanners() {
    register_scanner(
        "message_count",
        Arc::new(|_| Ok(Arc::new(MessageCountScanner))),
    );
    register_scanner("tool_errors", Arc::new(|_| Ok(Arc::new(ToolErrorScanner))));
}

// ── log ───────────────────────────────────────────────────────────────────────

async fn run_log(command: LogCommands, config: &Config) -> anyhow::Result<i32> {
    match command {
        LogCommands::List { log_dir, json } => {
            let dir = log_dir.unwrap_or_else(|| config.log.dir.clone());
            for entry in verdict_log::list_logs(&dir)? {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "path": entry.path,
                            "task": entry.spec.task_name,
                            "model": entry.spec.model,
                            "created": entry.spec.created,
                            "status": entry.status,
                            "samples": entry.samples,
                        })
                    );
                } else {
                    let status = entry
                        .status
                        .map(|s| format!("{s:?}").to_lowercase())
                        .unwrap_or_else(|| "running".to_string());
                    println!(
                        "{}  {}  {}  {} samples  [{}]",
                        entry.spec.created.format("%Y-%m-%d %H:%M:%S"),
                        entry.spec.task_name,
                        entry.spec.model,
                        entry.samples,
                        status
                    );
                }
            }
            Ok(EXIT_SUCCESS)
        }
        LogCommands::Dump { log, header_only } => {
            let mut document = verdict_log::read_log(&log)?;
            if header_only {
                document.samples.clear();
            }
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(EXIT_SUCCESS)
        }
        LogCommands::Convert { src, dst } => {
            verdict_log::convert(&src, &dst).await?;
            println!("converted {} -> {}", src.display(), dst.display());
            Ok(EXIT_SUCCESS)
        }
    }
}

// ── cache ─────────────────────────────────────────────────────────────────────

fn run_cache(command: CacheCommands, config: &Config) -> anyhow::Result<i32> {
    let cache = ModelCache::new(
        config
            .cache
            .dir
            .clone()
            .unwrap_or_else(ModelCache::default_dir),
    );
    match command {
        CacheCommands::Clear { model } => {
            cache.clear(model.as_deref().unwrap_or(""))?;
            println!("cache cleared");
        }
        CacheCommands::Prune { expiry } => {
            let expiry = match expiry {
                Some(raw) => humantime::parse_duration(&raw).context("parsing --expiry")?,
                None => config
                    .cache
                    .expiry_duration()
                    .ok_or_else(|| anyhow::anyhow!("no cache expiry configured"))?,
            };
            let removed = cache.prune(expiry)?;
            println!("pruned {removed} entries");
        }
        CacheCommands::List => {
            let mut by_model: BTreeMap<String, usize> = BTreeMap::new();
            for (_path, model) in cache.list()? {
                *by_model.entry(model).or_default() += 1;
            }
            for (model, count) in by_model {
                println!("{model}: {count} entries");
            }
        }
        CacheCommands::Path => {
            println!("{}", cache.dir().display());
        }
    }
    Ok(EXIT_SUCCESS)
}

// ── logging ───────────────────────────────────────────────────────────────────

fn init_logging(verbosity: u8) {
    // VERDICT_LOG_FILE routes logs to a file (useful when stdout is being
    // piped); otherwise stderr with a level from --verbose, both
    // overridable via RUST_LOG.
    if let Ok(log_path) = std::env::var("VERDICT_LOG_FILE") {
        use std::sync::Mutex;
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
            let _ = tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .with(filter)
                .try_init();
            return;
        }
    }

    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
