// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

// ── Exit codes ────────────────────────────────────────────────────────────────

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

// ── Top level ─────────────────────────────────────────────────────────────────

/// A concurrent evaluation harness for language-model tasks.
#[derive(Parser, Debug)]
#[command(name = "verdict", version, about, max_term_width = 100)]
pub struct Cli {
    /// Path to an explicit config file (otherwise the standard search
    /// paths are merged).
    #[arg(long, short = 'c', global = true, env = "VERDICT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase stderr log verbosity (-v debug, -vv trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Built-in solver selection for `verdict eval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SolverArg {
    /// Single model call over the sample input.
    #[default]
    Generate,
    /// Generate/tool loop until the model answers in text.
    ToolLoop,
}

/// Built-in scorer selection for `verdict eval` / `verdict score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ScorerArg {
    /// Target must appear in the completion text.
    #[default]
    Match,
    /// Last number in the completion must equal the numeric target.
    MatchNumeric,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task: drive every dataset sample through the model, score
    /// the outputs, and write a structured log.
    ///
    /// The dataset is a YAML list of samples:
    ///
    ///   - id: s1
    ///     input: "What is 6*7?"
    ///     target: "42"
    ///
    /// Exit code is 0 when the task succeeds, 1 when it errors or any
    /// sample fails under the configured fail-on-error policy.
    Eval {
        /// Task name recorded in the log.
        #[arg(long, default_value = "task", env = "VERDICT_TASK")]
        task: String,
        /// Dataset file (YAML list of {id, input, target, files?}).
        #[arg(long, env = "VERDICT_DATASET")]
        dataset: PathBuf,
        /// Model as provider/name, e.g. mock/model.
        #[arg(long, env = "VERDICT_MODEL")]
        model: String,
        /// Extra provider args as inline JSON.
        #[arg(long, env = "VERDICT_MODEL_ARGS")]
        model_args: Option<String>,
        #[arg(long, value_enum, default_value_t = SolverArg::Generate, env = "VERDICT_SOLVER")]
        solver: SolverArg,
        #[arg(long, value_enum, default_value_t = ScorerArg::Match, env = "VERDICT_SCORER")]
        scorer: ScorerArg,
        /// Repeat the dataset this many times, reducing scores per sample.
        #[arg(long, env = "VERDICT_EPOCHS")]
        epochs: Option<u32>,
        /// Reducer across epochs: mean|median|mode|max|at_least_<k>.
        #[arg(long, env = "VERDICT_EPOCHS_REDUCER")]
        epochs_reducer: Option<String>,
        /// Max concurrently running samples.
        #[arg(long, env = "VERDICT_MAX_SAMPLES")]
        max_samples: Option<usize>,
        /// Per-model-endpoint connection limit.
        #[arg(long, env = "VERDICT_MAX_CONNECTIONS")]
        max_connections: Option<usize>,
        /// Per-sample token budget.
        #[arg(long, env = "VERDICT_TOKEN_LIMIT")]
        token_limit: Option<u64>,
        /// Per-sample message budget.
        #[arg(long, env = "VERDICT_MESSAGE_LIMIT")]
        message_limit: Option<u64>,
        /// Per-sample wall-clock budget in seconds.
        #[arg(long, env = "VERDICT_TIME_LIMIT")]
        time_limit: Option<u64>,
        /// Per-sample working-time budget in seconds.
        #[arg(long, env = "VERDICT_WORKING_LIMIT")]
        working_limit: Option<u64>,
        /// true | false | fraction (0..1) | absolute count.
        #[arg(long, env = "VERDICT_FAIL_ON_ERROR")]
        fail_on_error: Option<String>,
        /// Enable the on-disk generate cache.
        #[arg(long, env = "VERDICT_CACHE")]
        cache: bool,
        /// Keep sandboxes after each sample (debugging aid).
        #[arg(long, env = "VERDICT_NO_SANDBOX_CLEANUP")]
        no_sandbox_cleanup: bool,
        /// Directory for eval logs.
        #[arg(long, env = "VERDICT_LOG_DIR")]
        log_dir: Option<PathBuf>,
        /// Log format: eval (binary container) or json.
        #[arg(long, env = "VERDICT_LOG_FORMAT")]
        log_format: Option<String>,
        /// Write (or retry into) this exact log file instead of a fresh
        /// one; samples already recorded there are skipped.
        #[arg(long, env = "VERDICT_LOG")]
        log: Option<PathBuf>,
    },

    /// Re-score a completed log with a built-in scorer and print the
    /// updated accuracy.
    Score {
        /// Log file (.eval or .json).
        log: PathBuf,
        #[arg(long, value_enum, default_value_t = ScorerArg::Match)]
        scorer: ScorerArg,
    },

    /// Apply scanners to completed transcripts, writing per-scanner
    /// result tables under the scans directory.
    Scan {
        /// Scan name recorded in the scan spec.
        #[arg(long, default_value = "scan", env = "VERDICT_SCAN_NAME")]
        name: String,
        /// Log directory holding the transcripts to scan.
        #[arg(long, env = "VERDICT_LOG_DIR")]
        log_dir: Option<PathBuf>,
        /// Scanner to apply (repeatable), as name or name=params-json.
        #[arg(long = "scanner", required = true)]
        scanners: Vec<String>,
        /// Directory where the scan directory is created.
        #[arg(long, env = "VERDICT_SCAN_DIR")]
        scan_dir: Option<PathBuf>,
        /// Maximum concurrent scan workers.
        #[arg(long, env = "VERDICT_SCAN_MAX_TASKS")]
        max_tasks: Option<usize>,
        /// Work queue bound (defaults to max-tasks).
        #[arg(long, env = "VERDICT_SCAN_MAX_QUEUE_SIZE")]
        max_queue_size: Option<usize>,
        /// Read at most this many transcripts.
        #[arg(long)]
        limit: Option<usize>,
        /// Shuffle transcript order with this seed.
        #[arg(long)]
        shuffle: Option<u64>,
    },

    /// Resume an interrupted scan from its directory.  Completed work is
    /// skipped; a finished scan resumes as a no-op.
    ScanResume {
        /// The scan directory ({timestamp}_{name}_{id}).
        scan: PathBuf,
    },

    /// Inspect eval logs.
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },

    /// Manage the generate cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogCommands {
    /// List logs in the log directory, newest first.
    List {
        #[arg(long, env = "VERDICT_LOG_DIR")]
        log_dir: Option<PathBuf>,
        /// Print full JSON entries instead of one line each.
        #[arg(long)]
        json: bool,
    },
    /// Print one log as JSON.
    Dump {
        log: PathBuf,
        /// Only print the header (spec + results).
        #[arg(long)]
        header_only: bool,
    },
    /// Convert a log between the eval and json formats.
    Convert { src: PathBuf, dst: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Remove cached generate entries (for one model, or everything).
    Clear {
        /// Only clear entries for this model (provider/name).
        #[arg(long)]
        model: Option<String>,
    },
    /// Remove entries older than the configured expiry.
    Prune {
        /// Override the expiry, e.g. "30days".
        #[arg(long)]
        expiry: Option<String>,
    },
    /// List cached entries per model.
    List,
    /// Print the cache directory path.
    Path,
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
