// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_epochs() -> u32 {
    1
}

fn default_max_tasks() -> usize {
    1
}

fn default_max_scan_tasks() -> usize {
    4
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub eval: EvalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

/// How many sample failures a task tolerates before the task itself fails.
///
/// ```yaml
/// eval:
///   fail_on_error: true      # any failure fails the task
///   fail_on_error: false     # tolerate all failures
///   fail_on_error: 0.1       # fail when >10% of samples error
///   fail_on_error: 5         # fail at the 5th errored sample
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailOnError {
    Flag(bool),
    Threshold(f64),
}

impl Default for FailOnError {
    fn default() -> Self {
        Self::Flag(true)
    }
}

impl FailOnError {
    /// Whether `errors` failures out of `total` samples cross the threshold.
    ///
    /// A fractional threshold (0 < f < 1) is a tolerated *fraction* of the
    /// dataset; a threshold ≥ 1 is an absolute count.
    pub fn exceeded(&self, errors: usize, total: usize) -> bool {
        if errors == 0 {
            return false;
        }
        match *self {
            Self::Flag(fail) => fail,
            Self::Threshold(t) if t < 1.0 => {
                total > 0 && (errors as f64 / total as f64) > t
            }
            Self::Threshold(t) => errors as f64 >= t,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Maximum number of samples running concurrently.  Defaults to
    /// `max_connections` of the active model when unset.
    pub max_samples: Option<usize>,
    /// Maximum number of tasks running concurrently.  Tasks share the
    /// sample-concurrency budget rather than multiplying it.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    /// Ceiling on concurrent sandbox subprocess executions.
    pub max_subprocesses: Option<usize>,
    /// Per-model-endpoint connection limit.  Overrides the provider default.
    pub max_connections: Option<usize>,
    /// Number of times the dataset is repeated; each repetition gets a
    /// distinct epoch id and scores are reduced per sample afterwards.
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    /// Reducer applied to a sample's scores across epochs:
    /// "mean" | "median" | "mode" | "max" | "at_least_<k>".
    pub epochs_reducer: Option<String>,
    #[serde(default)]
    pub fail_on_error: FailOnError,
    /// Per-sample token budget.
    pub token_limit: Option<u64>,
    /// Per-sample message budget.
    pub message_limit: Option<u64>,
    /// Per-sample wall-clock budget in seconds.
    pub time_limit: Option<u64>,
    /// Per-sample working-time budget in seconds (wall time minus time
    /// spent waiting on retries and rate limits).
    pub working_limit: Option<u64>,
    /// Per-sample cost budget in dollars.
    pub cost_limit: Option<f64>,
    /// Skip sandbox teardown after each sample (debugging aid).
    #[serde(default)]
    pub no_sandbox_cleanup: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            max_samples: None,
            max_tasks: default_max_tasks(),
            max_subprocesses: None,
            max_connections: None,
            epochs: default_epochs(),
            epochs_reducer: None,
            fail_on_error: FailOnError::default(),
            token_limit: None,
            message_limit: None,
            time_limit: None,
            working_limit: None,
            cost_limit: None,
            no_sandbox_cleanup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the on-disk generate cache.
    #[serde(default)]
    pub enabled: bool,
    /// Cache directory override.  Defaults to the platform cache dir
    /// (`~/.cache/verdict` on Linux).
    pub dir: Option<std::path::PathBuf>,
    /// Entries older than this are removed by `verdict cache prune`,
    /// e.g. "1week", "30days".
    pub expiry: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            expiry: Some("1week".to_string()),
        }
    }
}

impl CacheConfig {
    /// Parsed expiry duration, when configured and valid.
    pub fn expiry_duration(&self) -> Option<std::time::Duration> {
        self.expiry
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory where eval logs are written.
    #[serde(default = "default_log_dir")]
    pub dir: std::path::PathBuf,
    /// Log file format: "eval" (compact binary container) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Buffer this many sample records before flushing to disk.
    pub buffer: Option<usize>,
    /// Include sample events in the persisted log.
    #[serde(default = "default_true")]
    pub log_samples: bool,
}

fn default_log_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("./logs")
}

fn default_log_format() -> String {
    "eval".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            format: default_log_format(),
            buffer: None,
            log_samples: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory where scan result directories are created.
    #[serde(default = "default_scans_dir")]
    pub dir: std::path::PathBuf,
    /// Maximum concurrent scanner workers.
    #[serde(default = "default_max_scan_tasks")]
    pub max_tasks: usize,
    /// Bound on the scanner work queue; the producer blocks when full.
    /// Defaults to `max_tasks` when unset.
    pub max_queue_size: Option<usize>,
}

fn default_scans_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("./scans")
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            dir: default_scans_dir(),
            max_tasks: default_max_scan_tasks(),
            max_queue_size: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
