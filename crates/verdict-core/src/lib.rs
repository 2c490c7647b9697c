// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod generate;
pub mod limits;
pub mod recorder;
pub mod runner;
pub mod sample;
pub mod scheduler;
pub mod scorer;
pub mod solver;
pub mod tool_exec;
pub mod transcript;

pub use generate::{GenerateContext, GenerateInput, Model};
pub use limits::{LimitExceeded, LimitKind, LimitsConfig, SampleLimits};
pub use recorder::{EvalResults, EvalSpec, Recorder, TaskStatus};
pub use runner::{run_sample, SampleOptions};
pub use sample::{EvalSample, Sample};
pub use scheduler::{eval_tasks, EvalOptions, Task, TaskResult};
pub use scorer::{accuracy, reduce_scores, MatchScorer, Score, Scorer};
pub use solver::{chain, GenerateSolver, Solver, TaskState, ToolLoopSolver};
pub use tool_exec::execute_tools;
pub use transcript::{Event, EventRecord, Transcript};
