// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod convert;
mod document;
mod eval_file;
mod json_file;
mod list;

pub use convert::{convert, read_document};
pub use document::{LogDocument, SampleSummary, LOG_VERSION};
pub use eval_file::EvalRecorder;
pub use json_file::JsonRecorder;
pub use list::{list_logs, read_log, LogEntry};

use std::sync::Arc;

use verdict_core::Recorder;

/// Recorder for `location` chosen by format name ("eval" or "json").
pub fn recorder_for_format(
    format: &str,
    location: &std::path::Path,
) -> anyhow::Result<Arc<dyn Recorder>> {
    match format {
        "eval" => Ok(Arc::new(EvalRecorder::new(location))),
        "json" => Ok(Arc::new(JsonRecorder::new(location))),
        other => anyhow::bail!("unknown log format: {other} (expected 'eval' or 'json')"),
    }
}

/// File extension for a log format.
pub fn extension_for_format(format: &str) -> &'static str {
    if format == "json" {
        "json"
    } else {
        "eval"
    }
}
