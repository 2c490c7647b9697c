// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use crate::document::LogDocument;
use crate::{EvalRecorder, JsonRecorder};

fn format_of(path: &Path) -> anyhow::Result<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("eval") => Ok("eval"),
        Some("json") => Ok("json"),
        other => anyhow::bail!(
            "cannot infer log format from extension {:?} of {}",
            other,
            path.display()
        ),
    }
}

/// Read a log in either format.
pub fn read_document(path: &Path) -> anyhow::Result<LogDocument> {
    match format_of(path)? {
        "eval" => EvalRecorder::read(path),
        _ => JsonRecorder::read(path),
    }
}

/// Translate a log between the `eval` and `json` formats.
///
/// The round trip is lossless: converting there and back yields an
/// identical document.
pub async fn convert(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let document = read_document(src)?;
    let dst_format = format_of(dst)?;
    if format_of(src)? == dst_format {
        anyhow::bail!("source and destination are already the same format");
    }

    use verdict_core::Recorder;
    let recorder: Box<dyn Recorder> = match dst_format {
        "eval" => Box::new(EvalRecorder::new(dst)),
        _ => Box::new(JsonRecorder::new(dst)),
    };
    recorder.init(&document.spec).await?;
    for sample in &document.samples {
        recorder.record_sample(sample).await?;
    }
    if let Some(results) = &document.results {
        recorder.record_results(results).await?;
    }
    recorder.complete().await?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
