// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use verdict_core::{EvalSpec, TaskStatus};

use crate::convert::read_document;
use crate::document::LogDocument;

/// One log discovered in a log directory.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub path: PathBuf,
    pub spec: EvalSpec,
    pub status: Option<TaskStatus>,
    pub samples: usize,
}

/// Recursively list eval logs under `dir`, newest first.
///
/// Unreadable or foreign files are skipped with a debug note rather than
/// failing the whole listing.
pub fn list_logs(dir: &Path) -> anyhow::Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str());
        if !matches!(ext, Some("eval") | Some("json")) {
            continue;
        }
        match read_document(path) {
            Ok(document) => entries.push(LogEntry {
                path: path.to_path_buf(),
                status: document.results.as_ref().map(|r| r.status),
                samples: document.samples.len(),
                spec: document.spec,
            }),
            Err(err) => {
                debug!(path = %path.display(), "skipping unreadable log: {err:#}");
            }
        }
    }
    entries.sort_by(|a, b| b.spec.created.cmp(&a.spec.created));
    Ok(entries)
}

/// Read one complete log in either format.
pub fn read_log(path: &Path) -> anyhow::Result<LogDocument> {
    read_document(path)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use verdict_core::Recorder;

    use crate::JsonRecorder;

    #[tokio::test]
    async fn lists_logs_and_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a log").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let recorder = JsonRecorder::new(dir.path().join("one.json"));
        recorder
            .init(&EvalSpec::new("task-a", "mock/model", 1))
            .await
            .unwrap();
        recorder.complete().await.unwrap();

        let entries = list_logs(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].spec.task_name, "task-a");
        assert_eq!(entries[0].samples, 0);
        assert!(entries[0].status.is_none());
    }

    #[test]
    fn missing_dir_lists_nothing() {
        let entries = list_logs(Path::new("/definitely/not/a/dir")).unwrap();
        assert!(entries.is_empty());
    }
}
