// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zip::write::SimpleFileOptions;

use verdict_core::{EvalResults, EvalSample, EvalSpec, Recorder};

use crate::document::{LogDocument, SampleSummary, LOG_VERSION};

const HEADER_ENTRY: &str = "header.json";
const SUMMARIES_ENTRY: &str = "summaries.json";
const RESULTS_ENTRY: &str = "results.json";

#[derive(Serialize, Deserialize)]
struct Header {
    version: u32,
    spec: EvalSpec,
}

struct State {
    document: LogDocument,
    dirty: bool,
}

/// Recorder writing the compact binary `eval` format: a versioned zip
/// container holding the header, one JSON entry per sample, a summaries
/// digest, and final results.
///
/// Records buffer in memory; `flush` rewrites the container through a
/// temp file and an atomic rename, so the on-disk log is always a
/// complete, readable archive.  An advisory lock file enforces the
/// one-writer-per-location ownership rule.
pub struct EvalRecorder {
    location: PathBuf,
    state: Mutex<Option<State>>,
    lock: Mutex<Option<std::fs::File>>,
}

impl EvalRecorder {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            state: Mutex::new(None),
            lock: Mutex::new(None),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    fn acquire_lock(&self) -> anyhow::Result<()> {
        let lock_path = self.location.with_extension("eval.lock");
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if !file.try_lock_exclusive()? {
            anyhow::bail!(
                "log location is owned by another recorder: {}",
                self.location.display()
            );
        }
        *self.lock.lock().unwrap() = Some(file);
        Ok(())
    }

    fn write_container(&self, document: &LogDocument) -> anyhow::Result<()> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = SimpleFileOptions::default();

            writer.start_file(HEADER_ENTRY, options)?;
            writer.write_all(&serde_json::to_vec_pretty(&Header {
                version: document.version,
                spec: document.spec.clone(),
            })?)?;

            for sample in &document.samples {
                writer.start_file(sample_entry(&sample.id, sample.epoch), options)?;
                writer.write_all(&serde_json::to_vec(sample)?)?;
            }

            let summaries: Vec<SampleSummary> =
                document.samples.iter().map(SampleSummary::from).collect();
            writer.start_file(SUMMARIES_ENTRY, options)?;
            writer.write_all(&serde_json::to_vec(&summaries)?)?;

            if let Some(results) = &document.results {
                writer.start_file(RESULTS_ENTRY, options)?;
                writer.write_all(&serde_json::to_vec_pretty(results)?)?;
            }
            writer.finish()?;
        }

        let parent = self
            .location
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&cursor.into_inner())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.location)?;
        debug!(location = %self.location.display(), "eval log flushed");
        Ok(())
    }

    /// Read a complete eval container from disk.
    pub fn read(location: &Path) -> anyhow::Result<LogDocument> {
        let file = std::fs::File::open(location)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let header: Header = {
            let mut entry = archive.by_name(HEADER_ENTRY)?;
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            serde_json::from_slice(&bytes)?
        };
        if header.version > LOG_VERSION {
            anyhow::bail!(
                "eval log version {} is newer than supported ({})",
                header.version,
                LOG_VERSION
            );
        }

        let mut samples = Vec::new();
        let names: Vec<String> = archive
            .file_names()
            .filter(|n| n.starts_with("samples/"))
            .map(|n| n.to_string())
            .collect();
        for name in names {
            let mut entry = archive.by_name(&name)?;
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            samples.push(serde_json::from_slice::<EvalSample>(&bytes)?);
        }
        samples.sort_by(|a, b| (a.id.clone(), a.epoch).cmp(&(b.id.clone(), b.epoch)));

        let results = match archive.by_name(RESULTS_ENTRY) {
            Ok(mut entry) => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                Some(serde_json::from_slice(&bytes)?)
            }
            Err(_) => None,
        };

        Ok(LogDocument {
            version: header.version,
            spec: header.spec,
            samples,
            results,
        })
    }
}

fn sample_entry(id: &str, epoch: u32) -> String {
    // keep entry names filesystem-safe regardless of sample ids
    let safe: String = id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("samples/{safe}_epoch_{epoch}.json")
}

#[async_trait]
impl Recorder for EvalRecorder {
    async fn init(&self, spec: &EvalSpec) -> anyhow::Result<()> {
        self.acquire_lock()?;
        // samples already durable at this location survive init, which is
        // what makes an interrupted run retryable into the same file
        let mut document = LogDocument::new(spec.clone());
        if self.location.exists() {
            if let Ok(existing) = Self::read(&self.location) {
                document.samples = existing.samples;
            }
        }
        let mut state = self.state.lock().unwrap();
        *state = Some(State {
            document,
            dirty: true,
        });
        Ok(())
    }

    async fn resume(&self, location: &str) -> anyhow::Result<EvalSpec> {
        self.acquire_lock()?;
        let document = Self::read(Path::new(location))?;
        let spec = document.spec.clone();
        *self.state.lock().unwrap() = Some(State {
            document,
            dirty: false,
        });
        Ok(spec)
    }

    async fn is_recorded(&self, sample_id: &str, epoch: u32) -> anyhow::Result<bool> {
        let state = self.state.lock().unwrap();
        let state = state
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("recorder not initialized"))?;
        Ok(state
            .document
            .samples
            .iter()
            .any(|s| s.id == sample_id && s.epoch == epoch))
    }

    async fn record_sample(&self, sample: &EvalSample) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let state = state
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("recorder not initialized"))?;
        state.document.samples.push(sample.clone());
        state.dirty = true;
        Ok(())
    }

    async fn record_results(&self, results: &EvalResults) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let state = state
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("recorder not initialized"))?;
        state.document.results = Some(results.clone());
        state.dirty = true;
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let document = {
            let mut state = self.state.lock().unwrap();
            let state = state
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("recorder not initialized"))?;
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.document.clone()
        };
        self.write_container(&document)
    }

    async fn complete(&self) -> anyhow::Result<String> {
        self.flush().await?;
        Ok(self.location.to_string_lossy().into_owned())
    }

    async fn read_samples(&self) -> anyhow::Result<Vec<EvalSample>> {
        let state = self.state.lock().unwrap();
        let state = state
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("recorder not initialized"))?;
        Ok(state.document.samples.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
