// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use tracing::debug;

use verdict_core::{EvalResults, EvalSample, EvalSpec, Recorder};

use crate::document::{LogDocument, LOG_VERSION};

struct State {
    document: LogDocument,
    dirty: bool,
}

/// Recorder writing one JSON document per eval.
///
/// Carries exactly the same structures as the `eval` container, so the
/// two formats round-trip losslessly through `convert`.  Same buffering
/// and atomic-rename discipline as [`crate::EvalRecorder`].
pub struct JsonRecorder {
    location: PathBuf,
    state: Mutex<Option<State>>,
    lock: Mutex<Option<std::fs::File>>,
}

impl JsonRecorder {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            state: Mutex::new(None),
            lock: Mutex::new(None),
        }
    }

    fn acquire_lock(&self) -> anyhow::Result<()> {
        let lock_path = self.location.with_extension("json.lock");
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

    fn write_document(&self, document: &LogDocument) -> anyhow::Result<()> {
        let parent = self
            .location
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec_pretty(document)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.location)?;
        debug!(location = %self.location.display(), "json log flushed");
        Ok(())
    }

    pub fn read(location: &Path) -> anyhow::Result<LogDocument> {
        let bytes = std::fs::read(location)?;
        let document: LogDocument = serde_json::from_slice(&bytes)?;
        if document.version > LOG_VERSION {
            anyhow::bail!(
                "json log version {} is newer than supported ({})",
                document.version,
                LOG_VERSION
            );
        }
        Ok(document)
    }
}

#[async_trait]
impl Recorder for JsonRecorder {
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
        *self.state.lock().unwrap() = Some(State {
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
        self.write_document(&document)
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
