// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use verdict_log::read_document;

use crate::types::{filter_transcript, ScanTranscript, TranscriptContent, TranscriptInfo};

/// A lazy, filterable collection of scannable transcripts.
///
/// The index holds only [`TranscriptInfo`]s; content is fetched per
/// transcript with [`read`], applying the caller's content filter so that
/// large transcripts are narrowed at load time.
///
/// [`read`]: Transcripts::read
#[derive(Debug, Clone, Default)]
pub struct Transcripts {
    infos: Vec<TranscriptInfo>,
}

impl Transcripts {
    pub fn from_infos(infos: Vec<TranscriptInfo>) -> Self {
        Self { infos }
    }

    /// Index every sample of every eval log under `dir` as a transcript.
    pub fn from_logs(dir: &Path) -> anyhow::Result<Self> {
        let mut infos = Vec::new();
        for entry in verdict_log::list_logs(dir)? {
            let document = match verdict_log::read_log(&entry.path) {
                Ok(document) => document,
                Err(err) => {
                    debug!(path = %entry.path.display(), "skipping unreadable log: {err:#}");
                    continue;
                }
            };
            for sample in &document.samples {
                let mut metadata = BTreeMap::new();
                metadata.insert(
                    "task".to_string(),
                    serde_json::json!(document.spec.task_name),
                );
                metadata.insert("model".to_string(), serde_json::json!(document.spec.model));
                metadata.insert("sample_id".to_string(), serde_json::json!(sample.id));
                metadata.insert("epoch".to_string(), serde_json::json!(sample.epoch));
                infos.push(TranscriptInfo {
                    id: sample.uuid.clone(),
                    source: entry.path.to_string_lossy().into_owned(),
                    metadata,
                });
            }
        }
        Ok(Self { infos })
    }

    pub fn filter(mut self, predicate: impl Fn(&TranscriptInfo) -> bool) -> Self {
        self.infos.retain(|info| predicate(info));
        self
    }

    /// Deterministic shuffle keyed by `seed`.
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.infos.sort_by_key(|info| {
            let mut hasher = Sha256::new();
            hasher.update(seed.to_le_bytes());
            hasher.update(info.id.as_bytes());
            hasher.finalize().to_vec()
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.infos.truncate(n);
        self
    }

    pub fn count(&self) -> usize {
        self.infos.len()
    }

    pub fn index(&self) -> &[TranscriptInfo] {
        &self.infos
    }

    /// Load one transcript's content from its source log, applying
    /// `content` at load time.
    pub async fn read(
        &self,
        info: &TranscriptInfo,
        content: &TranscriptContent,
    ) -> anyhow::Result<ScanTranscript> {
        let document = read_document(Path::new(&info.source))?;
        let sample = document
            .samples
            .iter()
            .find(|s| s.uuid == info.id)
            .ok_or_else(|| {
                anyhow::anyhow!("transcript {} not found in {}", info.id, info.source)
            })?;
        let full = ScanTranscript {
            info: info.clone(),
            messages: sample.messages.clone(),
            events: sample.events.clone(),
        };
        Ok(filter_transcript(&full, content))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
