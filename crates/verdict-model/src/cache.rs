// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    config::GenerateConfig,
    output::ModelOutput,
    tool::{ToolChoice, ToolInfo},
    types::ChatMessage,
};

const MEMORY_ENTRIES: usize = 256;

/// Caching behavior for generate calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CachePolicy {
    /// Entries older than this are treated as misses, e.g. "1week".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    /// Include the sample epoch in the fingerprint so each epoch generates
    /// fresh output rather than replaying epoch zero.
    #[serde(default)]
    pub per_epoch: bool,
    /// Additional user scopes mixed into the fingerprint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scopes: BTreeMap<String, String>,
}

impl CachePolicy {
    pub fn expiry_duration(&self) -> Option<Duration> {
        self.expiry
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }
}

/// Everything that identifies one cacheable generate call.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry<'a> {
    pub base_url: Option<&'a str>,
    /// Config with connection options stripped — retry/timeout tuning must
    /// not change the fingerprint.
    pub config: GenerateConfig,
    pub input: &'a [ChatMessage],
    pub model: &'a str,
    pub tool_choice: &'a ToolChoice,
    pub tools: &'a [ToolInfo],
    pub policy: &'a CachePolicy,
    /// Present when the policy is per-epoch.
    pub epoch: Option<u32>,
}

impl<'a> CacheEntry<'a> {
    /// Stable hex fingerprint over all identity components.
    pub fn fingerprint(&self) -> String {
        // serde_json over ordered structs/maps gives a deterministic
        // rendering; message ids are excluded so logically identical
        // conversations fingerprint identically
        let mut hasher = Sha256::new();
        hasher.update(self.base_url.unwrap_or("").as_bytes());
        hasher.update(serde_json::to_vec(&self.config).unwrap_or_default());
        for message in self.input {
            hasher.update(message.role().as_bytes());
            hasher.update(serde_json::to_vec(message.content()).unwrap_or_default());
            if let Some(calls) = message.tool_calls() {
                hasher.update(serde_json::to_vec(calls).unwrap_or_default());
            }
        }
        hasher.update(self.model.as_bytes());
        hasher.update(serde_json::to_vec(self.tool_choice).unwrap_or_default());
        hasher.update(serde_json::to_vec(self.tools).unwrap_or_default());
        hasher.update(serde_json::to_vec(self.policy).unwrap_or_default());
        if let Some(epoch) = self.epoch {
            hasher.update(epoch.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// On-disk generate cache with an in-memory LRU front.
///
/// Layout: `<dir>/<model>/<fingerprint>.json`.  Writes go through a temp
/// file and an atomic rename, so concurrent writers of the same fingerprint
/// are idempotent and readers racing a writer see either the old complete
/// file or nothing (a partial read is a miss).
pub struct ModelCache {
    dir: PathBuf,
    memory: Mutex<LruCache<String, ModelOutput>>,
}

impl ModelCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: Mutex::new(LruCache::new(
                NonZeroUsize::new(MEMORY_ENTRIES).unwrap(),
            )),
        }
    }

    /// Cache rooted at the platform cache dir (`~/.cache/verdict`).
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("verdict")
            .join("generate")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, model: &str, fingerprint: &str) -> PathBuf {
        // model names contain '/' (provider/model); keep them as nested dirs
        // but refuse traversal outside the cache root
        let safe_model: PathBuf = model
            .split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .collect();
        self.dir.join(safe_model).join(format!("{fingerprint}.json"))
    }

    /// Look up an entry; any read/parse failure is a miss.
    pub fn fetch(&self, entry: &CacheEntry<'_>) -> Option<ModelOutput> {
        let fingerprint = entry.fingerprint();
        if let Some(output) = self.memory.lock().unwrap().get(&fingerprint) {
            return Some(output.clone());
        }

        let path = self.entry_path(entry.model, &fingerprint);
        let expired = entry
            .policy
            .expiry_duration()
            .zip(file_age(&path))
            .map(|(expiry, age)| age > expiry)
            .unwrap_or(false);
        if expired {
            debug!(path = %path.display(), "cache entry expired");
            let _ = std::fs::remove_file(&path);
            return None;
        }

        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<ModelOutput>(&bytes) {
            Ok(output) => {
                self.memory
                    .lock()
                    .unwrap()
                    .put(fingerprint, output.clone());
                Some(output)
            }
            Err(err) => {
                debug!(path = %path.display(), "cache read failed, treating as miss: {err}");
                None
            }
        }
    }

    /// Store an entry.  Failures are logged and swallowed — the cache is an
    /// optimization, never a correctness dependency.
    pub fn store(&self, entry: &CacheEntry<'_>, output: &ModelOutput) {
        let fingerprint = entry.fingerprint();
        self.memory
            .lock()
            .unwrap()
            .put(fingerprint.clone(), output.clone());

        let path = self.entry_path(entry.model, &fingerprint);
        if let Err(err) = write_atomic(&path, output) {
            warn!(path = %path.display(), "failed to store cache entry: {err:#}");
        }
    }

    /// Remove entries for `model`, or the whole cache when `model` is empty.
    pub fn clear(&self, model: &str) -> anyhow::Result<()> {
        let path = if model.is_empty() {
            self.dir.clone()
        } else {
            self.entry_path(model, "").parent().unwrap().to_path_buf()
        };
        // refuse anything that escaped the cache root
        if !path.starts_with(&self.dir) {
            anyhow::bail!("refusing to clear outside the cache dir: {}", path.display());
        }
        if path.exists() {
            warn!(path = %path.display(), "clearing cache");
            std::fs::remove_dir_all(&path)?;
        }
        self.memory.lock().unwrap().clear();
        Ok(())
    }

    /// Remove entries older than `expiry`; returns the number removed.
    pub fn prune(&self, expiry: Duration) -> anyhow::Result<usize> {
        let mut removed = 0;
        for (path, _) in self.list()? {
            if file_age(&path).map(|age| age > expiry).unwrap_or(false) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        self.memory.lock().unwrap().clear();
        Ok(removed)
    }

    /// All cache files with their model subpaths.
    pub fn list(&self) -> anyhow::Result<Vec<(PathBuf, String)>> {
        let mut entries = Vec::new();
        if !self.dir.exists() {
            return Ok(entries);
        }
        let mut stack = vec![self.dir.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map(|e| e == "json").unwrap_or(false) {
                    let model = path
                        .parent()
                        .and_then(|p| p.strip_prefix(&self.dir).ok())
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                        .unwrap_or_default();
                    entries.push((path, model));
                }
            }
        }
        Ok(entries)
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn write_atomic(path: &Path, output: &ModelOutput) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cache path has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer(&tmp, output)?;
    tmp.persist(path)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
