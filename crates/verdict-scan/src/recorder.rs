// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::scanner::ScanResult;
use crate::spec::ScanSpec;
use crate::types::TranscriptInfo;

const SCAN_JSON: &str = "_scan.json";

/// One row of a per-scanner result table.
pub type ScanRow = BTreeMap<String, serde_json::Value>;

/// Final artifacts of a completed scan.
#[derive(Debug)]
pub struct ScanResults {
    pub spec: ScanSpec,
    pub location: PathBuf,
    pub scanners: BTreeMap<String, Vec<ScanRow>>,
}

/// Durable sink for scan state.
///
/// Each `(transcript, scanner)` pair is recorded as a separate hidden
/// intermediate artifact; `complete` compacts all artifacts for a scanner
/// into a single table named after it.  Any hidden artifact still present
/// afterwards signals an incomplete scan and forces `scan_resume`.
#[async_trait]
pub trait ScanRecorder: Send + Sync {
    async fn init(&self, spec: &ScanSpec, scans_location: &Path) -> anyhow::Result<()>;

    async fn resume(&self, scan_location: &Path) -> anyhow::Result<ScanSpec>;

    async fn is_recorded(&self, transcript: &TranscriptInfo, scanner: &str)
        -> anyhow::Result<bool>;

    async fn record(
        &self,
        transcript: &TranscriptInfo,
        scanner: &str,
        results: &[ScanResult],
    ) -> anyhow::Result<()>;

    async fn flush(&self) -> anyhow::Result<()>;

    async fn complete(&self) -> anyhow::Result<ScanResults>;
}

/// Filesystem scan recorder.
///
/// Layout: `{scans_location}/{timestamp}_{scan_name}_{scan_id}/` holding
/// `_scan.json` (the spec), hidden `.{transcript}_{scanner}.jsonl`
/// pre-compaction artifacts, and `{scanner}.jsonl` tables after
/// compaction.  Rows are JSON objects, one per line, with
/// `transcript_id`/`transcript_source` columns ahead of the scanner's
/// own.  A `.gitignore` in the scans directory keeps the hidden
/// artifacts out of version control.
pub struct FileScanRecorder {
    state: Mutex<Option<State>>,
}

struct State {
    scan_dir: PathBuf,
    spec: ScanSpec,
}

impl FileScanRecorder {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    fn scan_dir(&self) -> anyhow::Result<PathBuf> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("scan recorder not initialized"))?
            .scan_dir
            .clone())
    }

    fn spec(&self) -> anyhow::Result<ScanSpec> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("scan recorder not initialized"))?
            .spec
            .clone())
    }

    fn hidden_artifact(&self, dir: &Path, transcript_id: &str, scanner: &str) -> PathBuf {
        dir.join(format!(
            ".{}_{scanner}.jsonl",
            safe_transcript_id(transcript_id)
        ))
    }

    /// Read just the spec from a scan directory.
    pub fn read_spec(scan_location: &Path) -> anyhow::Result<ScanSpec> {
        let bytes = std::fs::read(scan_location.join(SCAN_JSON))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whether a scan directory still holds uncompacted artifacts.
    pub fn has_uncompacted(scan_location: &Path) -> anyhow::Result<bool> {
        Ok(!hidden_artifacts(scan_location)?.is_empty())
    }

    /// Read the compacted results of a completed scan, failing when
    /// uncompacted artifacts are present.
    pub fn read_results(scan_location: &Path) -> anyhow::Result<ScanResults> {
        let spec = Self::read_spec(scan_location)?;
        if Self::has_uncompacted(scan_location)? {
            anyhow::bail!(
                "scan '{}' has uncompacted transcript artifacts; run scan_resume to complete it",
                scan_location.display()
            );
        }
        let mut scanners = BTreeMap::new();
        for entry in std::fs::read_dir(scan_location)? {
            let path = entry?.path();
            let Some(name) = artifact_scanner_name(&path) else {
                continue;
            };
            scanners.insert(name, read_rows(&path)?);
        }
        Ok(ScanResults {
            spec,
            location: scan_location.to_path_buf(),
            scanners,
        })
    }
}

impl Default for FileScanRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanRecorder for FileScanRecorder {
    async fn init(&self, spec: &ScanSpec, scans_location: &Path) -> anyhow::Result<()> {
        let dir_name = format!(
            "{}_{}_{}",
            spec.created.format("%Y-%m-%dT%H-%M-%S"),
            spec.scan_name,
            spec.scan_id
        );
        let scan_dir = scans_location.join(dir_name);
        std::fs::create_dir_all(&scan_dir)?;

        // keep pre-compaction artifacts out of version control
        let gitignore = scans_location.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "**/.*.jsonl\n")?;
        }

        write_atomic(&scan_dir.join(SCAN_JSON), &serde_json::to_vec_pretty(spec)?)?;
        debug!(dir = %scan_dir.display(), "scan initialized");
        *self.state.lock().unwrap() = Some(State {
            scan_dir,
            spec: spec.clone(),
        });
        Ok(())
    }

    async fn resume(&self, scan_location: &Path) -> anyhow::Result<ScanSpec> {
        let spec = Self::read_spec(scan_location)?;
        *self.state.lock().unwrap() = Some(State {
            scan_dir: scan_location.to_path_buf(),
            spec: spec.clone(),
        });
        Ok(spec)
    }

    async fn is_recorded(
        &self,
        transcript: &TranscriptInfo,
        scanner: &str,
    ) -> anyhow::Result<bool> {
        let dir = self.scan_dir()?;
        if self.hidden_artifact(&dir, &transcript.id, scanner).exists() {
            return Ok(true);
        }
        // a compacted table for the scanner covers every transcript
        Ok(dir.join(format!("{scanner}.jsonl")).exists())
    }

    async fn record(
        &self,
        transcript: &TranscriptInfo,
        scanner: &str,
        results: &[ScanResult],
    ) -> anyhow::Result<()> {
        let dir = self.scan_dir()?;
        let mut lines = Vec::new();
        for result in results {
            let mut row: ScanRow = BTreeMap::new();
            row.insert(
                "transcript_id".to_string(),
                serde_json::json!(transcript.id),
            );
            row.insert(
                "transcript_source".to_string(),
                serde_json::json!(transcript.source),
            );
            row.extend(result.to_columns());
            lines.push(serde_json::to_vec(&row)?);
        }
        let mut bytes = Vec::new();
        for line in lines {
            bytes.extend_from_slice(&line);
            bytes.push(b'\n');
        }
        // an empty artifact still marks the (transcript, scanner) pair done
        write_atomic(&self.hidden_artifact(&dir, &transcript.id, scanner), &bytes)?;
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        // every record is already durable (atomic rename per artifact)
        Ok(())
    }

    async fn complete(&self) -> anyhow::Result<ScanResults> {
        let dir = self.scan_dir()?;
        let spec = self.spec()?;

        // group hidden artifacts by scanner
        let mut by_scanner: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for path in hidden_artifacts(&dir)? {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            // `.{transcript}_{scanner}`: transcript ids never contain '_'
            let Some((_, scanner)) = stem[1..].split_once('_') else {
                continue;
            };
            by_scanner
                .entry(scanner.to_string())
                .or_default()
                .push(path);
        }

        for (scanner, files) in &by_scanner {
            let consolidated = dir.join(format!("{scanner}.jsonl"));
            if consolidated.exists() {
                // a prior complete() already compacted this scanner; the
                // stragglers are leftovers
                for file in files {
                    std::fs::remove_file(file)?;
                }
                continue;
            }
            let mut bytes = Vec::new();
            for file in files {
                bytes.extend_from_slice(&std::fs::read(file)?);
            }
            write_atomic(&consolidated, &bytes)?;
            for file in files {
                std::fs::remove_file(file)?;
            }
            debug!(scanner, files = files.len(), "compacted scanner artifacts");
        }

        Self::read_results(&dir)
    }
}

fn safe_transcript_id(id: &str) -> String {
    // underscores separate the transcript id from the scanner name in
    // artifact file names
    id.replace('_', "-")
}

fn hidden_artifacts(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut artifacts = Vec::new();
    if !dir.exists() {
        return Ok(artifacts);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') && name.ends_with(".jsonl") {
            artifacts.push(path);
        }
    }
    artifacts.sort();
    Ok(artifacts)
}

fn artifact_scanner_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') || !name.ends_with(".jsonl") {
        return None;
    }
    Some(name.trim_end_matches(".jsonl").to_string())
}

fn read_rows(path: &Path) -> anyhow::Result<Vec<ScanRow>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("artifact path has no parent"))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> TranscriptInfo {
        TranscriptInfo {
            id: id.into(),
            source: "log.eval".into(),
            metadata: BTreeMap::new(),
        }
    }

    async fn initialized(dir: &Path) -> FileScanRecorder {
        let recorder = FileScanRecorder::new();
        recorder
            .init(&ScanSpec::new("myscan"), dir)
            .await
            .unwrap();
        recorder
    }

    #[tokio::test]
    async fn init_writes_spec_and_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        let scan_dir = recorder.scan_dir().unwrap();
        assert!(scan_dir.join(SCAN_JSON).exists());
        assert!(dir.path().join(".gitignore").exists());
        let name = scan_dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.contains("_myscan_"));
    }

    #[tokio::test]
    async fn record_creates_hidden_artifact_and_marks_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        let transcript = info("t1");

        assert!(!recorder.is_recorded(&transcript, "tox").await.unwrap());
        recorder
            .record(&transcript, "tox", &[ScanResult::value(0.9)])
            .await
            .unwrap();
        assert!(recorder.is_recorded(&transcript, "tox").await.unwrap());

        let scan_dir = recorder.scan_dir().unwrap();
        assert!(scan_dir.join(".t1_tox.jsonl").exists());
    }

    #[tokio::test]
    async fn complete_compacts_per_scanner_and_removes_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        for id in ["t1", "t2", "t3"] {
            recorder
                .record(&info(id), "tox", &[ScanResult::value(id)])
                .await
                .unwrap();
            recorder
                .record(&info(id), "length", &[ScanResult::value(7)])
                .await
                .unwrap();
        }

        let results = recorder.complete().await.unwrap();
        assert_eq!(results.scanners.len(), 2);
        assert_eq!(results.scanners["tox"].len(), 3);
        assert_eq!(results.scanners["length"].len(), 3);
        // rows carry transcript identity columns
        assert!(results.scanners["tox"]
            .iter()
            .any(|row| row["transcript_id"] == serde_json::json!("t1")));

        let scan_dir = recorder.scan_dir().unwrap();
        assert!(hidden_artifacts(&scan_dir).unwrap().is_empty());
        assert!(scan_dir.join("tox.jsonl").exists());
        assert!(scan_dir.join("length.jsonl").exists());
    }

    #[tokio::test]
    async fn complete_after_compaction_covers_all_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        recorder
            .record(&info("t1"), "tox", &[ScanResult::value(1)])
            .await
            .unwrap();
        recorder.complete().await.unwrap();

        // after compaction every transcript reads as recorded for that scanner
        assert!(recorder.is_recorded(&info("t999"), "tox").await.unwrap());
    }

    #[tokio::test]
    async fn resume_reads_spec_back() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ScanSpec::new("resumable");
        let recorder = FileScanRecorder::new();
        recorder.init(&spec, dir.path()).await.unwrap();
        let scan_dir = recorder.scan_dir().unwrap();

        let resumed = FileScanRecorder::new();
        let recovered = resumed.resume(&scan_dir).await.unwrap();
        assert_eq!(recovered, spec);
    }

    #[tokio::test]
    async fn read_results_refuses_uncompacted_scan() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        recorder
            .record(&info("t1"), "tox", &[ScanResult::value(1)])
            .await
            .unwrap();
        let scan_dir = recorder.scan_dir().unwrap();
        let err = FileScanRecorder::read_results(&scan_dir).unwrap_err();
        assert!(err.to_string().contains("uncompacted"));
    }

    #[tokio::test]
    async fn transcript_ids_with_underscores_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        let transcript = info("has_underscore_id");
        recorder
            .record(&transcript, "tox", &[ScanResult::value(1)])
            .await
            .unwrap();
        // the same id reads back as recorded
        assert!(recorder.is_recorded(&transcript, "tox").await.unwrap());
        let results = recorder.complete().await.unwrap();
        // compaction attributes the artifact to the right scanner
        assert_eq!(results.scanners["tox"].len(), 1);
    }

    #[tokio::test]
    async fn empty_results_still_mark_pair_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = initialized(dir.path()).await;
        recorder.record(&info("t1"), "tox", &[]).await.unwrap();
        assert!(recorder.is_recorded(&info("t1"), "tox").await.unwrap());
        let results = recorder.complete().await.unwrap();
        assert_eq!(results.scanners["tox"].len(), 0);
    }
}
