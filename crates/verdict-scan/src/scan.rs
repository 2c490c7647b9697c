// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pool::{scan_with_work_pool, ItemProcessor, WorkItem};
use crate::recorder::{FileScanRecorder, ScanRecorder, ScanResults};
use crate::scanner::{get_scanner, Scanner};
use crate::spec::{ScanScanner, ScanSpec};
use crate::transcripts::Transcripts;
use crate::types::filter_transcript;

/// Scan run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Maximum concurrent scan workers.
    pub max_tasks: usize,
    /// Work queue bound; the producer blocks when it is full.  Defaults
    /// to `max_tasks`.
    pub max_queue_size: Option<usize>,
    /// Read at most this many transcripts.
    pub limit: Option<usize>,
    /// Shuffle transcript order with this seed.
    pub shuffle: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_tasks: 4,
            max_queue_size: None,
            limit: None,
            shuffle: None,
        }
    }
}

/// Progress callback bumped once per (transcript, scanner) completion,
/// including pairs skipped because a prior run already recorded them.
pub type ScanProgress = Arc<dyn Fn() + Send + Sync>;

/// Run a scan: write the durable spec, drive the work pool over the
/// transcripts, and compact per-scanner result tables.
pub async fn scan(
    scan_name: &str,
    transcripts: Transcripts,
    scanners: &[ScanScanner],
    scans_location: &Path,
    options: &ScanOptions,
    progress: Option<ScanProgress>,
) -> anyhow::Result<ScanResults> {
    if scanners.is_empty() {
        anyhow::bail!("a scan requires at least one scanner");
    }

    // resolve scanner instances from the registry; the spec retains the
    // registered names + params so resume can rebuild them
    let mut instances: BTreeMap<String, Arc<dyn Scanner>> = BTreeMap::new();
    let mut spec_scanners: BTreeMap<String, ScanScanner> = BTreeMap::new();
    for scanner in scanners {
        let instance = get_scanner(&scanner.name, &scanner.params)?;
        if instances
            .insert(scanner.name.clone(), instance)
            .is_some()
        {
            anyhow::bail!("duplicate scanner name: {}", scanner.name);
        }
        spec_scanners.insert(scanner.name.clone(), scanner.clone());
    }

    // apply collection options before snapshotting
    let mut transcripts = transcripts;
    if let Some(seed) = options.shuffle {
        transcripts = transcripts.shuffle(seed);
    }
    if let Some(limit) = options.limit {
        transcripts = transcripts.limit(limit);
    }

    let mut spec = ScanSpec::new(scan_name);
    spec.transcripts = transcripts.index().to_vec();
    spec.scanners = spec_scanners;
    spec.config = serde_json::to_value(options).unwrap_or_default();

    let recorder = Arc::new(FileScanRecorder::new());
    recorder.init(&spec, scans_location).await?;
    info!(
        scan = scan_name,
        transcripts = transcripts.count(),
        scanners = instances.len(),
        "scan started"
    );

    run_pool(transcripts, instances, recorder, options, progress).await
}

/// Resume an interrupted (or verify a completed) scan from its durable
/// spec.  Prior progress is recovered through the recorder: pairs already
/// recorded are skipped, so resuming a completed scan performs no scanner
/// invocations and yields identical artifacts.
pub async fn scan_resume(
    scan_location: &Path,
    progress: Option<ScanProgress>,
) -> anyhow::Result<ScanResults> {
    let recorder = Arc::new(FileScanRecorder::new());
    let spec = recorder.resume(scan_location).await?;

    let mut instances: BTreeMap<String, Arc<dyn Scanner>> = BTreeMap::new();
    for (name, scanner) in &spec.scanners {
        instances.insert(name.clone(), get_scanner(&scanner.name, &scanner.params)?);
    }
    let transcripts = Transcripts::from_infos(spec.transcripts.clone());
    let options: ScanOptions =
        serde_json::from_value(spec.config.clone()).unwrap_or_default();
    info!(
        scan = %spec.scan_name,
        transcripts = transcripts.count(),
        "scan resumed"
    );

    run_pool(transcripts, instances, recorder, &options, progress).await
}

async fn run_pool(
    transcripts: Transcripts,
    instances: BTreeMap<String, Arc<dyn Scanner>>,
    recorder: Arc<FileScanRecorder>,
    options: &ScanOptions,
    progress: Option<ScanProgress>,
) -> anyhow::Result<ScanResults> {
    let index = transcripts.index().to_vec();
    let transcripts = Arc::new(transcripts);

    // load each transcript once with the union filter, then narrow per
    // scanner in memory
    let processor: ItemProcessor = Arc::new(move |item: WorkItem| {
        let transcripts = transcripts.clone();
        Box::pin(async move {
            let full = transcripts.read(&item.info, &item.union_content).await?;
            let mut results = BTreeMap::new();
            for (name, scanner) in &item.scanners {
                let narrowed = filter_transcript(&full, &scanner.content());
                results.insert(name.clone(), scanner.scan(&narrowed).await?);
            }
            Ok(results)
        })
    });

    let progress = progress.unwrap_or_else(|| Arc::new(|| {}));
    scan_with_work_pool(
        &index,
        &instances,
        recorder.clone(),
        options.max_tasks,
        options.max_queue_size.unwrap_or(options.max_tasks),
        processor,
        progress,
    )
    .await?;

    recorder.complete().await
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
