// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::recorder::ScanRecorder;
use crate::scanner::{ScanResult, Scanner};
use crate::types::{TranscriptContent, TranscriptInfo};

/// How long an idle worker waits for new work before exiting.  The
/// producer re-spawns workers as it posts further items.
const WORKER_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// One unit of work: read a transcript once (with the union filter) and
/// run every scanner that still needs it.
#[derive(Clone)]
pub struct WorkItem {
    pub info: TranscriptInfo,
    pub union_content: TranscriptContent,
    /// `(result table name, scanner)` pairs not yet recorded for this
    /// transcript.
    pub scanners: Vec<(String, Arc<dyn Scanner>)>,
}

/// Loads a work item's transcript and runs its scanners, returning
/// results keyed by table name.
pub type ItemProcessor = Arc<
    dyn Fn(WorkItem) -> BoxFuture<'static, anyhow::Result<BTreeMap<String, Vec<ScanResult>>>>
        + Send
        + Sync,
>;

/// Producer/worker engine applying scanners to a corpus of transcripts.
///
/// The producer walks the transcript index, skips `(transcript, scanner)`
/// pairs the recorder already holds (bumping progress for each), and
/// sends the rest as work items on a bounded queue — a full queue blocks
/// the producer, letting workers drain (backpressure).  Workers are
/// spawned lazily up to `max_tasks` as items are posted; each pulls items
/// until the queue is closed or it idles past a poll timeout.  Results
/// are recorded per scanner with a progress bump each.
///
/// The first worker error wins: remaining workers are aborted and the
/// error is returned wrapped for the caller.
pub async fn scan_with_work_pool(
    transcripts: &[TranscriptInfo],
    scanners: &BTreeMap<String, Arc<dyn Scanner>>,
    recorder: Arc<dyn ScanRecorder>,
    max_tasks: usize,
    max_queue_size: usize,
    item_processor: ItemProcessor,
    progress: Arc<dyn Fn() + Send + Sync>,
) -> anyhow::Result<()> {
    let union_content = TranscriptContent::union_all(
        &scanners
            .values()
            .map(|s| s.content())
            .collect::<Vec<_>>(),
    );

    let max_tasks = max_tasks.max(1);
    let (tx, rx) = mpsc::channel::<WorkItem>(max_queue_size.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let worker_count = Arc::new(AtomicUsize::new(0));
    let mut workers: JoinSet<anyhow::Result<usize>> = JoinSet::new();

    // producer
    for info in transcripts {
        let mut subset: Vec<(String, Arc<dyn Scanner>)> = Vec::new();
        for (name, scanner) in scanners {
            if recorder.is_recorded(info, name).await? {
                progress();
            } else {
                subset.push((name.clone(), scanner.clone()));
            }
        }
        if subset.is_empty() {
            continue;
        }

        // spawn ahead of the (possibly blocking) send so a full queue
        // always has a live consumer
        if worker_count.load(Ordering::SeqCst) < max_tasks {
            worker_count.fetch_add(1, Ordering::SeqCst);
            let id = worker_count.load(Ordering::SeqCst);
            debug!(worker = id, "spawning scan worker");
            workers.spawn(worker_task(
                rx.clone(),
                recorder.clone(),
                item_processor.clone(),
                progress.clone(),
                worker_count.clone(),
            ));
        }

        let item = WorkItem {
            info: info.clone(),
            union_content: union_content.clone(),
            scanners: subset,
        };
        tx.send(item)
            .await
            .map_err(|_| anyhow::anyhow!("scan work queue closed unexpectedly"))?;

        // let workers make progress between posts
        tokio::task::yield_now().await;
    }
    drop(tx);

    // drain workers; the first error aborts the rest
    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(processed)) => {
                debug!(processed, "scan worker finished");
            }
            Ok(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                    workers.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                warn!("scan worker panicked: {join_err}");
                if first_error.is_none() {
                    first_error = Some(anyhow::anyhow!("scan worker panicked: {join_err}"));
                    workers.abort_all();
                }
            }
        }
    }
    match first_error {
        Some(err) => Err(err.context("scan failed")),
        None => Ok(()),
    }
}

async fn worker_task(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    recorder: Arc<dyn ScanRecorder>,
    item_processor: ItemProcessor,
    progress: Arc<dyn Fn() + Send + Sync>,
    worker_count: Arc<AtomicUsize>,
) -> anyhow::Result<usize> {
    let mut processed = 0usize;
    let result = loop {
        let item = {
            let mut rx = rx.lock().await;
            match tokio::time::timeout(WORKER_POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(item)) => item,
                // queue closed and drained, or idled out
                Ok(None) | Err(_) => break Ok(processed),
            }
        };

        let info = item.info.clone();
        let results = match item_processor(item).await {
            Ok(results) => results,
            Err(err) => break Err(err),
        };
        let mut record_error: Option<anyhow::Error> = None;
        for (name, rows) in &results {
            match recorder.record(&info, name, rows).await {
                Ok(()) => progress(),
                Err(err) => {
                    record_error = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = record_error {
            break Err(err);
        }
        processed += 1;
    };
    worker_count.fetch_sub(1, Ordering::SeqCst);
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
