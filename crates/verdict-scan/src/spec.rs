// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TranscriptInfo;

/// One scanner as persisted in a [`ScanSpec`]: the registered name plus
/// the params it was created with, enough to reconstruct it on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanScanner {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Durable description of a scan run.
///
/// Written atomically when the scan starts and re-read by `scan_resume`;
/// everything needed to re-enter the work pool is here: the transcript
/// snapshot, the scanners (by registered name and params), and the pool
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    pub scan_id: String,
    pub scan_name: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Pool configuration snapshot.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Snapshot of the transcripts targeted by the scan.
    pub transcripts: Vec<TranscriptInfo>,
    /// Scanners keyed by their result-table name.
    pub scanners: BTreeMap<String, ScanScanner>,
}

impl ScanSpec {
    pub fn new(scan_name: impl Into<String>) -> Self {
        Self {
            scan_id: short_id(),
            scan_name: scan_name.into(),
            created: Utc::now(),
            model: None,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            config: serde_json::Value::Null,
            transcripts: Vec::new(),
            scanners: BTreeMap::new(),
        }
    }
}

/// Short unique id used in scan directory names.
fn short_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    uuid[..12].to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
