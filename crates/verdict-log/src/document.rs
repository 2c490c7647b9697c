// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

use verdict_core::{EvalResults, EvalSample, EvalSpec};

/// Container format version; bumped on incompatible layout changes.
pub const LOG_VERSION: u32 = 1;

/// The complete content of one eval log, shared by both file formats.
///
/// The `eval` format stores these pieces as separate entries in a zip
/// container; the `json` format stores the document verbatim.  Round
/// trips between the two are lossless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogDocument {
    pub version: u32,
    pub spec: EvalSpec,
    #[serde(default)]
    pub samples: Vec<EvalSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<EvalResults>,
}

impl LogDocument {
    pub fn new(spec: EvalSpec) -> Self {
        Self {
            version: LOG_VERSION,
            spec,
            samples: Vec::new(),
            results: None,
        }
    }
}

/// Compact per-sample digest stored alongside full samples in the eval
/// container so listings don't have to parse every sample entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleSummary {
    pub id: String,
    pub epoch: u32,
    pub error: Option<String>,
    pub limit: Option<String>,
    pub scores: std::collections::BTreeMap<String, f64>,
}

impl From<&EvalSample> for SampleSummary {
    fn from(sample: &EvalSample) -> Self {
        Self {
            id: sample.id.clone(),
            epoch: sample.epoch,
            error: sample.error.clone(),
            limit: sample.limit.as_ref().map(|l| l.to_string()),
            scores: sample
                .scores
                .iter()
                .map(|(name, score)| (name.clone(), score.value))
                .collect(),
        }
    }
}
