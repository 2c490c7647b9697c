// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use verdict_core::transcript::EventRecord;
use verdict_model::ChatMessage;

/// What a scanner needs from one axis of a transcript (messages or
/// events): nothing, everything, or a set of kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFilter {
    #[default]
    None,
    All,
    Only(Vec<String>),
}

impl ContentFilter {
    pub fn only(kinds: &[&str]) -> Self {
        Self::Only(kinds.iter().map(|k| k.to_string()).collect())
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Only(kinds) => kinds.iter().any(|k| k == kind),
        }
    }

    /// The narrowest filter satisfying both `self` and `other`.
    pub fn union(&self, other: &ContentFilter) -> ContentFilter {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::None, b) => b.clone(),
            (a, Self::None) => a.clone(),
            (Self::Only(a), Self::Only(b)) => {
                let set: BTreeSet<String> = a.iter().chain(b.iter()).cloned().collect();
                Self::Only(set.into_iter().collect())
            }
        }
    }
}

/// Per-scanner declaration of the transcript content it reads.
///
/// The pool unions every scanner's declaration into one minimal filter so
/// each transcript is read from storage only once; the narrower
/// per-scanner filters are then applied in memory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TranscriptContent {
    #[serde(default)]
    pub messages: ContentFilter,
    #[serde(default)]
    pub events: ContentFilter,
}

impl TranscriptContent {
    pub fn all() -> Self {
        Self {
            messages: ContentFilter::All,
            events: ContentFilter::All,
        }
    }

    pub fn messages_only() -> Self {
        Self {
            messages: ContentFilter::All,
            events: ContentFilter::None,
        }
    }

    pub fn union(&self, other: &TranscriptContent) -> TranscriptContent {
        TranscriptContent {
            messages: self.messages.union(&other.messages),
            events: self.events.union(&other.events),
        }
    }

    /// Union an iterator of contents into the narrowest combined filter.
    pub fn union_all<'a>(contents: impl IntoIterator<Item = &'a TranscriptContent>) -> Self {
        contents
            .into_iter()
            .fold(TranscriptContent::default(), |acc, c| acc.union(c))
    }
}

/// Identifies one scannable transcript without carrying its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptInfo {
    /// Unique id (the sample uuid).
    pub id: String,
    /// URI of the source data (the log file path).
    pub source: String,
    /// Eval context carried along for result rows (task, model, scores).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A transcript with its (filtered) content loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTranscript {
    #[serde(flatten)]
    pub info: TranscriptInfo,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub events: Vec<EventRecord>,
}

/// Apply a (narrower) content filter to an already-loaded transcript.
pub fn filter_transcript(transcript: &ScanTranscript, content: &TranscriptContent) -> ScanTranscript {
    ScanTranscript {
        info: transcript.info.clone(),
        messages: transcript
            .messages
            .iter()
            .filter(|m| content.messages.matches(m.role()))
            .cloned()
            .collect(),
        events: transcript
            .events
            .iter()
            .filter(|e| content.events.matches(e.event.kind()))
            .cloned()
            .collect(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
