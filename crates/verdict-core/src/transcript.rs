// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use verdict_model::{
    ChatMessage, GenerateConfig, ModelOutput, ToolCall, ToolChoice, ToolInfo,
};
use verdict_model::tool::ToolCallError;
use verdict_model::types::MessageContent;

use crate::limits::LimitExceeded;
use crate::scorer::Score;

/// One structured event in a sample's transcript.
///
/// Events reference each other by integer id within the transcript's arena
/// (span begin/end, updates); there are no cyclic pointers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SampleInit {
        sample_id: String,
        epoch: u32,
        input: Vec<ChatMessage>,
        target: String,
    },
    /// Solver state snapshot (store/metadata deltas).
    State {
        changes: serde_json::Value,
    },
    Model {
        model: String,
        input: Vec<ChatMessage>,
        tools: Vec<ToolInfo>,
        tool_choice: ToolChoice,
        config: GenerateConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<ModelOutput>,
        /// "read" when served from cache, "write" when stored.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache: Option<String>,
        /// Seconds spent on the successful provider request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        /// True between the request being issued and its completion.
        pending: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    Tool {
        call: ToolCall,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<MessageContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ToolCallError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
        pending: bool,
    },
    Score {
        scorer: String,
        score: Score,
    },
    Sandbox {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Logger {
        level: String,
        message: String,
    },
    SpanBegin {
        span_id: u64,
        name: String,
    },
    SpanEnd {
        span_id: u64,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
    SampleLimit {
        #[serde(flatten)]
        limit: LimitExceeded,
    },
}

impl Event {
    /// The kind tag used in serialized form and by event filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SampleInit { .. } => "sample_init",
            Event::State { .. } => "state",
            Event::Model { .. } => "model",
            Event::Tool { .. } => "tool",
            Event::Score { .. } => "score",
            Event::Sandbox { .. } => "sandbox",
            Event::Logger { .. } => "logger",
            Event::SpanBegin { .. } => "span_begin",
            Event::SpanEnd { .. } => "span_end",
            Event::Error { .. } => "error",
            Event::SampleLimit { .. } => "sample_limit",
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Event::Model { pending: true, .. } | Event::Tool { pending: true, .. }
        )
    }
}

/// An event plus its identity and wall-clock timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub uuid: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// Index of an event within its transcript.
pub type EventId = usize;

struct Inner {
    events: Vec<EventRecord>,
    next_span: u64,
    open_spans: Vec<u64>,
}

/// Append-only, strictly ordered event log for one sample.
///
/// Events are recorded with [`event`] and may be completed in place with
/// [`event_updated`] once streamed results arrive (the model engine records
/// a pending Model event before the provider call and completes it after).
/// An optional notify channel mirrors every append/update to a live
/// observer.
///
/// [`event`]: Transcript::event
/// [`event_updated`]: Transcript::event_updated
pub struct Transcript {
    inner: std::sync::Mutex<Inner>,
    notify: Option<mpsc::UnboundedSender<EventRecord>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(Inner {
                events: Vec::new(),
                next_span: 0,
                open_spans: Vec::new(),
            }),
            notify: None,
        }
    }

    /// A transcript that mirrors events to the given channel.
    pub fn with_notify(notify: mpsc::UnboundedSender<EventRecord>) -> Self {
        Self {
            notify: Some(notify),
            ..Self::new()
        }
    }

    /// Append an event; returns its id for later in-place completion.
    pub fn event(&self, event: Event) -> EventId {
        let record = EventRecord {
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.events.push(record.clone());
        if let Some(notify) = &self.notify {
            let _ = notify.send(record);
        }
        inner.events.len() - 1
    }

    /// Replace the payload of an already-recorded event, keeping its uuid
    /// and position.  Used when results arrive after the event was first
    /// recorded (pending model/tool events).
    pub fn event_updated(&self, id: EventId, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.events.get_mut(id) {
            record.event = event;
            let updated = record.clone();
            if let Some(notify) = &self.notify {
                let _ = notify.send(updated);
            }
        }
    }

    /// Open a span; events recorded until the matching [`end_span`] nest
    /// inside it.  Spans close in LIFO order.
    ///
    /// [`end_span`]: Transcript::end_span
    pub fn begin_span(&self, name: &str) -> u64 {
        let span_id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_span;
            inner.next_span += 1;
            inner.open_spans.push(id);
            id
        };
        self.event(Event::SpanBegin {
            span_id,
            name: name.to_string(),
        });
        span_id
    }

    pub fn end_span(&self, span_id: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            // close any spans opened after this one first (LIFO invariant)
            while let Some(open) = inner.open_spans.last().copied() {
                inner.open_spans.pop();
                if open == span_id {
                    break;
                }
            }
        }
        self.event(Event::SpanEnd { span_id });
    }

    /// Snapshot of all events in order.
    pub fn events(&self) -> Vec<EventRecord> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete any still-pending events with the given error.
    ///
    /// A cancellation (or an expired time limit) can interrupt a generate
    /// or tool call between its pending event and its completion; this
    /// closes those events so the finalized transcript never carries a
    /// pending entry.
    pub fn complete_pending(&self, reason: &str) {
        let pending: Vec<(EventId, Event)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .events
                .iter()
                .enumerate()
                .filter(|(_, r)| r.event.is_pending())
                .map(|(id, r)| (id, r.event.clone()))
                .collect()
        };
        for (id, event) in pending {
            let completed = match event {
                Event::Model {
                    model,
                    input,
                    tools,
                    tool_choice,
                    config,
                    cache,
                    time,
                    ..
                } => Event::Model {
                    model,
                    input,
                    tools,
                    tool_choice,
                    config,
                    output: None,
                    cache,
                    time,
                    pending: false,
                    error: Some(reason.to_string()),
                    traceback: None,
                },
                Event::Tool { call, time, .. } => Event::Tool {
                    call,
                    result: None,
                    error: Some(verdict_model::tool::ToolCallError::unknown(reason)),
                    time,
                    pending: false,
                },
                other => other,
            };
            self.event_updated(id, completed);
        }
    }

    /// Number of events still marked pending.  Zero after a completed
    /// sample — every pending event must eventually be completed with an
    /// output or an error.
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|r| r.event.is_pending())
            .count()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
