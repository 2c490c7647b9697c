// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier generated by the model (forwarded verbatim on the
    /// matching tool message).
    pub id: String,
    /// Name of the function the model wants to call.
    pub function: String,
    /// Parsed JSON arguments keyed by parameter name.
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
    /// Set when the provider could not parse the model's raw arguments;
    /// surfaced to the model as a parsing error by the tool engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            function: function.into(),
            arguments: BTreeMap::new(),
            parse_error: None,
        }
    }

    pub fn with_arguments(
        id: impl Into<String>,
        function: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        let arguments = match arguments {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Self {
            id: id.into(),
            function: function.into(),
            arguments,
            parse_error: None,
        }
    }
}

/// Typed error attached to a tool message.
///
/// Parsing and runtime tool errors are non-fatal: they are surfaced to the
/// model as the content of the tool message so it can correct course.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallError {
    #[serde(rename = "type")]
    pub kind: ToolCallErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallErrorKind {
    Parsing,
    Timeout,
    Permission,
    FileNotFound,
    IsADirectory,
    Unknown,
}

impl ToolCallError {
    pub fn new(kind: ToolCallErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ToolCallErrorKind::Parsing, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolCallErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ToolCallErrorKind::Unknown, message)
    }
}

impl std::fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// JSON-schema-shaped description of one tool, passed to the model on every
/// generate call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

impl ToolInfo {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Directive to the model as to which tools to prefer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides whether and which tools to call.
    #[default]
    Auto,
    /// The model must call some tool.
    Any,
    /// Tool calling is disabled for this generate.
    None,
    /// The model must call this specific tool.
    Function(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
