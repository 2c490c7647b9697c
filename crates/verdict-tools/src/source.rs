// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;

use crate::tool::Tool;

/// Anything that can asynchronously yield a list of tools.
///
/// Used for connections whose tool inventory is not known until runtime
/// (an MCP server, tools bridged out of a sandbox).  A plain `Vec` of
/// tools is itself a source, so call sites accept `&dyn ToolSource`
/// uniformly.
#[async_trait]
pub trait ToolSource: Send + Sync {
    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>>;
}

#[async_trait]
impl ToolSource for Vec<Arc<dyn Tool>> {
    async fn tools(&self) -> anyhow::Result<Vec<Arc<dyn Tool>>> {
        Ok(self.clone())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
