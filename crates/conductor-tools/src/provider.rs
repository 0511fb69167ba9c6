// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ToolError;
use crate::tool::Tool;

/// Lookup surface an agent uses to discover and fetch tools by name.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// All tools, sorted by name for deterministic schema ordering.
    fn get_tools(&self) -> Vec<Arc<dyn Tool>>;

    fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>>;

    /// Providers with lazy setup (remote discovery, auth handshakes) override
    /// this; the default is a no-op.
    async fn ensure_initialized(&self) -> Result<(), ToolError> {
        Ok(())
    }
}

/// In-memory provider over a fixed tool set.
pub struct StaticToolProvider {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl StaticToolProvider {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let tool: Arc<dyn Tool> = Arc::new(tool);
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for StaticToolProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolProvider for StaticToolProvider {
    fn get_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.values().cloned().collect();
        tools.sort_by_key(|t| t.definition().name);
        tools
    }

    fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}

/// Aggregates several providers behind one lookup surface.
///
/// Name collisions resolve to the first provider that registered the name;
/// later providers' duplicates are skipped.
pub struct CompositeToolProvider {
    providers: Vec<Arc<dyn ToolProvider>>,
}

impl CompositeToolProvider {
    pub fn new(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl ToolProvider for CompositeToolProvider {
    fn get_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut seen = std::collections::HashSet::new();
        let mut tools = Vec::new();
        for provider in &self.providers {
            for tool in provider.get_tools() {
                if seen.insert(tool.definition().name) {
                    tools.push(tool);
                }
            }
        }
        tools.sort_by_key(|t| t.definition().name);
        tools
    }

    fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.providers.iter().find_map(|p| p.get_tool(name))
    }

    async fn ensure_initialized(&self) -> Result<(), ToolError> {
        for provider in &self.providers {
            provider.ensure_initialized().await?;
        }
        Ok(())
    }
}

/// Metadata describing one named toolset (a specialist's capability group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsetInfo {
    pub id: String,
    pub description: String,
}

/// Registry of named toolsets used by the hierarchical-planner mode: the
/// delegate tool resolves a specialist id to its provider, and the manager
/// aggregates all sets into a master provider.
pub trait ToolsetOrchestrator: Send + Sync {
    fn toolsets(&self) -> Vec<ToolsetInfo>;

    fn provider(&self, toolset_id: &str) -> Option<Arc<dyn ToolProvider>>;
}

/// In-memory orchestrator over a fixed list of toolsets.
pub struct StaticToolsetOrchestrator {
    sets: Vec<(ToolsetInfo, Arc<dyn ToolProvider>)>,
}

impl StaticToolsetOrchestrator {
    pub fn new() -> Self {
        Self { sets: Vec::new() }
    }

    pub fn add(
        &mut self,
        id: impl Into<String>,
        description: impl Into<String>,
        provider: Arc<dyn ToolProvider>,
    ) {
        self.sets.push((
            ToolsetInfo { id: id.into(), description: description.into() },
            provider,
        ));
    }

    /// All member providers, for building the aggregated master provider.
    pub fn all_providers(&self) -> Vec<Arc<dyn ToolProvider>> {
        self.sets.iter().map(|(_, p)| Arc::clone(p)).collect()
    }
}

impl Default for StaticToolsetOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolsetOrchestrator for StaticToolsetOrchestrator {
    fn toolsets(&self) -> Vec<ToolsetInfo> {
        self.sets.iter().map(|(info, _)| info.clone()).collect()
    }

    fn provider(&self, toolset_id: &str) -> Option<Arc<dyn ToolProvider>> {
        self.sets
            .iter()
            .find(|(info, _)| info.id == toolset_id)
            .map(|(_, p)| Arc::clone(p))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
