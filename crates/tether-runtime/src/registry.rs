use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use tether_core::{Result, Tool, ToolContext, ToolDescriptor, ToolResult, StreamingTool};

/// Namespace marker for MCP-provided tools: `mcp__<server>__<tool>`.
pub const MCP_PREFIX: &str = "mcp__";

/// An external tool server. The kernel treats it as an opaque source of
/// tools with change notifications; transport framing lives elsewhere.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Server name used in the namespaced tool names.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Invoke a tool by its un-namespaced name.
    async fn call_tool(
        &self,
        name: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolResult>;
}

/// A registered tool; streaming tools keep their streaming interface.
#[derive(Clone)]
pub enum ToolEntry {
    Plain(Arc<dyn Tool>),
    Streaming(Arc<dyn StreamingTool>),
}

impl ToolEntry {
    pub fn descriptor(&self) -> ToolDescriptor {
        match self {
            ToolEntry::Plain(t) => t.descriptor(),
            ToolEntry::Streaming(t) => t.descriptor(),
        }
    }

    pub fn name(&self) -> String {
        self.descriptor().name
    }

    pub fn capabilities(&self) -> Vec<String> {
        match self {
            ToolEntry::Plain(t) => t.capabilities(),
            ToolEntry::Streaming(t) => t.capabilities(),
        }
    }

    pub fn schema(&self) -> serde_json::Value {
        match self {
            ToolEntry::Plain(t) => t.schema(),
            ToolEntry::Streaming(t) => t.schema(),
        }
    }
}

/// Read-mostly tool registry: user-supplied tools plus namespaced tools
/// exported by connected MCP sessions.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    tools: HashMap<String, ToolEntry>,
    /// Server name -> namespaced tool names currently registered for it.
    mcp_tools: HashMap<String, Vec<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "tool registered");
        self.inner.write().tools.insert(name, ToolEntry::Plain(tool));
    }

    pub fn register_streaming(&self, tool: Arc<dyn StreamingTool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "streaming tool registered");
        self.inner
            .write()
            .tools
            .insert(name, ToolEntry::Streaming(tool));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.write().tools.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<ToolEntry> {
        self.inner.read().tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.read().tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tools.is_empty()
    }

    /// Descriptors for every registered tool, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .inner
            .read()
            .tools
            .values()
            .map(|t| t.descriptor())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Re-synchronize the namespaced tool set exported by an MCP session.
    /// Replaces the server's previous tools; returns the new names.
    pub async fn sync_mcp(&self, session: Arc<dyn McpSession>) -> Result<Vec<String>> {
        let descriptors = session.list_tools().await?;
        let server = session.name().to_string();
        let mut names = Vec::with_capacity(descriptors.len());
        let mut entries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let namespaced = format!("{MCP_PREFIX}{server}__{}", descriptor.name);
            names.push(namespaced.clone());
            entries.push((
                namespaced.clone(),
                ToolEntry::Plain(Arc::new(McpToolAdapter {
                    session: Arc::clone(&session),
                    raw_name: descriptor.name.clone(),
                    descriptor: ToolDescriptor {
                        name: namespaced,
                        ..descriptor
                    },
                })),
            ));
        }

        let mut inner = self.inner.write();
        if let Some(old) = inner.mcp_tools.remove(&server) {
            for name in old {
                inner.tools.remove(&name);
            }
        }
        for (name, entry) in entries {
            inner.tools.insert(name, entry);
        }
        inner.mcp_tools.insert(server.clone(), names.clone());
        info!(server = %server, tools = names.len(), "mcp tools synchronized");
        Ok(names)
    }
}

// Routes a namespaced registry entry back to the MCP session that owns it.
struct McpToolAdapter {
    session: Arc<dyn McpSession>,
    raw_name: String,
    descriptor: ToolDescriptor,
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn schema(&self) -> serde_json::Value {
        self.descriptor.parameters.clone()
    }

    fn capabilities(&self) -> Vec<String> {
        self.descriptor.capabilities.clone()
    }

    async fn execute(
        &self,
        _ctx: &ToolContext,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ToolResult> {
        self.session.call_tool(&self.raw_name, params).await
    }
}
