//! Bridges extension-contributed tools into the agent's tool interface.
//!
//! The bridge only aggregates and adapts -- it never invokes the
//! registry's tool hooks.  Those fire exactly once per call at the
//! agent's dispatch site (see [`crate::app`]), so consulting the bridge
//! repeatedly can never double-apply them.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::tools::{AgentTool, ToolCall, ToolInfo, ToolResponse};

use super::{ExtensionRegistry, Tool};

/// Adapter presenting a contract [`Tool`] as an [`AgentTool`].
struct PluginTool {
    inner: Arc<dyn Tool>,
}

#[async_trait]
impl AgentTool for PluginTool {
    fn info(&self) -> ToolInfo {
        self.inner.info()
    }

    // Default provider_options: plugin tools carry no per-provider
    // extras, so the empty map from the trait default applies.

    async fn run(&self, cancel: CancellationToken, call: ToolCall) -> anyhow::Result<ToolResponse> {
        self.inner.run(cancel, call).await
    }
}

/// Aggregates tools from every loaded extension.
pub struct ToolBridge {
    registry: Arc<ExtensionRegistry>,
}

impl ToolBridge {
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self { registry }
    }

    /// All extension-contributed tools, wrapped for the agent.
    ///
    /// Tool names must be unique across the aggregated set; on
    /// collision the first-registered tool wins and the duplicate is
    /// logged.
    pub fn plugin_tools(&self) -> Vec<Arc<dyn AgentTool>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<Arc<dyn AgentTool>> = Vec::new();

        for ext in self.registry.extensions_snapshot() {
            let owner = ext.info().name;
            for tool in ext.tools() {
                let name = tool.info().name;
                if !seen.insert(name.clone()) {
                    warn!(tool = %name, extension = %owner, "duplicate tool name, keeping first");
                    continue;
                }
                out.push(Arc::new(PluginTool { inner: tool }));
            }
        }
        out
    }
}
