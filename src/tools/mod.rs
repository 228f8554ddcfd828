//! Agent-facing tool interface.
//!
//! [`AgentTool`] is the shape the language-model agent dispatches
//! against.  Extension-contributed tools implement the leaner
//! [`crate::extension::Tool`] contract and reach the agent through the
//! bridge adapter in [`crate::extension::bridge`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Metadata describing a tool available to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Short machine-friendly name (e.g. `"view"`).
    pub name: String,
    /// Human-readable one-liner describing what the tool does.
    pub description: String,
    /// JSON Schema object describing the expected parameters.
    pub parameters: Value,
    /// Names of required parameters.
    #[serde(default)]
    pub required: Vec<String>,
}

/// A single tool invocation issued by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call identifier.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// Raw JSON parameter payload.
    pub input: String,
    /// Session the call belongs to.
    pub session_id: String,
    /// Assistant message that carried the call.
    pub message_id: String,
}

/// Result of a tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResponse {
    /// Text output shown to the model.
    pub content: String,
    /// True when the content describes a failure.
    #[serde(default)]
    pub is_error: bool,
    /// Optional structured metadata attached to the response.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ToolResponse {
    /// Successful text response.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            metadata: HashMap::new(),
        }
    }

    /// Error response.
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Trait implemented by every tool the agent can dispatch.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Descriptor injected into the model's tool definitions.
    fn info(&self) -> ToolInfo;

    /// Per-provider option map forwarded with the tool definition.
    fn provider_options(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// Execute the tool.
    async fn run(&self, cancel: CancellationToken, call: ToolCall) -> anyhow::Result<ToolResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_response_is_not_error() {
        let r = ToolResponse::text("ok");
        assert_eq!(r.content, "ok");
        assert!(!r.is_error);
        assert!(r.metadata.is_empty());
    }

    #[test]
    fn error_response_sets_flag() {
        let r = ToolResponse::error("boom");
        assert!(r.is_error);
    }

    #[test]
    fn with_metadata_accumulates() {
        let r = ToolResponse::text("ok")
            .with_metadata("elapsed_ms", serde_json::json!(12))
            .with_metadata("cached", serde_json::json!(true));
        assert_eq!(r.metadata.len(), 2);
        assert_eq!(r.metadata["cached"], serde_json::json!(true));
    }

    #[test]
    fn tool_info_serializes_schema_verbatim() {
        let info = ToolInfo {
            name: "view".into(),
            description: "Read a file".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } }
            }),
            required: vec!["path".into()],
        };
        let round: ToolInfo =
            serde_json::from_str(&serde_json::to_string(&info).unwrap()).unwrap();
        assert_eq!(round.parameters["properties"]["path"]["type"], "string");
        assert_eq!(round.required, vec!["path"]);
    }
}
