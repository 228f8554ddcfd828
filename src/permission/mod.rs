//! Permission requests.
//!
//! At each decision point the host builds a [`PermissionRequest`] and
//! asks the extension runtime for a verdict before (optionally) falling
//! back to an interactive prompt.  The service here issues the records
//! and publishes them so observers (e.g. an audit extension) can watch
//! the stream.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pubsub::{Broker, Event, EventKind};

/// A request to perform a guarded action on behalf of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Unique request identifier.
    pub id: String,
    /// Session the request originates from.
    pub session_id: String,
    /// Tool asking for permission (e.g. `"bash"`).
    pub tool_name: String,
    /// Action within the tool (e.g. `"execute"`, `"write"`).
    pub action: String,
    /// Human-readable description shown in the prompt fallback.
    pub description: String,
    /// Tool parameters relevant to the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// Filesystem path the action touches, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Issues permission requests and publishes them for observers.
#[derive(Debug, Default)]
pub struct PermissionService {
    broker: Broker<PermissionRequest>,
}

impl PermissionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request record with a fresh id and publish it.
    pub fn create_request(
        &self,
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> PermissionRequest {
        let req = PermissionRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            tool_name: tool_name.into(),
            action: action.into(),
            description: description.into(),
            params,
            path: None,
        };
        self.broker.publish(EventKind::Created, req.clone());
        req
    }

    /// Subscribe to the request stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event<PermissionRequest>> {
        self.broker.subscribe()
    }
}
