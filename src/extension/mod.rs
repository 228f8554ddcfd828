//! Extension contract.
//!
//! An extension is an externally supplied object loaded into the host
//! process.  It identifies itself via [`ExtensionInfo`], receives an
//! [`ExtensionContext`] in `init`, contributes lifecycle hooks through
//! [`Hooks`], and may expose tools to the agent via [`Extension::tools`].
//!
//! Hook groups are independent traits whose default method bodies are
//! no-ops, so an implementation overrides only the events it cares
//! about.  A group an extension does not provide at all is simply left
//! as `None` in its [`Hooks`] bundle and never enters a pipeline.

pub mod bridge;
pub mod loader;
pub mod registry;

pub use bridge::ToolBridge;
pub use loader::{load_all, LoadError, ENTRY_SYMBOL};
pub use registry::ExtensionRegistry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::message::{Message, MessageService};
use crate::permission::{PermissionRequest, PermissionService};
use crate::session::{Session, SessionService};
use crate::tools::{ToolCall, ToolInfo, ToolResponse};

/// Descriptive record for a loaded extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Unique ASCII identifier; duplicate names are a hard load error.
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
}

/// True when `name` is a non-empty ASCII identifier
/// (`[A-Za-z0-9_-]+`).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Everything an extension receives at init time.
///
/// Lives for the whole host process.  Extensions must not retain clones
/// past their `shutdown`.
#[derive(Clone)]
pub struct ExtensionContext {
    /// The validated host configuration.  Config hooks mutate it under
    /// the write lock; everyone else reads.
    pub config: Arc<RwLock<Config>>,
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub permissions: Arc<PermissionService>,
    /// Host working directory.
    pub working_dir: PathBuf,
}

/// Verdict returned by a permission hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    /// No opinion; the pipeline continues and the host falls through to
    /// its interactive prompt.
    #[default]
    None,
}

/// Input record threaded through the tool execute hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecuteInput {
    pub tool_name: String,
    /// Raw JSON argument payload.  Replaced along the pipeline whenever
    /// a before-hook returns modified arguments.
    pub arguments: String,
    pub call_id: String,
    pub session_id: String,
}

/// Configuration lifecycle hook.
#[async_trait]
pub trait ConfigHooks: Send + Sync {
    /// Invoked once, after the host parses configuration but before any
    /// service consumes it.  May mutate `config` in place.  An error
    /// aborts startup.
    ///
    /// The configuration is handed in directly; reading it through
    /// [`ExtensionContext::config`] inside this hook would deadlock on
    /// the write lock the trigger holds.
    async fn on_config_load(
        &self,
        cancel: &CancellationToken,
        config: &mut Config,
    ) -> anyhow::Result<()> {
        let _ = (cancel, config);
        Ok(())
    }
}

/// Session lifecycle hooks.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn on_session_created(
        &self,
        cancel: &CancellationToken,
        session: &Session,
    ) -> anyhow::Result<()> {
        let _ = (cancel, session);
        Ok(())
    }

    async fn on_session_updated(
        &self,
        cancel: &CancellationToken,
        session: &Session,
    ) -> anyhow::Result<()> {
        let _ = (cancel, session);
        Ok(())
    }

    async fn on_session_deleted(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let _ = (cancel, session_id);
        Ok(())
    }
}

/// Message lifecycle hooks.
#[async_trait]
pub trait MessageHooks: Send + Sync {
    async fn on_message_created(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> anyhow::Result<()> {
        let _ = (cancel, message);
        Ok(())
    }

    async fn on_message_updated(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> anyhow::Result<()> {
        let _ = (cancel, message);
        Ok(())
    }
}

/// Permission decision hook.
#[async_trait]
pub trait PermissionHooks: Send + Sync {
    /// The pipeline stops at the first non-[`Decision::None`] verdict.
    /// An error aborts the check and is reported as denial.
    async fn on_permission_request(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> anyhow::Result<Decision> {
        let _ = (cancel, request);
        Ok(Decision::None)
    }
}

/// Tool execution interception hooks.
#[async_trait]
pub trait ToolHooks: Send + Sync {
    /// Return `Some(args)` to replace the raw JSON arguments seen by
    /// subsequent hooks and by the tool itself; `None` leaves them
    /// unchanged.  An error aborts the call before the tool runs.
    async fn on_tool_execute_before(
        &self,
        cancel: &CancellationToken,
        input: &ToolExecuteInput,
    ) -> anyhow::Result<Option<String>> {
        let _ = (cancel, input);
        Ok(None)
    }

    /// Return `Some(response)` to replace the result seen by subsequent
    /// hooks and by the agent.  An error fails the call even though the
    /// tool's side effects have already occurred.
    async fn on_tool_execute_after(
        &self,
        cancel: &CancellationToken,
        input: &ToolExecuteInput,
        result: &ToolResponse,
    ) -> anyhow::Result<Option<ToolResponse>> {
        let _ = (cancel, input, result);
        Ok(None)
    }
}

/// Agent step-loop observation hooks.  Errors are logged, never fatal.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn on_agent_start(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let _ = (cancel, session_id);
        Ok(())
    }

    async fn on_agent_step(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        step: u64,
    ) -> anyhow::Result<()> {
        let _ = (cancel, session_id, step);
        Ok(())
    }

    async fn on_agent_finish(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> anyhow::Result<()> {
        let _ = (cancel, session_id);
        Ok(())
    }
}

/// The six hook groups an extension may contribute.
///
/// `None` slots are skipped at registration, so pipelines only ever
/// contain groups an extension actually provided.
#[derive(Default, Clone)]
pub struct Hooks {
    pub config: Option<Arc<dyn ConfigHooks>>,
    pub session: Option<Arc<dyn SessionHooks>>,
    pub message: Option<Arc<dyn MessageHooks>>,
    pub permission: Option<Arc<dyn PermissionHooks>>,
    pub tool: Option<Arc<dyn ToolHooks>>,
    pub agent: Option<Arc<dyn AgentHooks>>,
}

impl Hooks {
    /// A bundle contributing nothing.
    pub fn none() -> Self {
        Self::default()
    }
}

/// A tool contributed by an extension.
///
/// Reaches the agent through the bridge adapter, which supplies the
/// agent-side extras (provider options).
#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;

    async fn run(&self, cancel: CancellationToken, call: ToolCall) -> anyhow::Result<ToolResponse>;
}

/// The contract every loaded artifact satisfies.
///
/// Exactly one instance exists per artifact.  `init` runs on the
/// loading thread before the extension is registered; hooks run on
/// arbitrary threads afterwards; `shutdown` runs once before process
/// exit.
#[async_trait]
pub trait Extension: Send + Sync {
    fn info(&self) -> ExtensionInfo;

    async fn init(&self, ctx: &ExtensionContext) -> anyhow::Result<()>;

    fn hooks(&self) -> Hooks;

    async fn shutdown(&self) -> anyhow::Result<()>;

    /// Tools this extension contributes to the agent.
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("audit-log"));
        assert!(is_valid_name("Audit_Log2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("naïve"));
    }

    #[test]
    fn decision_default_is_none() {
        assert_eq!(Decision::default(), Decision::None);
    }

    #[test]
    fn decision_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Decision::Allow).unwrap(), "\"allow\"");
        assert_eq!(serde_json::to_string(&Decision::Deny).unwrap(), "\"deny\"");
        assert_eq!(serde_json::to_string(&Decision::None).unwrap(), "\"none\"");
    }

    #[test]
    fn empty_hooks_contribute_nothing() {
        let hooks = Hooks::none();
        assert!(hooks.config.is_none());
        assert!(hooks.session.is_none());
        assert!(hooks.message.is_none());
        assert!(hooks.permission.is_none());
        assert!(hooks.tool.is_none());
        assert!(hooks.agent.is_none());
    }

    // Default hook bodies must be callable no-ops.
    struct Bare;
    impl SessionHooks for Bare {}
    impl PermissionHooks for Bare {}
    impl ToolHooks for Bare {}

    #[tokio::test]
    async fn default_bodies_are_noops() {
        let bare = Bare;
        let cancel = CancellationToken::new();
        bare.on_session_deleted(&cancel, "s1").await.unwrap();

        let req = PermissionRequest {
            id: "r".into(),
            session_id: "s".into(),
            tool_name: "view".into(),
            action: "read".into(),
            description: "d".into(),
            params: None,
            path: None,
        };
        assert_eq!(
            bare.on_permission_request(&cancel, &req).await.unwrap(),
            Decision::None
        );

        let input = ToolExecuteInput {
            tool_name: "view".into(),
            arguments: "{}".into(),
            call_id: "c".into(),
            session_id: "s".into(),
        };
        assert!(bare
            .on_tool_execute_before(&cancel, &input)
            .await
            .unwrap()
            .is_none());
    }
}
