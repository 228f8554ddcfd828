//! Integration surface wiring the extension runtime into the host.
//!
//! [`App::bootstrap`] builds the service handles, registers the
//! built-in skills extension, loads the configured plugins, and fires
//! the config-load hook.  Afterwards one forwarder task per service
//! stream pushes session and message events into the registry, so a
//! slow session hook never stalls message hooks.  Each event gets at
//! most [`FORWARD_TIMEOUT`] in its pipeline; on elapse the forwarder
//! drops the event and moves on rather than stalling the stream.  The
//! permission, tool, and agent checkpoints live here too: the agent's
//! dispatcher calls [`App::execute_tool`], which is the single site
//! where tool hooks fire.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::extension::{
    loader, Decision, ExtensionContext, ExtensionRegistry, ToolBridge, ToolExecuteInput,
};
use crate::message::MessageService;
use crate::permission::{PermissionRequest, PermissionService};
use crate::pubsub::EventKind;
use crate::session::SessionService;
use crate::skills::SkillsExtension;
use crate::tools::{AgentTool, ToolCall, ToolResponse};

/// How long one event may spend in the hook pipeline before the
/// forwarder drops it.  An elapsed timeout cancels the remainder of
/// that event's pipeline walk at its next await point.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(2);

/// Host-side handle over the extension runtime.
pub struct App {
    pub config: Arc<RwLock<Config>>,
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub permissions: Arc<PermissionService>,
    pub extensions: Arc<ExtensionRegistry>,
    pub working_dir: PathBuf,
    bridge: ToolBridge,
    cancel: CancellationToken,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Build services, load extensions, fire the config hook, and start
    /// the event forwarders.
    ///
    /// Per-extension failures are warned and skipped; a config hook
    /// error aborts startup.
    pub async fn bootstrap(config: Config, working_dir: PathBuf) -> anyhow::Result<Arc<App>> {
        let config = Arc::new(RwLock::new(config));
        let sessions = Arc::new(SessionService::new());
        let messages = Arc::new(MessageService::new());
        let permissions = Arc::new(PermissionService::new());
        let extensions = Arc::new(ExtensionRegistry::new());
        let cancel = CancellationToken::new();

        let ctx = ExtensionContext {
            config: Arc::clone(&config),
            sessions: Arc::clone(&sessions),
            messages: Arc::clone(&messages),
            permissions: Arc::clone(&permissions),
            working_dir: working_dir.clone(),
        };

        // Built-in skills extension first, then the configured plugins.
        let skills = Arc::new(SkillsExtension::with_default_roots(&working_dir));
        if let Err(e) = extensions.load(skills, &ctx).await {
            warn!(error = %e, "skills extension not registered");
        }

        let paths = { config.read().await.plugins.clone() };
        loader::load_all(&extensions, &ctx, &paths).await;

        {
            let mut cfg = config.write().await;
            extensions
                .trigger_config_load(&cancel, &mut cfg)
                .await
                .context("config hook aborted startup")?;
        }

        let bridge = ToolBridge::new(Arc::clone(&extensions));
        let app = Arc::new(App {
            config,
            sessions,
            messages,
            permissions,
            extensions,
            working_dir,
            bridge,
            cancel,
            forwarders: Mutex::new(Vec::new()),
        });
        app.spawn_forwarders();
        Ok(app)
    }

    /// Context handed to every extension at init.
    pub fn extension_context(&self) -> ExtensionContext {
        ExtensionContext {
            config: Arc::clone(&self.config),
            sessions: Arc::clone(&self.sessions),
            messages: Arc::clone(&self.messages),
            permissions: Arc::clone(&self.permissions),
            working_dir: self.working_dir.clone(),
        }
    }

    /// Extension-contributed tools for the agent's tool registry.
    pub fn agent_tools(&self) -> Vec<Arc<dyn AgentTool>> {
        self.bridge.plugin_tools()
    }

    /// Permission checkpoint.  `Allow` proceeds, `Deny` refuses,
    /// `None` falls through to the host's interactive prompt.  A hook
    /// error is conservative: the request is denied.
    pub async fn check_permission(&self, request: &PermissionRequest) -> Decision {
        match self
            .extensions
            .trigger_permission_request(&self.cancel, request)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "permission hook failed, denying request");
                Decision::Deny
            }
        }
    }

    /// Dispatch one tool call, applying the tool hooks around it.
    ///
    /// A before-hook error fails the call without invoking the tool.
    /// An after-hook error fails the call even though the tool's side
    /// effects have already occurred; the original output is carried in
    /// the error context.
    pub async fn execute_tool(
        &self,
        tool: &dyn AgentTool,
        call: ToolCall,
    ) -> anyhow::Result<ToolResponse> {
        let mut input = ToolExecuteInput {
            tool_name: call.name.clone(),
            arguments: call.input.clone(),
            call_id: call.id.clone(),
            session_id: call.session_id.clone(),
        };

        let args = self
            .extensions
            .trigger_tool_execute_before(&self.cancel, &input)
            .await
            .with_context(|| format!("tool call {} aborted before execution", call.id))?;

        input.arguments = args.clone();
        let mut call = call;
        call.input = args;

        let result = match std::panic::AssertUnwindSafe(tool.run(self.cancel.clone(), call))
            .catch_unwind()
            .await
        {
            Ok(result) => result?,
            Err(panic) => anyhow::bail!(
                "tool {} panicked: {}",
                input.tool_name,
                crate::extension::registry::panic_message(panic.as_ref())
            ),
        };

        match self
            .extensions
            .trigger_tool_execute_after(&self.cancel, &input, &result)
            .await
        {
            Ok(final_result) => Ok(final_result),
            Err(e) => Err(e.context(format!(
                "tool already ran; original output: {}",
                truncate_utf8(&result.content, 512)
            ))),
        }
    }

    /// Agent step-loop notifications.  Hook errors are logged only.
    pub async fn agent_started(&self, session_id: &str) {
        if let Err(e) = self
            .extensions
            .trigger_agent_start(&self.cancel, session_id)
            .await
        {
            warn!(session_id, error = %e, "agent hook failed");
        }
    }

    pub async fn agent_stepped(&self, session_id: &str, step: u64) {
        if let Err(e) = self
            .extensions
            .trigger_agent_step(&self.cancel, session_id, step)
            .await
        {
            warn!(session_id, step, error = %e, "agent hook failed");
        }
    }

    pub async fn agent_finished(&self, session_id: &str) {
        if let Err(e) = self
            .extensions
            .trigger_agent_finish(&self.cancel, session_id)
            .await
        {
            warn!(session_id, error = %e, "agent hook failed");
        }
    }

    /// Stop the forwarders, then shut every extension down.
    ///
    /// Called once the agent and event producers are already drained.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .forwarders
            .lock()
            .expect("forwarders poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.extensions.shutdown_all().await
    }

    fn spawn_forwarders(self: &Arc<Self>) {
        let mut handles = self.forwarders.lock().expect("forwarders poisoned");
        handles.push(self.spawn_session_forwarder());
        handles.push(self.spawn_message_forwarder());
    }

    fn spawn_session_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let app = Arc::clone(self);
        let mut rx = self.sessions.subscribe();
        tokio::spawn(async move {
            let cancel = app.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(ev) => {
                            let walk = async {
                                match ev.kind {
                                    EventKind::Created => {
                                        app.extensions
                                            .trigger_session_created(&cancel, &ev.payload)
                                            .await
                                    }
                                    EventKind::Updated => {
                                        app.extensions
                                            .trigger_session_updated(&cancel, &ev.payload)
                                            .await
                                    }
                                    EventKind::Deleted => {
                                        app.extensions
                                            .trigger_session_deleted(&cancel, &ev.payload.id)
                                            .await
                                    }
                                }
                            };
                            match tokio::time::timeout(FORWARD_TIMEOUT, walk).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(session_id = %ev.payload.id, error = %e, "session hook failed");
                                }
                                Err(_) => {
                                    warn!(session_id = %ev.payload.id, "session hooks timed out, event dropped");
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "session event forwarder lagged, dropped events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("session event forwarder stopped");
        })
    }

    fn spawn_message_forwarder(self: &Arc<Self>) -> JoinHandle<()> {
        let app = Arc::clone(self);
        let mut rx = self.messages.subscribe();
        tokio::spawn(async move {
            let cancel = app.cancel.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(ev) => {
                            let walk = async {
                                match ev.kind {
                                    EventKind::Created => {
                                        app.extensions
                                            .trigger_message_created(&cancel, &ev.payload)
                                            .await
                                    }
                                    EventKind::Updated => {
                                        app.extensions
                                            .trigger_message_updated(&cancel, &ev.payload)
                                            .await
                                    }
                                    // The message service never deletes.
                                    EventKind::Deleted => Ok(()),
                                }
                            };
                            match tokio::time::timeout(FORWARD_TIMEOUT, walk).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    warn!(message_id = %ev.payload.id, error = %e, "message hook failed");
                                }
                                Err(_) => {
                                    warn!(message_id = %ev.payload.id, "message hooks timed out, event dropped");
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "message event forwarder lagged, dropped events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("message event forwarder stopped");
        })
    }
}

/// Truncate `s` to at most `max_bytes` on a char boundary.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{Extension, ExtensionInfo, Hooks, ToolHooks};
    use crate::tools::ToolInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    struct CountingTool {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentTool for CountingTool {
        fn info(&self) -> ToolInfo {
            ToolInfo {
                name: "counting".into(),
                description: "counts invocations".into(),
                parameters: serde_json::json!({ "type": "object" }),
                required: Vec::new(),
            }
        }
        async fn run(
            &self,
            _cancel: CancellationToken,
            call: ToolCall,
        ) -> anyhow::Result<ToolResponse> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResponse::text(format!("ran with {}", call.input)))
        }
    }

    struct HookedExtension {
        name: &'static str,
        hooks: Hooks,
    }

    #[async_trait]
    impl Extension for HookedExtension {
        fn info(&self) -> ExtensionInfo {
            ExtensionInfo {
                name: self.name.into(),
                version: "0.1.0".into(),
                description: "test".into(),
                author: "tests".into(),
            }
        }
        async fn init(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn hooks(&self) -> Hooks {
            self.hooks.clone()
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailBefore;

    #[async_trait]
    impl ToolHooks for FailBefore {
        async fn on_tool_execute_before(
            &self,
            _cancel: &CancellationToken,
            _input: &ToolExecuteInput,
        ) -> anyhow::Result<Option<String>> {
            anyhow::bail!("blocked by policy")
        }
    }

    struct FailAfter;

    #[async_trait]
    impl ToolHooks for FailAfter {
        async fn on_tool_execute_after(
            &self,
            _cancel: &CancellationToken,
            _input: &ToolExecuteInput,
            _result: &ToolResponse,
        ) -> anyhow::Result<Option<ToolResponse>> {
            anyhow::bail!("audit sink unavailable")
        }
    }

    async fn test_app() -> Arc<App> {
        let dir = tempfile::tempdir().unwrap();
        App::bootstrap(Config::default(), dir.path().to_path_buf())
            .await
            .unwrap()
    }

    fn call() -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "counting".into(),
            input: "{}".into(),
            session_id: "s1".into(),
            message_id: "m1".into(),
        }
    }

    #[tokio::test]
    async fn bootstrap_registers_builtin_skills_extension() {
        let app = test_app().await;
        let names: Vec<String> = app.extensions.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["skills"]);
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn before_hook_error_prevents_tool_run() {
        let app = test_app().await;
        app.extensions
            .load(
                Arc::new(HookedExtension {
                    name: "gate",
                    hooks: Hooks {
                        tool: Some(Arc::new(FailBefore)),
                        ..Hooks::none()
                    },
                }),
                &app.extension_context(),
            )
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let tool = CountingTool {
            runs: Arc::clone(&runs),
        };
        let err = app.execute_tool(&tool, call()).await.unwrap_err();
        assert!(format!("{err:#}").contains("blocked by policy"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn after_hook_error_carries_original_output() {
        let app = test_app().await;
        app.extensions
            .load(
                Arc::new(HookedExtension {
                    name: "audit",
                    hooks: Hooks {
                        tool: Some(Arc::new(FailAfter)),
                        ..Hooks::none()
                    },
                }),
                &app.extension_context(),
            )
            .await
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let tool = CountingTool {
            runs: Arc::clone(&runs),
        };
        let err = app.execute_tool(&tool, call()).await.unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("tool already ran"), "{text}");
        assert!(text.contains("ran with {}"), "{text}");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn permission_hook_error_denies() {
        struct FailingPermission;

        #[async_trait]
        impl crate::extension::PermissionHooks for FailingPermission {
            async fn on_permission_request(
                &self,
                _cancel: &CancellationToken,
                _request: &PermissionRequest,
            ) -> anyhow::Result<Decision> {
                anyhow::bail!("policy store unreachable")
            }
        }

        let app = test_app().await;
        app.extensions
            .load(
                Arc::new(HookedExtension {
                    name: "policy",
                    hooks: Hooks {
                        permission: Some(Arc::new(FailingPermission)),
                        ..Hooks::none()
                    },
                }),
                &app.extension_context(),
            )
            .await
            .unwrap();

        let req = app
            .permissions
            .create_request("s1", "bash", "execute", "run `rm`", None);
        assert_eq!(app.check_permission(&req).await, Decision::Deny);
        app.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn zero_config_checkpoints_are_noops() {
        let app = test_app().await;
        // Only the built-in skills extension is loaded; no hooks exist.
        let req = app
            .permissions
            .create_request("s1", "view", "read", "read a file", None);
        assert_eq!(app.check_permission(&req).await, Decision::None);
        app.agent_started("s1").await;
        app.agent_stepped("s1", 1).await;
        app.agent_finished("s1").await;
        app.shutdown().await.unwrap();
    }

    struct SlowSession {
        entered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::extension::SessionHooks for SlowSession {
        async fn on_session_created(
            &self,
            _cancel: &CancellationToken,
            _session: &crate::session::Session,
        ) -> anyhow::Result<()> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_session_hook_is_dropped_after_timeout() {
        let app = test_app().await;
        let entered = Arc::new(AtomicUsize::new(0));
        app.extensions
            .load(
                Arc::new(HookedExtension {
                    name: "slow",
                    hooks: Hooks {
                        session: Some(Arc::new(SlowSession {
                            entered: Arc::clone(&entered),
                        })),
                        ..Hooks::none()
                    },
                }),
                &app.extension_context(),
            )
            .await
            .unwrap();

        // The first event's pipeline walk is dropped after
        // FORWARD_TIMEOUT, so the second event still reaches the hook.
        app.sessions.create("one").await;
        app.sessions.create("two").await;

        tokio::time::timeout(Duration::from_secs(30), async {
            while entered.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("second session event never reached the hook");

        app.shutdown().await.unwrap();
    }
}
