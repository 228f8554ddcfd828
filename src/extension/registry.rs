//! Extension registry and hook pipelines.
//!
//! Stores loaded extensions under unique names and collects their hook
//! groups into six append-only pipelines, one per kind.  Pipeline order
//! is registration order, which equals the order of configured paths.
//!
//! Every trigger copies the relevant pipeline under the shared lock,
//! releases it, then invokes the hooks lock-free.  A trigger in flight
//! therefore never observes extensions loaded mid-call, and load or
//! unload never blocks on a firing hook.  Hooks run sequentially so
//! each one observes its predecessors' mutations (tool argument /
//! result threading, permission short-circuit).

use std::future::Future;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Context as _;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::message::Message;
use crate::permission::PermissionRequest;
use crate::session::Session;
use crate::tools::ToolResponse;

use super::{
    AgentHooks, ConfigHooks, Decision, Extension, ExtensionContext, ExtensionInfo, MessageHooks,
    PermissionHooks, SessionHooks, ToolExecuteInput, ToolHooks,
};

/// One registered extension plus the native library that backs it.
struct LoadedExtension {
    info: ExtensionInfo,
    ext: Arc<dyn Extension>,
    /// Keeps dynamically loaded code mapped; `None` for built-ins.
    library: Option<libloading::Library>,
}

/// The six hook pipelines, in registration order.
#[derive(Default)]
struct Pipelines {
    config: Vec<Arc<dyn ConfigHooks>>,
    session: Vec<Arc<dyn SessionHooks>>,
    message: Vec<Arc<dyn MessageHooks>>,
    permission: Vec<Arc<dyn PermissionHooks>>,
    tool: Vec<Arc<dyn ToolHooks>>,
    agent: Vec<Arc<dyn AgentHooks>>,
}

#[derive(Default)]
struct Inner {
    extensions: Vec<LoadedExtension>,
    pipelines: Pipelines,
    /// Native libraries of unloaded extensions.  Their code stays
    /// mapped for the life of the process: pipeline entries may still
    /// reference it after `unload`.
    retired: Vec<libloading::Library>,
}

/// Stores loaded extensions and walks their hook pipelines.
#[derive(Default)]
pub struct ExtensionRegistry {
    inner: RwLock<Inner>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in (statically linked) extension.
    ///
    /// Rejects duplicate names, runs `init`, then appends the
    /// extension's hook groups to the pipelines.  The exclusive lock is
    /// held for the mutation only, never around `init`.
    pub async fn load(
        &self,
        ext: Arc<dyn Extension>,
        ctx: &ExtensionContext,
    ) -> anyhow::Result<()> {
        self.load_with_library(ext, None, ctx).await
    }

    /// Register an extension backed by a dynamically loaded library.
    pub async fn load_with_library(
        &self,
        ext: Arc<dyn Extension>,
        library: Option<libloading::Library>,
        ctx: &ExtensionContext,
    ) -> anyhow::Result<()> {
        // Bundle immediately: `LoadedExtension` declares `ext` before
        // `library`, so on every early return the instance is dropped
        // before the code that backs it is unmapped.
        let entry = LoadedExtension {
            info: ext.info(),
            ext,
            library,
        };
        if self.contains(&entry.info.name) {
            anyhow::bail!("duplicate extension name: {}", entry.info.name);
        }

        match std::panic::AssertUnwindSafe(entry.ext.init(ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => {
                result.with_context(|| format!("init extension {}", entry.info.name))?
            }
            Err(panic) => anyhow::bail!(
                "extension {} panicked during init: {}",
                entry.info.name,
                panic_message(panic.as_ref())
            ),
        }

        let hooks = entry.ext.hooks();
        let mut inner = self.inner.write().expect("extension registry poisoned");
        // Re-check under the exclusive lock: a concurrent load may have
        // registered the same name while init ran.
        if inner.extensions.iter().any(|e| e.info.name == entry.info.name) {
            anyhow::bail!("duplicate extension name: {}", entry.info.name);
        }

        if let Some(h) = hooks.config {
            inner.pipelines.config.push(h);
        }
        if let Some(h) = hooks.session {
            inner.pipelines.session.push(h);
        }
        if let Some(h) = hooks.message {
            inner.pipelines.message.push(h);
        }
        if let Some(h) = hooks.permission {
            inner.pipelines.permission.push(h);
        }
        if let Some(h) = hooks.tool {
            inner.pipelines.tool.push(h);
        }
        if let Some(h) = hooks.agent {
            inner.pipelines.agent.push(h);
        }

        debug!(extension = %entry.info.name, version = %entry.info.version, "extension registered");
        inner.extensions.push(entry);
        Ok(())
    }

    /// Shut down one extension and drop it from the name index.
    ///
    /// Pipelines are NOT rebuilt: hooks already registered keep firing
    /// for the life of the process and are expected to go inert once
    /// the extension has cleaned up its own state in `shutdown`.
    pub async fn unload(&self, name: &str) -> anyhow::Result<()> {
        let ext = {
            let inner = self.inner.read().expect("extension registry poisoned");
            inner
                .extensions
                .iter()
                .find(|e| e.info.name == name)
                .map(|e| Arc::clone(&e.ext))
        };
        let Some(ext) = ext else {
            anyhow::bail!("no extension named {name}");
        };

        guarded_shutdown(name, ext.as_ref())
            .await
            .with_context(|| format!("shutdown extension {name}"))?;

        let mut inner = self.inner.write().expect("extension registry poisoned");
        if let Some(pos) = inner.extensions.iter().position(|e| e.info.name == name) {
            let removed = inner.extensions.remove(pos);
            if let Some(lib) = removed.library {
                inner.retired.push(lib);
            }
        }
        info!(extension = %name, "extension unloaded");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .extensions
            .iter()
            .any(|e| e.info.name == name)
    }

    /// Info records for every loaded extension, in load order.
    pub fn list(&self) -> Vec<ExtensionInfo> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .extensions
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Handles on every loaded extension, in load order.
    pub(crate) fn extensions_snapshot(&self) -> Vec<Arc<dyn Extension>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .extensions
            .iter()
            .map(|e| Arc::clone(&e.ext))
            .collect()
    }

    /// Shut down every loaded extension, accumulating failures, and
    /// reset the registry so a fresh bootstrap starts from empty.
    pub async fn shutdown_all(&self) -> anyhow::Result<()> {
        let drained = {
            let mut inner = self.inner.write().expect("extension registry poisoned");
            inner.pipelines = Pipelines::default();
            std::mem::take(&mut inner.extensions)
        };

        let mut failures = Vec::new();
        for entry in &drained {
            if let Err(e) = guarded_shutdown(&entry.info.name, entry.ext.as_ref()).await {
                warn!(extension = %entry.info.name, error = %e, "extension shutdown failed");
                failures.push(format!("{}: {e:#}", entry.info.name));
            }
        }

        // Retire the native libraries only after every shutdown ran.
        let mut inner = self.inner.write().expect("extension registry poisoned");
        for entry in drained {
            if let Some(lib) = entry.library {
                inner.retired.push(lib);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("extension shutdown failures: {}", failures.join("; "))
        }
    }

    // -- pipeline snapshots ---------------------------------------------

    fn config_pipeline(&self) -> Vec<Arc<dyn ConfigHooks>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .pipelines
            .config
            .clone()
    }

    fn session_pipeline(&self) -> Vec<Arc<dyn SessionHooks>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .pipelines
            .session
            .clone()
    }

    fn message_pipeline(&self) -> Vec<Arc<dyn MessageHooks>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .pipelines
            .message
            .clone()
    }

    fn permission_pipeline(&self) -> Vec<Arc<dyn PermissionHooks>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .pipelines
            .permission
            .clone()
    }

    fn tool_pipeline(&self) -> Vec<Arc<dyn ToolHooks>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .pipelines
            .tool
            .clone()
    }

    fn agent_pipeline(&self) -> Vec<Arc<dyn AgentHooks>> {
        self.inner
            .read()
            .expect("extension registry poisoned")
            .pipelines
            .agent
            .clone()
    }

    /// Number of hooks registered per kind, in declaration order.
    #[cfg(test)]
    pub(crate) fn pipeline_lengths(&self) -> [usize; 6] {
        let inner = self.inner.read().expect("extension registry poisoned");
        [
            inner.pipelines.config.len(),
            inner.pipelines.session.len(),
            inner.pipelines.message.len(),
            inner.pipelines.permission.len(),
            inner.pipelines.tool.len(),
            inner.pipelines.agent.len(),
        ]
    }

    // -- triggers -------------------------------------------------------

    /// Walk the config pipeline.  Any error aborts startup.
    pub async fn trigger_config_load(
        &self,
        cancel: &CancellationToken,
        config: &mut Config,
    ) -> anyhow::Result<()> {
        for hook in self.config_pipeline() {
            guard("config", hook.on_config_load(cancel, config)).await?;
        }
        Ok(())
    }

    pub async fn trigger_session_created(
        &self,
        cancel: &CancellationToken,
        session: &Session,
    ) -> anyhow::Result<()> {
        for hook in self.session_pipeline() {
            guard("session", hook.on_session_created(cancel, session)).await?;
        }
        Ok(())
    }

    pub async fn trigger_session_updated(
        &self,
        cancel: &CancellationToken,
        session: &Session,
    ) -> anyhow::Result<()> {
        for hook in self.session_pipeline() {
            guard("session", hook.on_session_updated(cancel, session)).await?;
        }
        Ok(())
    }

    pub async fn trigger_session_deleted(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> anyhow::Result<()> {
        for hook in self.session_pipeline() {
            guard("session", hook.on_session_deleted(cancel, session_id)).await?;
        }
        Ok(())
    }

    pub async fn trigger_message_created(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> anyhow::Result<()> {
        for hook in self.message_pipeline() {
            guard("message", hook.on_message_created(cancel, message)).await?;
        }
        Ok(())
    }

    pub async fn trigger_message_updated(
        &self,
        cancel: &CancellationToken,
        message: &Message,
    ) -> anyhow::Result<()> {
        for hook in self.message_pipeline() {
            guard("message", hook.on_message_updated(cancel, message)).await?;
        }
        Ok(())
    }

    /// Scan the permission pipeline in order; the first non-`None`
    /// decision wins and later hooks are not called.  Errors abort the
    /// check immediately.
    pub async fn trigger_permission_request(
        &self,
        cancel: &CancellationToken,
        request: &PermissionRequest,
    ) -> anyhow::Result<Decision> {
        for hook in self.permission_pipeline() {
            match guard("permission", hook.on_permission_request(cancel, request)).await? {
                Decision::None => continue,
                decision => return Ok(decision),
            }
        }
        Ok(Decision::None)
    }

    /// Thread the raw JSON arguments through every tool before-hook and
    /// return the final value.  Each hook observes the replacements made
    /// by its predecessors.
    pub async fn trigger_tool_execute_before(
        &self,
        cancel: &CancellationToken,
        input: &ToolExecuteInput,
    ) -> anyhow::Result<String> {
        let mut input = input.clone();
        for hook in self.tool_pipeline() {
            if let Some(args) = guard("tool", hook.on_tool_execute_before(cancel, &input)).await? {
                input.arguments = args;
            }
        }
        Ok(input.arguments)
    }

    /// Thread the tool result through every tool after-hook and return
    /// the final value.
    pub async fn trigger_tool_execute_after(
        &self,
        cancel: &CancellationToken,
        input: &ToolExecuteInput,
        result: &ToolResponse,
    ) -> anyhow::Result<ToolResponse> {
        let mut result = result.clone();
        for hook in self.tool_pipeline() {
            if let Some(replaced) =
                guard("tool", hook.on_tool_execute_after(cancel, input, &result)).await?
            {
                result = replaced;
            }
        }
        Ok(result)
    }

    pub async fn trigger_agent_start(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> anyhow::Result<()> {
        for hook in self.agent_pipeline() {
            guard("agent", hook.on_agent_start(cancel, session_id)).await?;
        }
        Ok(())
    }

    pub async fn trigger_agent_step(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        step: u64,
    ) -> anyhow::Result<()> {
        for hook in self.agent_pipeline() {
            guard("agent", hook.on_agent_step(cancel, session_id, step)).await?;
        }
        Ok(())
    }

    pub async fn trigger_agent_finish(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
    ) -> anyhow::Result<()> {
        for hook in self.agent_pipeline() {
            guard("agent", hook.on_agent_finish(cancel, session_id)).await?;
        }
        Ok(())
    }
}

async fn guarded_shutdown(name: &str, ext: &dyn Extension) -> anyhow::Result<()> {
    match std::panic::AssertUnwindSafe(ext.shutdown()).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "extension {name} panicked during shutdown: {}",
            panic_message(panic.as_ref())
        )),
    }
}

/// Run one hook invocation, converting a panic inside extension code
/// into an error and wrapping failures with the hook kind.
async fn guard<T, F>(kind: &'static str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.with_context(|| format!("{kind} hook failed")),
        Err(panic) => Err(anyhow::anyhow!(
            "{kind} hook panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
