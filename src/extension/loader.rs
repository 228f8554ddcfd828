//! Dynamic extension loading.
//!
//! Resolves a configured path to a loadable artifact, opens it through
//! the platform's dynamic-load facility, looks up the well-known
//! [`ENTRY_SYMBOL`], and hands the constructed instance to the
//! registry.  [`load_all`] is tolerant: one bad path is warned about
//! and skipped, the rest keep loading.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{is_valid_name, Extension, ExtensionContext, ExtensionRegistry};

/// Name of the exported entry symbol every artifact must provide.
///
/// The symbol is a constructor with this exact shape:
///
/// ```ignore
/// #[no_mangle]
/// #[allow(non_snake_case)]
/// pub fn Extension() -> Box<dyn crush::extension::Extension> { ... }
/// ```
pub const ENTRY_SYMBOL: &[u8] = b"Extension";

/// Constructor signature behind [`ENTRY_SYMBOL`].
pub type EntryFn = fn() -> Box<dyn Extension>;

/// Why a configured extension path could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("extension path does not exist: {}", .0.display())]
    PathMissing(PathBuf),

    #[error("no loadable artifact (*.{expected}) in directory: {}", .dir.display())]
    NoArtifactInDirectory { dir: PathBuf, expected: &'static str },

    #[error("unsupported artifact (expected *.{expected}): {}", .path.display())]
    UnsupportedArtifact { path: PathBuf, expected: &'static str },

    #[error("failed to load artifact: {}", .path.display())]
    LoadFailure {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("artifact exports no `Extension` symbol: {}", .path.display())]
    MissingEntrySymbol {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("symbol `Extension` in {} does not satisfy the contract: {reason}", .path.display())]
    ContractMismatch { path: PathBuf, reason: String },
}

/// Dynamic-load suffix on this platform (`so`, `dylib`, or `dll`).
pub fn artifact_suffix() -> &'static str {
    std::env::consts::DLL_EXTENSION
}

fn has_artifact_suffix(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e == artifact_suffix())
        .unwrap_or(false)
}

/// Resolve a configured path to the concrete artifact file.
///
/// Directories select their first loadable entry in lexicographic
/// order, so the choice is stable across runs.
pub fn resolve_artifact(path: &Path) -> Result<PathBuf, LoadError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    if !absolute.exists() {
        return Err(LoadError::PathMissing(absolute));
    }

    if absolute.is_dir() {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&absolute)
            .map_err(|_| LoadError::NoArtifactInDirectory {
                dir: absolute.clone(),
                expected: artifact_suffix(),
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && has_artifact_suffix(p))
            .collect();
        candidates.sort();
        return candidates
            .into_iter()
            .next()
            .ok_or(LoadError::NoArtifactInDirectory {
                dir: absolute,
                expected: artifact_suffix(),
            });
    }

    if !has_artifact_suffix(&absolute) {
        return Err(LoadError::UnsupportedArtifact {
            path: absolute,
            expected: artifact_suffix(),
        });
    }

    Ok(absolute)
}

/// Open `artifact` and construct its extension instance.
///
/// The returned [`libloading::Library`] must stay alive for as long as
/// the instance (and anything it handed out) may run; the registry
/// keeps it mapped for the life of the process.
pub fn load_artifact(artifact: &Path) -> Result<(Arc<dyn Extension>, libloading::Library), LoadError> {
    // SAFETY: loading runs the artifact's initializers.  Extensions are
    // user-configured and execute in-process with full host privileges
    // by contract; there is no sandbox to uphold here.
    let library = unsafe { libloading::Library::new(artifact) }.map_err(|source| {
        LoadError::LoadFailure {
            path: artifact.to_path_buf(),
            source,
        }
    })?;

    // SAFETY: the entry symbol contract fixes the signature of
    // `Extension`; a symbol of any other shape is outside the contract
    // and undefined behavior, which in-process loading cannot detect.
    let entry: EntryFn = {
        let symbol: libloading::Symbol<EntryFn> = unsafe { library.get(ENTRY_SYMBOL) }
            .map_err(|source| LoadError::MissingEntrySymbol {
                path: artifact.to_path_buf(),
                source,
            })?;
        *symbol
    };

    let instance = std::panic::catch_unwind(entry).map_err(|_| LoadError::ContractMismatch {
        path: artifact.to_path_buf(),
        reason: "constructor panicked".into(),
    })?;

    let info = instance.info();
    if !is_valid_name(&info.name) {
        return Err(LoadError::ContractMismatch {
            path: artifact.to_path_buf(),
            reason: format!("invalid extension name {:?}", info.name),
        });
    }

    debug!(extension = %info.name, path = %artifact.display(), "artifact loaded");
    Ok((Arc::from(instance), library))
}

/// Load every configured path into `registry`.
///
/// Failures (unresolvable paths, bad artifacts, init errors, duplicate
/// names) are logged at warning and skipped; loading continues with the
/// next path.  Returns the number of extensions registered.
pub async fn load_all(
    registry: &ExtensionRegistry,
    ctx: &ExtensionContext,
    paths: &[String],
) -> usize {
    load_all_with(registry, ctx, paths, |artifact| {
        load_artifact(artifact).map(|(ext, lib)| (ext, Some(lib)))
    })
    .await
}

/// Tolerant iteration behind [`load_all`], with the artifact-opening
/// step injectable so tests can cover the mixed success/failure path
/// without compiling a real library.
async fn load_all_with<F>(
    registry: &ExtensionRegistry,
    ctx: &ExtensionContext,
    paths: &[String],
    load: F,
) -> usize
where
    F: Fn(&Path) -> Result<(Arc<dyn Extension>, Option<libloading::Library>), LoadError>,
{
    let mut count = 0usize;
    for raw in paths {
        let path = Path::new(raw);
        let artifact = match resolve_artifact(path) {
            Ok(a) => a,
            Err(e) => {
                warn!(path = %raw, error = %e, "skipping extension");
                continue;
            }
        };
        let (instance, library) = match load(&artifact) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(path = %artifact.display(), error = %e, "skipping extension");
                continue;
            }
        };
        let name = instance.info().name;
        match registry.load_with_library(instance, library, ctx).await {
            Ok(()) => count += 1,
            Err(e) => {
                warn!(path = %artifact.display(), extension = %name, error = %e, "extension not registered");
            }
        }
    }
    info!(count, "extensions loaded");
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::extension::{ExtensionInfo, Hooks};
    use crate::message::MessageService;
    use crate::permission::PermissionService;
    use crate::session::SessionService;

    fn test_ctx() -> ExtensionContext {
        ExtensionContext {
            config: Arc::new(tokio::sync::RwLock::new(Config::default())),
            sessions: Arc::new(SessionService::new()),
            messages: Arc::new(MessageService::new()),
            permissions: Arc::new(PermissionService::new()),
            working_dir: std::path::PathBuf::from("."),
        }
    }

    struct StubExtension;

    #[async_trait::async_trait]
    impl Extension for StubExtension {
        fn info(&self) -> ExtensionInfo {
            ExtensionInfo {
                name: "stub".into(),
                version: "0.1.0".into(),
                description: "stub extension".into(),
                author: "tests".into(),
            }
        }
        async fn init(&self, _ctx: &ExtensionContext) -> anyhow::Result<()> {
            Ok(())
        }
        fn hooks(&self) -> Hooks {
            Hooks::none()
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn missing_path_is_classified() {
        let err = resolve_artifact(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, LoadError::PathMissing(_)));
    }

    #[test]
    fn wrong_suffix_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ext.txt");
        std::fs::write(&path, b"not a library").unwrap();

        let err = resolve_artifact(&path).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedArtifact { .. }));
    }

    #[test]
    fn empty_directory_has_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_artifact(dir.path()).unwrap_err();
        assert!(matches!(err, LoadError::NoArtifactInDirectory { .. }));
    }

    #[test]
    fn directory_selects_first_artifact_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        let suffix = artifact_suffix();
        std::fs::write(dir.path().join(format!("zz.{suffix}")), b"z").unwrap();
        std::fs::write(dir.path().join(format!("aa.{suffix}")), b"a").unwrap();
        std::fs::write(dir.path().join("README.md"), b"docs").unwrap();

        let artifact = resolve_artifact(dir.path()).unwrap();
        assert_eq!(
            artifact.file_name().unwrap().to_str().unwrap(),
            format!("aa.{suffix}")
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn real_library_without_entry_symbol_is_classified() {
        // libm ships with glibc; where it is absent the open itself
        // fails, which is also a valid classification.
        match load_artifact(Path::new("libm.so.6")) {
            Err(LoadError::MissingEntrySymbol { .. }) => {}
            Err(LoadError::LoadFailure { .. }) => {}
            Err(e) => panic!("unexpected classification: {e}"),
            Ok(_) => panic!("libm should not satisfy the extension contract"),
        }
    }

    #[test]
    fn garbage_artifact_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("junk.{}", artifact_suffix()));
        std::fs::write(&path, b"this is not native code").unwrap();

        match load_artifact(&path) {
            Err(err) => assert!(matches!(err, LoadError::LoadFailure { .. })),
            Ok(_) => panic!("garbage artifact should not load"),
        }
    }

    #[tokio::test]
    async fn load_all_tolerates_bad_paths() {
        let registry = ExtensionRegistry::new();
        let count = load_all(
            &registry,
            &test_ctx(),
            &["/missing/one".to_string(), "/missing/two".to_string()],
        )
        .await;
        assert_eq!(count, 0);
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn load_all_skips_bad_artifact_and_loads_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        // First path fails classification; the second resolves and is
        // handed to the (injected) artifact opener.
        let bad = dir.path().join("aa-broken.txt");
        std::fs::write(&bad, b"not a library").unwrap();
        let good = dir.path().join(format!("zz-good.{}", artifact_suffix()));
        std::fs::write(&good, b"stub artifact").unwrap();

        let registry = ExtensionRegistry::new();
        let count = load_all_with(
            &registry,
            &test_ctx(),
            &[
                bad.to_string_lossy().into_owned(),
                good.to_string_lossy().into_owned(),
            ],
            |_artifact| Ok((Arc::new(StubExtension) as Arc<dyn Extension>, None)),
        )
        .await;

        assert_eq!(count, 1);
        let names: Vec<String> = registry.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["stub"]);
    }
}
