//! Filesystem skills.
//!
//! A skill is a directory holding a `SKILL.md` manifest (YAML
//! front-matter between `---` fences, markdown body = instructions)
//! plus any accompanying files.  The built-in [`SkillsExtension`] walks
//! the standard skill directories at init and surfaces each discovered
//! skill as an agent tool that, when invoked, returns the skill's
//! instructions and base directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SkillsConfig;
use crate::extension::{Extension, ExtensionContext, ExtensionInfo, Hooks, Tool};
use crate::tools::{ToolCall, ToolInfo, ToolResponse};

/// Prefix reserved for skill-generated tool names.
pub const TOOL_PREFIX: &str = "skills_";

/// Manifest file name inside each skill directory.
pub const MANIFEST: &str = "SKILL.md";

// ── Types ───────────────────────────────────────────────────

/// Front-matter parsed from a `SKILL.md` manifest.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SkillMeta {
    /// Skill identifier; lowercase `[a-z0-9-]+`, must equal the
    /// basename of the containing directory.
    pub name: String,
    /// What the skill does; at least 20 characters.
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Advisory list of tools the skill expects; parsed, not enforced.
    #[serde(
        default,
        rename = "allowed-tools",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// A discovered skill, immutable after discovery.
#[derive(Debug, Clone)]
pub struct Skill {
    pub meta: SkillMeta,
    /// Absolute path of the skill directory.
    pub dir: PathBuf,
    /// Generated tool name: [`TOOL_PREFIX`] + sanitized relative path.
    pub tool_name: String,
    /// Markdown body from `SKILL.md`.
    pub instructions: String,
}

// ── Parsing & validation ────────────────────────────────────

/// Parse a `SKILL.md` manifest into `(meta, markdown_body)`.
///
/// The file is split on the literal `---` delimiter into three parts;
/// fewer parts mean the front-matter is missing.
pub fn parse_skill_md(content: &str) -> anyhow::Result<(SkillMeta, String)> {
    let parts: Vec<&str> = content.splitn(3, "---").collect();
    if parts.len() < 3 {
        bail!("missing front-matter (expected ---, key: value block, ---)");
    }
    let meta: SkillMeta =
        serde_yaml::from_str(parts[1]).context("parsing SKILL.md front-matter")?;
    Ok((meta, parts[2].to_string()))
}

fn is_valid_skill_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Check the constraints that make a parsed manifest usable.
pub fn validate_meta(meta: &SkillMeta, dir: &Path) -> anyhow::Result<()> {
    if !is_valid_skill_name(&meta.name) {
        bail!("invalid skill name {:?} (want [a-z0-9-]+)", meta.name);
    }
    let basename = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if meta.name != basename {
        bail!(
            "skill name {:?} does not match directory basename {:?}",
            meta.name,
            basename
        );
    }
    if meta.description.chars().count() < 20 {
        bail!("skill description too short (need at least 20 characters)");
    }
    Ok(())
}

/// Derive the generated tool name for a skill directory.
///
/// Uses the path relative to the nearest ancestor directory named
/// `skills`; a skill outside any such ancestor falls back to its
/// basename.  Separators and any character outside `[A-Za-z0-9_]`
/// become `_`, the result is lowercased and prefixed.
pub fn tool_name_for(dir: &Path) -> String {
    let relative = dir
        .ancestors()
        .skip(1)
        .find(|a| a.file_name().map(|n| n == "skills").unwrap_or(false))
        .and_then(|anchor| dir.strip_prefix(anchor).ok())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(dir.file_name().unwrap_or_default()));

    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("_");

    let sanitized: String = joined
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    format!("{TOOL_PREFIX}{sanitized}")
}

fn load_skill(manifest: &Path) -> anyhow::Result<Skill> {
    let dir = manifest
        .parent()
        .context("SKILL.md has no parent directory")?;
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());

    let content = std::fs::read_to_string(manifest)
        .with_context(|| format!("reading {}", manifest.display()))?;
    let (meta, instructions) = parse_skill_md(&content)?;
    validate_meta(&meta, &dir)?;

    Ok(Skill {
        tool_name: tool_name_for(&dir),
        meta,
        dir,
        instructions,
    })
}

// ── Discovery ───────────────────────────────────────────────

/// The standard skill roots for `working_dir`, lowest priority first:
/// `$XDG_CONFIG_HOME/crush/skills` (falling back to
/// `$HOME/.config/crush/skills`), `$HOME/.crush/skills`, and
/// `<working_dir>/.crush/skills`.
pub fn default_roots(working_dir: &Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();

    let config_home = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")));
    if let Some(config_home) = config_home {
        roots.push(config_home.join("crush").join("skills"));
    }
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".crush").join("skills"));
    }
    roots.push(working_dir.join(".crush").join("skills"));
    roots
}

/// Walk `roots` in order and collect every valid skill.
///
/// Non-existent roots are silently skipped; per-file errors are warned
/// and skipped.  Because roots are walked lowest priority first, a
/// later skill replaces an earlier one with the same generated tool
/// name.
pub fn discover(roots: &[PathBuf]) -> Vec<Skill> {
    let mut skills: Vec<Skill> = Vec::new();

    for root in roots {
        if !root.is_dir() {
            debug!(root = %root.display(), "skills root absent");
            continue;
        }
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() || entry.file_name() != MANIFEST {
                continue;
            }
            let skill = match load_skill(entry.path()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping skill");
                    continue;
                }
            };
            if let Some(pos) = skills.iter().position(|s| s.tool_name == skill.tool_name) {
                let earlier = skills.remove(pos);
                warn!(
                    tool = %skill.tool_name,
                    earlier = %earlier.dir.display(),
                    later = %skill.dir.display(),
                    "duplicate skill tool name, keeping later"
                );
            }
            skills.push(skill);
        }
    }
    skills
}

fn apply_gating(skills: &mut Vec<Skill>, cfg: &SkillsConfig) {
    if !cfg.enabled {
        info!("skills disabled by config");
        skills.clear();
        return;
    }
    if !cfg.allow.is_empty() {
        skills.retain(|s| cfg.allow.iter().any(|a| a == &s.meta.name));
    }
    if !cfg.deny.is_empty() {
        skills.retain(|s| !cfg.deny.iter().any(|d| d == &s.meta.name));
    }
}

// ── Tool surface ────────────────────────────────────────────

/// Agent tool generated from one discovered skill.
///
/// Invocation ignores parameters and returns the skill's launch text.
pub struct SkillTool {
    skill: Skill,
}

impl SkillTool {
    pub fn new(skill: Skill) -> Self {
        Self { skill }
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.skill.tool_name.clone(),
            description: self.skill.meta.description.clone(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {}
            }),
            required: Vec::new(),
        }
    }

    async fn run(
        &self,
        _cancel: CancellationToken,
        _call: ToolCall,
    ) -> anyhow::Result<ToolResponse> {
        Ok(ToolResponse::text(format!(
            "Launching skill: {}\n\nBase directory for this skill: {}\n\n{}",
            self.skill.meta.name,
            self.skill.dir.display(),
            self.skill.instructions.trim()
        )))
    }
}

// ── Built-in extension ──────────────────────────────────────

/// Built-in extension that discovers skills at init and contributes
/// one [`SkillTool`] per skill.
pub struct SkillsExtension {
    roots: Vec<PathBuf>,
    skills: Mutex<Vec<Skill>>,
}

impl SkillsExtension {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            skills: Mutex::new(Vec::new()),
        }
    }

    /// Extension over the standard roots for `working_dir`.
    pub fn with_default_roots(working_dir: &Path) -> Self {
        Self::new(default_roots(working_dir))
    }

    /// The currently discovered skills.
    pub fn skills(&self) -> Vec<Skill> {
        self.skills.lock().expect("skills poisoned").clone()
    }
}

#[async_trait]
impl Extension for SkillsExtension {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            name: "skills".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: "Filesystem skills surfaced as agent tools".into(),
            author: "Crush".into(),
        }
    }

    async fn init(&self, ctx: &ExtensionContext) -> anyhow::Result<()> {
        let mut found = discover(&self.roots);
        if let Some(gating) = ctx.config.read().await.skills.clone() {
            apply_gating(&mut found, &gating);
        }
        info!(count = found.len(), "skills discovered");
        *self.skills.lock().expect("skills poisoned") = found;
        Ok(())
    }

    fn hooks(&self) -> Hooks {
        Hooks::none()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.skills.lock().expect("skills poisoned").clear();
        Ok(())
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.skills()
            .into_iter()
            .map(|s| Arc::new(SkillTool::new(s)) as Arc<dyn Tool>)
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────
