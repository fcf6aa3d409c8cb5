//! Configuration loading and parsing.
//!
//! The server reads `cem.config.yaml` from the served directory (or an
//! explicit `--config` path). Parsing is tolerant of unknown fields so the
//! file can grow without breaking older binaries, but a file that fails to
//! parse at startup is a hard error: serving with silently-ignored config is
//! worse than refusing to start. Reload on a config change goes through the
//! same stateless [`load_from`] helper; the caller decides whether a reload
//! failure keeps the previous value.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE_NAME: &str = "cem.config.yaml";

/// Default number of filesystem paths the watcher will register before it
/// stops adding more and logs a warning.
pub const DEFAULT_MAX_WATCHED_FILES: usize = 8192;

/// How far past the configured port the frontend probes before giving up.
pub const PORT_PROBE_CEILING: u16 = 50;

// -------------------------------------------------------------------------------------------------
// File model (serde view of cem.config.yaml)
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub serve: ServeSection,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServeSection {
    #[serde(default = "ServeSection::default_port")]
    pub port: u16,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub import_map: ImportMapSection,
    #[serde(default)]
    pub knobs: KnobsSection,
    #[serde(default)]
    pub transforms: TransformsSection,
    #[serde(default)]
    pub reload: ReloadMode,
    #[serde(default)]
    pub hmr: HmrSection,
}

impl ServeSection {
    const fn default_port() -> u16 {
        8000
    }
}

/// `importMap.inputMap` accepts either a path to a JSON file or an inline
/// `{imports: {...}}` object.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ImportMapInput {
    Path(PathBuf),
    Inline(serde_json::Value),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ImportMapSection {
    #[serde(default)]
    pub input_map: Option<ImportMapInput>,
    #[serde(default = "ImportMapSection::default_generate")]
    pub generate: bool,
}

impl Default for ImportMapSection {
    fn default() -> Self {
        Self {
            input_map: None,
            generate: Self::default_generate(),
        }
    }
}

impl ImportMapSection {
    const fn default_generate() -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnobsSection {
    #[serde(default = "KnobsSection::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub templates: Option<String>,
}

impl Default for KnobsSection {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            templates: None,
        }
    }
}

impl KnobsSection {
    const fn default_enabled() -> bool {
        true
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransformsSection {
    #[serde(default = "TransformsSection::default_target")]
    pub target: String,
    #[serde(default)]
    pub css: CssSection,
}

impl Default for TransformsSection {
    fn default() -> Self {
        Self {
            target: Self::default_target(),
            css: CssSection::default(),
        }
    }
}

impl TransformsSection {
    fn default_target() -> String {
        "es2022".to_string()
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct CssSection {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReloadMode {
    #[default]
    Auto,
    Hmr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HmrSection {
    #[serde(default = "HmrSection::default_inject")]
    pub inject: bool,
}

impl Default for HmrSection {
    fn default() -> Self {
        Self {
            inject: Self::default_inject(),
        }
    }
}

impl HmrSection {
    const fn default_inject() -> bool {
        true
    }
}

// -------------------------------------------------------------------------------------------------
// Effective configuration
// -------------------------------------------------------------------------------------------------

/// Values the binary layers on top of the file (flags win over file).
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub open: bool,
    pub target: Option<String>,
    pub import_map: Option<PathBuf>,
    pub transform_css: Vec<String>,
    pub no_reload: bool,
    pub template_dir: Option<PathBuf>,
}

/// The populated configuration value the core consumes. Effectively
/// immutable: a config reload produces a fresh `ServeConfig` that replaces
/// the old one by a single atomic assignment in the owner.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Absolute path of the served workspace.
    pub root: PathBuf,
    /// Path the config was loaded from, when a file existed. Watched for
    /// `ConfigChanged`.
    pub config_path: Option<PathBuf>,
    pub port: u16,
    pub open: bool,
    pub es_target: String,
    pub import_map_input: Option<ImportMapInput>,
    pub import_map_generate: bool,
    pub knobs_enabled: bool,
    pub knob_template_glob: Option<String>,
    pub css_include: GlobSet,
    pub css_exclude: GlobSet,
    /// Raw patterns retained for the debug endpoint and for equality in
    /// tests; `GlobSet` has no public pattern accessor.
    pub css_include_patterns: Vec<String>,
    pub css_exclude_patterns: Vec<String>,
    pub reload_mode: ReloadMode,
    pub inject_reload_client: bool,
    pub template_dir: Option<PathBuf>,
    pub max_watched_files: usize,
}

impl ServeConfig {
    /// True when `path` (workspace-relative or absolute) is in the CSS
    /// transform include set and not excluded.
    pub fn css_transform_applies(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        !self.css_include_patterns.is_empty()
            && self.css_include.is_match(rel)
            && !self.css_exclude.is_match(rel)
    }
}

/// Shared holder for the effective config. Readers take an `Arc` snapshot;
/// a reload replaces the whole value in one store. There is no partial
/// update path.
#[derive(Debug)]
pub struct ConfigCell {
    inner: std::sync::RwLock<std::sync::Arc<ServeConfig>>,
}

impl ConfigCell {
    pub fn new(config: ServeConfig) -> Self {
        Self {
            inner: std::sync::RwLock::new(std::sync::Arc::new(config)),
        }
    }

    pub fn load(&self) -> std::sync::Arc<ServeConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn store(&self, config: ServeConfig) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = std::sync::Arc::new(config);
    }
}

/// Locate the config file for a workspace: `<root>/cem.config.yaml` if it
/// exists.
pub fn discover(root: &Path) -> Option<PathBuf> {
    let candidate = root.join(CONFIG_FILE_NAME);
    candidate.exists().then_some(candidate)
}

/// Parse the config file at `path`, or return defaults when no file exists.
/// A file that exists but fails to parse is an error; callers decide whether
/// that is fatal (startup) or recoverable (reload).
pub fn load_from(root: &Path, path: Option<PathBuf>) -> Result<(ConfigFile, Option<PathBuf>)> {
    let path = match path.or_else(|| discover(root)) {
        Some(p) => p,
        None => return Ok((ConfigFile::default(), None)),
    };
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let file: ConfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    info!(target: "config", path = %path.display(), "config_loaded");
    Ok((file, Some(path)))
}

/// Combine file + CLI overrides into the effective [`ServeConfig`].
pub fn resolve(
    root: PathBuf,
    file: ConfigFile,
    config_path: Option<PathBuf>,
    cli: &CliOverrides,
) -> Result<ServeConfig> {
    let serve = file.serve;

    let css_patterns: Vec<String> = if cli.transform_css.is_empty() {
        serve.transforms.css.include.clone()
    } else {
        cli.transform_css.clone()
    };
    let css_exclude_patterns = serve.transforms.css.exclude.clone();
    let css_include = build_globset(&css_patterns).context("transforms.css.include")?;
    let css_exclude = build_globset(&css_exclude_patterns).context("transforms.css.exclude")?;

    let import_map_input = match &cli.import_map {
        Some(path) => Some(ImportMapInput::Path(path.clone())),
        None => serve.import_map.input_map.clone(),
    };

    let inject_reload_client = !cli.no_reload && serve.hmr.inject;
    if cli.no_reload {
        info!(target: "config", "reload_client_injection_disabled");
    }

    Ok(ServeConfig {
        root,
        config_path,
        port: cli.port.unwrap_or(serve.port),
        open: cli.open || serve.open,
        es_target: cli
            .target
            .clone()
            .unwrap_or_else(|| serve.transforms.target.clone()),
        import_map_input,
        import_map_generate: serve.import_map.generate,
        knobs_enabled: serve.knobs.enabled,
        knob_template_glob: serve.knobs.templates.clone(),
        css_include,
        css_exclude,
        css_include_patterns: css_patterns,
        css_exclude_patterns,
        reload_mode: serve.reload,
        inject_reload_client,
        template_dir: cli.template_dir.clone(),
        max_watched_files: DEFAULT_MAX_WATCHED_FILES,
    })
}

/// Stateless reload helper used on `ConfigChanged`. Returns the fresh value
/// or the reason it could not be produced; the caller keeps the previous
/// config on error.
pub fn reload(previous: &ServeConfig, cli: &CliOverrides) -> Result<ServeConfig> {
    let (file, path) = load_from(&previous.root, previous.config_path.clone())?;
    let next = resolve(previous.root.clone(), file, path, cli)?;
    if next.port != previous.port {
        warn!(
            target: "config",
            old = previous.port,
            new = next.port,
            "port_change_requires_restart"
        );
    }
    Ok(next)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("glob pattern `{pattern}`"))?);
    }
    Ok(builder.build()?)
}
