//! The generator seam and the built-in manifest reader.
//!
//! Generation itself is an external concern: analyzing sources into a
//! Custom Elements Manifest belongs to the authoring toolchain. The server
//! consumes whatever implements [`ManifestGenerator`] and only relies on
//! the result being a plain value. The built-in [`CemFileGenerator`] reads
//! a `custom-elements.json` the toolchain wrote into the workspace, then
//! enriches it with what the server itself must know: demo fragments on
//! disk and CSS files imported by element modules.

use crate::model::{DemoDecl, Manifest};
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub const MANIFEST_FILE_NAME: &str = "custom-elements.json";

/// Produces a manifest for a workspace. Implementations must be pure with
/// respect to the filesystem state they read: same inputs, same manifest.
pub trait ManifestGenerator: Send + Sync + 'static {
    fn generate(&self, workspace_root: &Path) -> Result<Manifest>;

    /// The input classification the watcher uses for files that are not yet
    /// referenced by any manifest (e.g. a brand-new element source).
    fn input_spec(&self) -> &InputSpec;
}

/// Path classification globs shared between the generator and the watcher.
#[derive(Debug)]
pub struct InputSpec {
    element_sources: GlobSet,
    demo_fragments: GlobSet,
}

impl Default for InputSpec {
    fn default() -> Self {
        Self::new(
            &["**/*.ts", "**/*.tsx", "**/*.mjs", "**/*.js"],
            &["**/demo/*.html"],
        )
        // Default patterns are statically valid.
        .unwrap_or_else(|_| Self {
            element_sources: GlobSet::empty(),
            demo_fragments: GlobSet::empty(),
        })
    }
}

impl InputSpec {
    pub fn new(element_patterns: &[&str], demo_patterns: &[&str]) -> Result<Self> {
        Ok(Self {
            element_sources: build_globset(element_patterns)?,
            demo_fragments: build_globset(demo_patterns)?,
        })
    }

    /// True for paths the generator would consume as element sources.
    /// `node_modules` never qualifies.
    pub fn matches_element_source(&self, path: &Path) -> bool {
        !in_node_modules(path) && self.element_sources.is_match(path)
    }

    pub fn matches_demo(&self, path: &Path) -> bool {
        !in_node_modules(path) && self.demo_fragments.is_match(path)
    }
}

pub fn in_node_modules(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == "node_modules"))
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("glob pattern `{pattern}`"))?);
    }
    Ok(builder.build()?)
}

/// Reads the toolchain-authored `custom-elements.json` and fills in the
/// pieces the server derives from disk.
pub struct CemFileGenerator {
    spec: std::sync::Arc<InputSpec>,
}

impl Default for CemFileGenerator {
    fn default() -> Self {
        Self {
            spec: std::sync::Arc::new(InputSpec::default()),
        }
    }
}

impl CemFileGenerator {
    /// The spec is shared with the watcher's classifier, which must agree
    /// with the generator about what counts as an input.
    pub fn new(spec: std::sync::Arc<InputSpec>) -> Self {
        Self { spec }
    }
}

impl ManifestGenerator for CemFileGenerator {
    fn generate(&self, workspace_root: &Path) -> Result<Manifest> {
        let manifest_path = workspace_root.join(MANIFEST_FILE_NAME);
        let content = fs::read_to_string(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let mut manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;

        enrich(&mut manifest, workspace_root);
        debug!(
            target: "manifest.generate",
            modules = manifest.modules.len(),
            elements = manifest.element_count(),
            "manifest_generated"
        );
        Ok(manifest)
    }

    fn input_spec(&self) -> &InputSpec {
        &self.spec
    }
}

/// Fill in demo discovery and CSS-import reachability for every element
/// declaration. Both are deterministic walks of the workspace.
fn enrich(manifest: &mut Manifest, root: &Path) {
    for module in &mut manifest.modules {
        let module_path = module.path.clone();
        for decl in &mut module.declarations {
            if !decl.is_element() {
                continue;
            }
            let Some(tag) = decl.tag_name.clone() else {
                continue;
            };

            if decl.demos.iter().all(|d| d.source.is_none()) {
                let discovered = discover_demos(root, &module_path, &tag);
                if !discovered.is_empty() {
                    decl.demos = discovered;
                }
            }
            // Resolve authored demo sources against the workspace root so
            // downstream consumers can treat them uniformly.
            for demo in &mut decl.demos {
                if let Some(source) = &demo.source {
                    if source.is_absolute() {
                        if let Ok(rel) = source.strip_prefix(root) {
                            demo.source = Some(rel.to_path_buf());
                        }
                    }
                }
            }

            if decl.css_imports.is_empty() {
                decl.css_imports = scan_css_imports(root, &module_path);
            }
        }
    }
}

/// Demo fragments for `tag` defined in `module_path`. Two layouts are
/// recognized: a `demo/` directory next to the source when the containing
/// directory is already named after the tag (`src/my-card/my-card.ts` ->
/// `src/my-card/demo/*.html`), and a sibling tag directory otherwise
/// (`src/my-card.ts` -> `src/my-card/demo/*.html`).
fn discover_demos(root: &Path, module_path: &Path, tag: &str) -> Vec<DemoDecl> {
    let parent = module_path.parent().unwrap_or(Path::new(""));
    let mut candidates = Vec::new();
    if parent.file_name().is_some_and(|name| name == tag) {
        candidates.push(parent.join("demo"));
    }
    candidates.push(parent.join(tag).join("demo"));

    let mut demos = Vec::new();
    for dir in candidates {
        let abs = root.join(&dir);
        let Ok(entries) = fs::read_dir(&abs) else {
            continue;
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "html"))
            .collect();
        files.sort();
        for file in files {
            let rel = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
            demos.push(DemoDecl {
                url: String::new(),
                description: String::new(),
                source: Some(rel),
            });
        }
        if !demos.is_empty() {
            break;
        }
    }
    demos
}

/// Workspace-relative CSS files imported by `module_path`, found by a
/// line-level scan for `import ... '<path>.css'` statements. A parse-level
/// walk is the generator's job; this scan only has to keep the watch set
/// honest.
fn scan_css_imports(root: &Path, module_path: &Path) -> Vec<PathBuf> {
    let abs = root.join(module_path);
    let Ok(source) = fs::read_to_string(&abs) else {
        warn!(
            target: "manifest.generate",
            path = %abs.display(),
            "element_source_unreadable"
        );
        return Vec::new();
    };
    let module_dir = module_path.parent().unwrap_or(Path::new(""));

    let mut imports = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("import") {
            continue;
        }
        let Some(specifier) = extract_specifier(trimmed) else {
            continue;
        };
        if !specifier.ends_with(".css") || !specifier.starts_with('.') {
            continue;
        }
        let resolved = normalize(&module_dir.join(specifier));
        if !imports.contains(&resolved) {
            imports.push(resolved);
        }
    }
    imports
}

fn extract_specifier(line: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        let mut parts = line.splitn(3, quote);
        let _before = parts.next()?;
        if let Some(spec) = parts.next() {
            if parts.next().is_some() {
                return Some(spec);
            }
        }
    }
    None
}

/// Lexical `..`/`.` removal; demo and CSS paths stay inside the workspace,
/// so symlink-aware canonicalization is unnecessary here.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/my-card/demo")).unwrap();
        fs::write(
            root.join("src/my-card.ts"),
            "import './my-card/my-card.css';\nexport class MyCard extends HTMLElement {}\n",
        )
        .unwrap();
        fs::write(root.join("src/my-card/my-card.css"), ":host { display: block }\n").unwrap();
        fs::write(
            root.join("src/my-card/demo/index.html"),
            "<my-card></my-card>\n",
        )
        .unwrap();
        fs::write(
            root.join(MANIFEST_FILE_NAME),
            r#"{
                "schemaVersion": "1.0.0",
                "modules": [{
                    "path": "src/my-card.ts",
                    "declarations": [{
                        "kind": "class",
                        "name": "MyCard",
                        "customElement": true,
                        "tagName": "my-card"
                    }]
                }]
            }"#,
        )
        .unwrap();
        dir
    }

    #[test]
    fn generates_and_discovers_demos_and_css() {
        let dir = fixture();
        let generator = CemFileGenerator::default();
        let manifest = generator.generate(dir.path()).unwrap();
        let (_, _, decl) = manifest.elements().next().unwrap();
        assert_eq!(
            decl.demos[0].source,
            Some(PathBuf::from("src/my-card/demo/index.html"))
        );
        assert_eq!(
            decl.css_imports,
            vec![PathBuf::from("src/my-card/my-card.css")]
        );
    }

    #[test]
    fn missing_manifest_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let generator = CemFileGenerator::default();
        assert!(generator.generate(dir.path()).is_err());
    }

    #[test]
    fn input_spec_classification() {
        let spec = InputSpec::default();
        assert!(spec.matches_element_source(Path::new("src/my-card.ts")));
        assert!(spec.matches_element_source(Path::new("src/deep/nested/el.js")));
        assert!(!spec.matches_element_source(Path::new("node_modules/lit/index.js")));
        assert!(spec.matches_demo(Path::new("src/my-card/demo/index.html")));
        assert!(!spec.matches_demo(Path::new("src/my-card/index.html")));
    }

    #[test]
    fn generation_is_deterministic() {
        let dir = fixture();
        let generator = CemFileGenerator::default();
        let a = generator.generate(dir.path()).unwrap();
        let b = generator.generate(dir.path()).unwrap();
        assert_eq!(a, b);
    }
}
