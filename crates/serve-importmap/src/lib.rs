//! Import-map resolution.
//!
//! Produces the `{"imports": {...}}` object injected into served HTML.
//! Three sources merge in decreasing precedence:
//!
//! 1. the user's override file (or inline object from config),
//! 2. workspace-internal monorepo siblings (`package.json` `workspaces`),
//! 3. entries auto-derived from `dependencies` resolved against
//!    `node_modules`, honoring each dependency's `exports` (preferring
//!    `types`, then `import`, then `default`) and falling back to `main`.
//!
//! When an entry cannot be resolved confidently it is omitted: a missing
//! specifier fails loudly in the browser console, a wrong one fails
//! somewhere far away.
//!
//! The resolved map is cached against the set of files consulted while
//! building it; a change to any of their mtimes rebuilds on next access, so
//! resolution stays idempotent between changes.

use serde_json::Value;
use serve_config::ImportMapInput;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum ImportMapError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("inline import map has no `imports` object")]
    MalformedInline,
}

/// An ordered import map. `BTreeMap` keeps serialization deterministic,
/// which the HTML renderer's byte-identical-output contract relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportMap {
    pub imports: BTreeMap<String, String>,
}

impl ImportMap {
    pub fn to_json(&self) -> String {
        let imports: serde_json::Map<String, Value> = self
            .imports
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        let mut map = serde_json::Map::new();
        map.insert("imports".into(), Value::Object(imports));
        // A map of strings cannot fail to serialize.
        serde_json::to_string(&Value::Object(map)).unwrap_or_else(|_| "{}".into())
    }

    pub fn script_tag(&self) -> String {
        format!(
            "<script type=\"importmap\">{}</script>",
            self.to_json()
        )
    }

    /// Overlay `higher` onto `self`, higher precedence winning.
    fn overlay(&mut self, higher: ImportMap) {
        for (specifier, url) in higher.imports {
            self.imports.insert(specifier, url);
        }
    }
}

/// Pluggable resolution seam. The built-in resolver is package.json-driven;
/// a source-tracing implementation can replace it without touching the
/// pipeline.
pub trait ImportMapSource: Send + Sync + 'static {
    fn resolve(&self, workspace_root: &Path) -> Result<ImportMap, ImportMapError>;

    /// Files whose change invalidates the result. Used both for cache
    /// revalidation and to extend the watch set.
    fn inputs(&self, workspace_root: &Path) -> Vec<PathBuf>;
}

/// The package.json-driven resolver described in the module docs.
pub struct PackageJsonSource {
    override_input: Option<ImportMapInput>,
    generate: bool,
}

impl PackageJsonSource {
    pub fn new(override_input: Option<ImportMapInput>, generate: bool) -> Self {
        Self {
            override_input,
            generate,
        }
    }

    fn override_map(&self, root: &Path) -> Result<ImportMap, ImportMapError> {
        match &self.override_input {
            None => Ok(ImportMap::default()),
            Some(ImportMapInput::Inline(value)) => imports_from_value(value)
                .ok_or(ImportMapError::MalformedInline),
            Some(ImportMapInput::Path(path)) => {
                let abs = if path.is_absolute() {
                    path.clone()
                } else {
                    root.join(path)
                };
                let content = fs::read_to_string(&abs).map_err(|source| ImportMapError::Io {
                    path: abs.clone(),
                    source,
                })?;
                let value: Value =
                    serde_json::from_str(&content).map_err(|source| ImportMapError::Parse {
                        path: abs.clone(),
                        source,
                    })?;
                imports_from_value(&value).ok_or(ImportMapError::MalformedInline)
            }
        }
    }

    fn derived_map(&self, root: &Path) -> ImportMap {
        let mut map = ImportMap::default();
        if !self.generate {
            return map;
        }
        let Some(package) = read_package_json(&root.join("package.json")) else {
            return map;
        };

        if let Some(deps) = package.get("dependencies").and_then(Value::as_object) {
            for name in deps.keys() {
                match resolve_dependency(root, name) {
                    Some(url) => {
                        map.imports.insert(name.clone(), url);
                    }
                    None => {
                        trace!(target: "importmap", specifier = name, "entry_omitted");
                    }
                }
            }
        }
        map
    }

    fn sibling_map(&self, root: &Path) -> ImportMap {
        let mut map = ImportMap::default();
        if !self.generate {
            return map;
        }
        for dir in workspace_sibling_dirs(root) {
            let Some(package) = read_package_json(&dir.join("package.json")) else {
                continue;
            };
            let Some(name) = package.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(entry) = package_entry(&package) else {
                continue;
            };
            let rel = dir.strip_prefix(root).unwrap_or(&dir);
            let url = format!(
                "/{}/{}",
                rel.to_string_lossy().replace('\\', "/"),
                entry.trim_start_matches("./")
            );
            map.imports.insert(name.to_string(), url);
        }
        map
    }
}

impl ImportMapSource for PackageJsonSource {
    fn resolve(&self, root: &Path) -> Result<ImportMap, ImportMapError> {
        let mut map = self.derived_map(root);
        map.overlay(self.sibling_map(root));
        map.overlay(self.override_map(root)?);
        debug!(target: "importmap", entries = map.imports.len(), "import_map_resolved");
        Ok(map)
    }

    fn inputs(&self, root: &Path) -> Vec<PathBuf> {
        let mut inputs = vec![root.join("package.json")];
        if let Some(ImportMapInput::Path(path)) = &self.override_input {
            inputs.push(if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            });
        }
        for dir in workspace_sibling_dirs(root) {
            inputs.push(dir.join("package.json"));
        }
        inputs
    }
}

// -------------------------------------------------------------------------------------------------
// package.json plumbing
// -------------------------------------------------------------------------------------------------

fn read_package_json(path: &Path) -> Option<Value> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target: "importmap", path = %path.display(), ?err, "package_json_unparseable");
            None
        }
    }
}

/// `/node_modules/<name>/<entry>` for an installed dependency, or `None`
/// when the package or its entry point cannot be determined.
fn resolve_dependency(root: &Path, name: &str) -> Option<String> {
    let package_dir = root.join("node_modules").join(name);
    let package = read_package_json(&package_dir.join("package.json"))?;
    let entry = package_entry(&package)?;
    Some(format!("/node_modules/{name}/{}", entry.trim_start_matches("./")))
}

/// Entry point from `exports` (conditions `types` > `import` > `default`,
/// on the `.` subpath), falling back to `main`.
fn package_entry(package: &Value) -> Option<String> {
    if let Some(exports) = package.get("exports") {
        if let Some(entry) = resolve_export(exports) {
            return Some(entry);
        }
    }
    package
        .get("main")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn resolve_export(exports: &Value) -> Option<String> {
    match exports {
        Value::String(entry) => Some(entry.clone()),
        Value::Object(conditions) => {
            if let Some(dot) = conditions.get(".") {
                return resolve_export(dot);
            }
            for condition in ["types", "import", "default"] {
                if let Some(value) = conditions.get(condition) {
                    if let Some(entry) = resolve_export(value) {
                        return Some(entry);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

/// Expand the root package.json `workspaces` globs. Only the common
/// directory-glob shapes are supported (`packages/*`, explicit paths); that
/// covers the monorepos this server targets without a full glob walk.
fn workspace_sibling_dirs(root: &Path) -> Vec<PathBuf> {
    let Some(package) = read_package_json(&root.join("package.json")) else {
        return Vec::new();
    };
    let Some(patterns) = package.get("workspaces").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut dirs = Vec::new();
    for pattern in patterns.iter().filter_map(Value::as_str) {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            let base = root.join(prefix);
            let Ok(entries) = fs::read_dir(&base) else {
                continue;
            };
            let mut children: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.join("package.json").exists())
                .collect();
            children.sort();
            dirs.extend(children);
        } else {
            let dir = root.join(pattern);
            if dir.join("package.json").exists() {
                dirs.push(dir);
            }
        }
    }
    dirs
}

// -------------------------------------------------------------------------------------------------
// Cache
// -------------------------------------------------------------------------------------------------

type Fingerprint = Vec<(PathBuf, Option<SystemTime>)>;

struct CachedMap {
    map: ImportMap,
    fingerprint: Fingerprint,
}

/// Mtime-revalidated cache around an [`ImportMapSource`]. Rebuilds when any
/// consulted file changes; otherwise repeated calls return the identical
/// value.
pub struct ImportMapCache<S> {
    source: S,
    cached: Mutex<Option<CachedMap>>,
}

impl<S: ImportMapSource> ImportMapCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    pub fn get(&self, root: &Path) -> Result<ImportMap, ImportMapError> {
        let fingerprint = fingerprint(&self.source.inputs(root));
        let mut guard = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = guard.as_ref() {
            if cached.fingerprint == fingerprint {
                return Ok(cached.map.clone());
            }
        }
        let map = self.source.resolve(root)?;
        *guard = Some(CachedMap {
            map: map.clone(),
            fingerprint,
        });
        Ok(map)
    }

    pub fn invalidate(&self) {
        let mut guard = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }
}

fn fingerprint(paths: &[PathBuf]) -> Fingerprint {
    paths
        .iter()
        .map(|p| (p.clone(), fs::metadata(p).and_then(|m| m.modified()).ok()))
        .collect()
}

fn imports_from_value(value: &Value) -> Option<ImportMap> {
    let imports = value.get("imports")?.as_object()?;
    let mut map = ImportMap::default();
    for (specifier, url) in imports {
        if let Some(url) = url.as_str() {
            map.imports.insert(specifier.clone(), url.to_string());
        }
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(root: &Path, rel: &str, value: &Value) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    fn workspace_with_dependency() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "package.json",
            &json!({"name": "app", "dependencies": {"lit": "^3.0.0"}}),
        );
        write(
            root,
            "node_modules/lit/package.json",
            &json!({
                "name": "lit",
                "main": "lib/index.js",
                "exports": {".": {"import": "./index.js", "default": "./index.cjs"}}
            }),
        );
        dir
    }

    #[test]
    fn derives_dependency_entry_via_exports() {
        let dir = workspace_with_dependency();
        let source = PackageJsonSource::new(None, true);
        let map = source.resolve(dir.path()).unwrap();
        assert_eq!(
            map.imports.get("lit"),
            Some(&"/node_modules/lit/index.js".to_string())
        );
    }

    #[test]
    fn types_condition_outranks_import() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "package.json", &json!({"dependencies": {"typed": "1"}}));
        write(
            root,
            "node_modules/typed/package.json",
            &json!({"exports": {"types": "./index.d.ts", "import": "./index.js"}}),
        );
        let map = PackageJsonSource::new(None, true).resolve(root).unwrap();
        assert_eq!(
            map.imports.get("typed"),
            Some(&"/node_modules/typed/index.d.ts".to_string())
        );
    }

    #[test]
    fn falls_back_to_main_and_omits_unresolvable() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "package.json",
            &json!({"dependencies": {"plain": "1", "ghost": "1"}}),
        );
        write(
            root,
            "node_modules/plain/package.json",
            &json!({"main": "dist/main.js"}),
        );
        let map = PackageJsonSource::new(None, true).resolve(root).unwrap();
        assert_eq!(
            map.imports.get("plain"),
            Some(&"/node_modules/plain/dist/main.js".to_string())
        );
        assert!(!map.imports.contains_key("ghost"), "uninstalled dep omitted");
    }

    #[test]
    fn workspace_siblings_outrank_derived_entries() {
        let dir = workspace_with_dependency();
        let root = dir.path();
        write(
            root,
            "package.json",
            &json!({
                "name": "app",
                "workspaces": ["packages/*"],
                "dependencies": {"lit": "^3.0.0", "my-lib": "*"}
            }),
        );
        write(
            root,
            "packages/my-lib/package.json",
            &json!({"name": "my-lib", "exports": {".": {"import": "./index.js"}}}),
        );
        write(
            root,
            "node_modules/my-lib/package.json",
            &json!({"name": "my-lib", "main": "stale.js"}),
        );

        let map = PackageJsonSource::new(None, true).resolve(root).unwrap();
        assert_eq!(
            map.imports.get("my-lib"),
            Some(&"/packages/my-lib/index.js".to_string())
        );
        assert_eq!(
            map.imports.get("lit"),
            Some(&"/node_modules/lit/index.js".to_string())
        );
    }

    #[test]
    fn override_outranks_all() {
        let dir = workspace_with_dependency();
        let inline = json!({"imports": {"lit": "https://cdn.example/lit.js"}});
        let source = PackageJsonSource::new(Some(ImportMapInput::Inline(inline)), true);
        let map = source.resolve(dir.path()).unwrap();
        assert_eq!(
            map.imports.get("lit"),
            Some(&"https://cdn.example/lit.js".to_string())
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let dir = workspace_with_dependency();
        let source = PackageJsonSource::new(None, true);
        let a = source.resolve(dir.path()).unwrap();
        let b = source.resolve(dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_json(), b.to_json());
    }

    #[test]
    fn cache_revalidates_on_package_json_change() {
        let dir = workspace_with_dependency();
        let root = dir.path().to_path_buf();
        let cache = ImportMapCache::new(PackageJsonSource::new(None, true));
        let first = cache.get(&root).unwrap();
        assert!(first.imports.contains_key("lit"));

        // Rewrite package.json with no dependencies and a bumped mtime.
        let package = root.join("package.json");
        fs::write(&package, r#"{"name":"app","dependencies":{}}"#).unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let file = fs::File::options().write(true).open(&package).unwrap();
        file.set_modified(later).unwrap();

        let second = cache.get(&root).unwrap();
        assert!(second.imports.is_empty());
    }

    #[test]
    fn script_tag_shape() {
        let mut map = ImportMap::default();
        map.imports.insert("lit".into(), "/node_modules/lit/index.js".into());
        assert_eq!(
            map.script_tag(),
            r#"<script type="importmap">{"imports":{"lit":"/node_modules/lit/index.js"}}</script>"#
        );
    }
}
