//! On-the-fly TypeScript and CSS transforms with a keyed, single-flight
//! cache.

pub mod cache;
pub mod css;
pub mod error;
pub mod ts;

pub use cache::{
    CacheStats, TransformCache, TransformEntry, TransformKey, TransformKind,
    DEFAULT_BYTE_BUDGET, DEFAULT_MAX_ENTRIES,
};
pub use error::TransformError;

use std::path::{Component, Path};

/// True when `path` sits under a `node_modules` directory.
pub fn in_node_modules(path: &Path) -> bool {
    path.components()
        .any(|c| matches!(c, Component::Normal(name) if name == "node_modules"))
}

/// Dependency sources pass through untransformed, with one exception:
/// monorepo-linked packages whose real path resolves back into the
/// workspace (outside `node_modules`) are authored code and get the same
/// treatment as any workspace file.
pub fn should_transform_dependency(path: &Path, workspace_root: &Path) -> bool {
    if !in_node_modules(path) {
        return true;
    }
    let (Ok(real), Ok(real_root)) = (
        std::fs::canonicalize(path),
        std::fs::canonicalize(workspace_root),
    ) else {
        return false;
    };
    match real.strip_prefix(&real_root) {
        Ok(relative) => !in_node_modules(relative),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn node_modules_detection() {
        assert!(in_node_modules(Path::new("node_modules/lit/index.js")));
        assert!(in_node_modules(Path::new("pkg/node_modules/a/b.ts")));
        assert!(!in_node_modules(Path::new("src/my-card.ts")));
    }

    #[test]
    fn workspace_files_always_transform() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src/my-card.ts");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "export {}\n").unwrap();
        assert!(should_transform_dependency(&file, dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_sibling_counts_as_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("packages/my-lib")).unwrap();
        fs::write(root.join("packages/my-lib/index.ts"), "export {}\n").unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        std::os::unix::fs::symlink(
            root.join("packages/my-lib"),
            root.join("node_modules/my-lib"),
        )
        .unwrap();

        assert!(should_transform_dependency(
            &root.join("node_modules/my-lib/index.ts"),
            root
        ));
    }

    #[test]
    fn plain_dependency_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let file = root.join("node_modules/lit/index.js");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "export {}\n").unwrap();
        assert!(!should_transform_dependency(&file, root));
    }
}
