//! Request-path to filesystem-path resolution.

use std::path::{Component, Path, PathBuf};

/// Map a request path onto the workspace. Percent-decodes, then normalizes
/// lexically; a path that tries to climb out of the root resolves to
/// `None`.
pub fn resolve_request_path(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(uri_path).ok()?;
    let relative = decoded.trim_start_matches('/');

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(root.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_simple_paths() {
        let root = Path::new("/w");
        assert_eq!(
            resolve_request_path(root, "/src/my-card.ts"),
            Some(PathBuf::from("/w/src/my-card.ts"))
        );
        assert_eq!(resolve_request_path(root, "/"), Some(PathBuf::from("/w")));
    }

    #[test]
    fn decodes_percent_escapes() {
        let root = Path::new("/w");
        assert_eq!(
            resolve_request_path(root, "/src/my%20card.ts"),
            Some(PathBuf::from("/w/src/my card.ts"))
        );
    }

    #[test]
    fn rejects_traversal() {
        let root = Path::new("/w");
        assert_eq!(resolve_request_path(root, "/../etc/passwd"), None);
        assert_eq!(resolve_request_path(root, "/src/../../etc"), None);
        // Climbing inside the tree is fine.
        assert_eq!(
            resolve_request_path(root, "/src/../demo/a.html"),
            Some(PathBuf::from("/w/demo/a.html"))
        );
    }
}
