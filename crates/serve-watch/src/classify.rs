//! Batch classification.
//!
//! Each debounced batch maps to exactly one [`ChangeKind`]. The rules, in
//! priority order: any config file wins; any element source (known to the
//! manifest or matching the generator's input globs) wins next; then demo
//! fragments; a batch of nothing but CSS files is CSS-only; anything else
//! is unknown and dropped.

use serve_events::ChangeKind;
use serve_manifest::{InputSpec, ManifestStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::watcher::WatchSet;

#[derive(Clone)]
pub struct Classifier {
    root: PathBuf,
    store: Arc<ManifestStore>,
    spec: Arc<InputSpec>,
}

impl Classifier {
    pub fn new(root: PathBuf, store: Arc<ManifestStore>, spec: Arc<InputSpec>) -> Self {
        Self { root, store, spec }
    }

    /// Event filter: only watched paths, plus workspace paths the generator
    /// would pick up as new inputs, may enter a batch. Everything else can
    /// never trigger a regen.
    pub fn is_relevant(&self, set: &WatchSet, path: &Path) -> bool {
        if set.contains(path) {
            return true;
        }
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        self.spec.matches_element_source(rel) || self.spec.matches_demo(rel)
    }

    pub fn classify(&self, set: &WatchSet, files: &[PathBuf]) -> ChangeKind {
        if files.is_empty() {
            return ChangeKind::Unknown;
        }
        let snapshot = self.store.snapshot();

        if files.iter().any(|f| set.config_files.contains(f)) {
            return ChangeKind::ConfigChanged;
        }

        let is_element_source = |file: &PathBuf| {
            let rel = file.strip_prefix(&self.root).unwrap_or(file);
            snapshot.indices.is_element_source(rel) || self.spec.matches_element_source(rel)
        };
        if files.iter().any(is_element_source) {
            return ChangeKind::ElementSourceChanged;
        }

        let is_demo = |file: &PathBuf| {
            let rel = file.strip_prefix(&self.root).unwrap_or(file);
            self.spec.matches_demo(rel)
        };
        if files.iter().any(is_demo) {
            return ChangeKind::DemoChanged;
        }

        if files
            .iter()
            .all(|f| f.extension().is_some_and(|ext| ext == "css"))
        {
            return ChangeKind::CssOnly;
        }

        ChangeKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_manifest::{Declaration, Manifest, ManifestModule};
    use std::collections::BTreeSet;

    fn fixture() -> (Classifier, WatchSet) {
        let manifest = Manifest {
            schema_version: "1.0.0".into(),
            modules: vec![ManifestModule {
                path: PathBuf::from("src/my-card.ts"),
                declarations: vec![Declaration {
                    custom_element: true,
                    tag_name: Some("my-card".into()),
                    ..Declaration::default()
                }],
            }],
        };
        let classifier = Classifier::new(
            PathBuf::from("/w"),
            Arc::new(ManifestStore::new(manifest)),
            Arc::new(InputSpec::default()),
        );
        let set = WatchSet::new(
            BTreeSet::from([
                PathBuf::from("/w/src/my-card.ts"),
                PathBuf::from("/w/src/my-card/my-card.css"),
                PathBuf::from("/w/src/my-card/demo/index.html"),
            ]),
            BTreeSet::from([PathBuf::from("/w/cem.config.yaml")]),
        );
        (classifier, set)
    }

    #[test]
    fn config_wins_over_everything() {
        let (c, set) = fixture();
        let kind = c.classify(
            &set,
            &[
                PathBuf::from("/w/cem.config.yaml"),
                PathBuf::from("/w/src/my-card.ts"),
            ],
        );
        assert_eq!(kind, ChangeKind::ConfigChanged);
    }

    #[test]
    fn known_and_new_element_sources_classify_the_same() {
        let (c, set) = fixture();
        assert_eq!(
            c.classify(&set, &[PathBuf::from("/w/src/my-card.ts")]),
            ChangeKind::ElementSourceChanged
        );
        // Not in the manifest yet, but matches the input globs.
        assert_eq!(
            c.classify(&set, &[PathBuf::from("/w/src/brand-new.ts")]),
            ChangeKind::ElementSourceChanged
        );
    }

    #[test]
    fn demo_only_batches() {
        let (c, set) = fixture();
        assert_eq!(
            c.classify(&set, &[PathBuf::from("/w/src/my-card/demo/index.html")]),
            ChangeKind::DemoChanged
        );
    }

    #[test]
    fn css_only_batches() {
        let (c, set) = fixture();
        assert_eq!(
            c.classify(&set, &[PathBuf::from("/w/src/my-card/my-card.css")]),
            ChangeKind::CssOnly
        );
    }

    #[test]
    fn css_plus_source_is_element_change() {
        let (c, set) = fixture();
        let kind = c.classify(
            &set,
            &[
                PathBuf::from("/w/src/my-card/my-card.css"),
                PathBuf::from("/w/src/my-card.ts"),
            ],
        );
        assert_eq!(kind, ChangeKind::ElementSourceChanged);
    }

    #[test]
    fn irrelevant_paths_filtered_and_unknown() {
        let (c, set) = fixture();
        assert!(!c.is_relevant(&set, Path::new("/w/notes.txt")));
        assert!(!c.is_relevant(&set, Path::new("/elsewhere/app.ts")));
        assert!(c.is_relevant(&set, Path::new("/w/src/new-el.ts")));
        assert_eq!(
            c.classify(&set, &[PathBuf::from("/w/notes.txt")]),
            ChangeKind::Unknown
        );
    }
}
