//! Indices derived from a manifest at swap time.
//!
//! Recomputed fully on every swap: they are small relative to the manifest
//! and far cheaper than generation. Nothing in here is mutated after the
//! snapshot is published.

use crate::model::{DeclRef, Manifest};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// One servable demo page, discovered by the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoEntry {
    pub tag: String,
    pub slug: String,
    /// Workspace-relative path of the demo HTML fragment.
    pub source_file: PathBuf,
    /// The authored canonical URL (docs site), when known.
    pub canonical_url: String,
    /// The route this server serves the demo under.
    pub local_route: String,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct Indices {
    pub tag_to_element: HashMap<String, DeclRef>,
    pub file_to_tags: HashMap<PathBuf, BTreeSet<String>>,
    /// Ordered by `(tag, slug)`; `(tag, slug)` pairs are unique.
    pub demos: Vec<DemoEntry>,
    /// Everything the watcher must observe on behalf of this manifest:
    /// element sources, demo fragments, and reached CSS imports. Config
    /// files are the watcher's own addition, not part of the manifest.
    pub dependency_files: BTreeSet<PathBuf>,
}

impl Indices {
    /// Derive the full index set from a manifest. Deterministic: identical
    /// manifests produce identical indices, including demo order.
    pub fn derive(manifest: &Manifest) -> Self {
        let mut tag_to_element = HashMap::new();
        let mut file_to_tags: HashMap<PathBuf, BTreeSet<String>> = HashMap::new();
        let mut demos = Vec::new();
        let mut dependency_files = BTreeSet::new();

        for (decl_ref, module_path, decl) in manifest.elements() {
            // `elements()` filters on is_element, so the tag is present.
            let Some(tag) = decl.tag_name.clone() else {
                continue;
            };

            // First definition wins; duplicate tags are a project defect the
            // generator reports, not something the index can repair.
            tag_to_element.entry(tag.clone()).or_insert(decl_ref);
            file_to_tags
                .entry(module_path.to_path_buf())
                .or_default()
                .insert(tag.clone());
            dependency_files.insert(module_path.to_path_buf());
            for css in &decl.css_imports {
                dependency_files.insert(css.clone());
            }

            for demo in &decl.demos {
                let Some(source) = demo.source.clone() else {
                    continue;
                };
                let slug = demo_slug(&source);
                demos.push(DemoEntry {
                    local_route: format!("/components/{tag}/demo/{slug}/"),
                    tag: tag.clone(),
                    slug,
                    canonical_url: demo.url.clone(),
                    description: demo.description.clone(),
                    source_file: source.clone(),
                });
                dependency_files.insert(source);
            }
        }

        demos.sort_by(|a, b| (&a.tag, &a.slug).cmp(&(&b.tag, &b.slug)));
        demos.dedup_by(|a, b| a.tag == b.tag && a.slug == b.slug);

        Self {
            tag_to_element,
            file_to_tags,
            demos,
            dependency_files,
        }
    }

    pub fn demo(&self, tag: &str, slug: &str) -> Option<&DemoEntry> {
        self.demos
            .iter()
            .find(|d| d.tag == tag && d.slug == slug)
    }

    pub fn demos_for_tag<'a>(&'a self, tag: &str) -> impl Iterator<Item = &'a DemoEntry> {
        let tag = tag.to_string();
        self.demos.iter().filter(move |d| d.tag == tag)
    }

    pub fn is_element_source(&self, path: &Path) -> bool {
        self.file_to_tags.contains_key(path)
    }
}

/// Route slug for a demo fragment: the file stem (`index.html` -> `index`).
fn demo_slug(source: &Path) -> String {
    source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("index")
        .to_string()
}

/// Tag-level difference between two manifests, reported to browsers as a
/// `manifest-updated` advisory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TagDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl TagDiff {
    pub fn compute(prev: &Manifest, next: &Manifest) -> Self {
        let prev_tags: HashMap<&str, _> = prev
            .elements()
            .filter_map(|(_, _, d)| d.tag_name.as_deref().map(|t| (t, d)))
            .collect();
        let next_tags: HashMap<&str, _> = next
            .elements()
            .filter_map(|(_, _, d)| d.tag_name.as_deref().map(|t| (t, d)))
            .collect();

        let mut diff = TagDiff::default();
        for (tag, decl) in &next_tags {
            match prev_tags.get(tag) {
                None => diff.added.push((*tag).to_string()),
                Some(prev_decl) if prev_decl != decl => diff.changed.push((*tag).to_string()),
                Some(_) => {}
            }
        }
        for tag in prev_tags.keys() {
            if !next_tags.contains_key(tag) {
                diff.removed.push((*tag).to_string());
            }
        }
        diff.added.sort();
        diff.removed.sort();
        diff.changed.sort();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Source files of declarations that disappeared; their cached
    /// transforms must be invalidated alongside the changed files.
    pub fn removed_sources(prev: &Manifest, next: &Manifest) -> Vec<PathBuf> {
        let next_tags: BTreeSet<&str> = next
            .elements()
            .filter_map(|(_, _, d)| d.tag_name.as_deref())
            .collect();
        let mut sources: Vec<PathBuf> = prev
            .elements()
            .filter(|(_, _, d)| {
                d.tag_name
                    .as_deref()
                    .is_some_and(|t| !next_tags.contains(t))
            })
            .map(|(_, path, _)| path.to_path_buf())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}
