//! User-supplied knob templates.
//!
//! `knobs.templates` names a glob of HTML files, one per tag
//! (`templates/knobs/my-card.html` overrides the generated knob groups for
//! `<my-card>`). Only the common `dir/*.html` shape is expanded; authors
//! who need more write one directory. A `--template-dir` supplies the same
//! files under `<dir>/knobs/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Load tag -> markup overrides. Sources, later wins: the template
/// directory's `knobs/` folder, then the config glob.
pub fn load_knob_templates(
    workspace_root: &Path,
    template_dir: Option<&Path>,
    glob: Option<&str>,
) -> BTreeMap<String, String> {
    let mut templates = BTreeMap::new();
    if let Some(dir) = template_dir {
        collect_dir(&dir.join("knobs"), &mut templates);
    }
    if let Some(glob) = glob {
        if let Some(prefix) = glob.trim_start_matches("./").strip_suffix("/*.html") {
            collect_dir(&workspace_root.join(prefix), &mut templates);
        } else {
            warn!(
                target: "demo.render",
                glob,
                "knob_template_glob_unsupported_shape"
            );
        }
    }
    templates
}

fn collect_dir(dir: &Path, templates: &mut BTreeMap<String, String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "html"))
        .collect();
    files.sort();
    for file in files {
        let Some(tag) = file.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        // Only custom-element names can be overridden.
        if !tag.contains('-') {
            continue;
        }
        match fs::read_to_string(&file) {
            Ok(markup) => {
                templates.insert(tag.to_string(), markup);
            }
            Err(err) => {
                warn!(
                    target: "demo.render",
                    path = %file.display(),
                    ?err,
                    "knob_template_unreadable"
                );
            }
        }
    }
}
