//! Demo page composition.
//!
//! Layers, outermost first: document head (title, chrome assets), the
//! `<cem-serve-chrome>` wrapper, the raw demo fragment, then one knob group
//! per knob family per element type present in the fragment. The import map
//! and the reload client are injected by the HTML middleware on the way
//! out, like for any other HTML response, so they do not appear here.
//!
//! Rendering is deterministic: identical `(manifest, options)` inputs yield
//! identical bytes. Caching and snapshot tests rely on that.

use crate::error::DemoError;
use crate::fragment::scan_instances;
use crate::knobs::render_knob_groups;
use crate::route::RenderOptions;
use htmlescape::encode_minimal;
use serve_manifest::ManifestSnapshot;
use std::fs;
use std::path::Path;
use tracing::debug;

pub const CHROME_SCRIPT_URL: &str = "/__cem/chrome.js";
pub const CHROME_STYLE_URL: &str = "/__cem/chrome.css";

/// Render the demo page for `tag`/`slug`, or a [`DemoError`] the HTTP layer
/// maps to a status code.
pub fn render_demo(
    snapshot: &ManifestSnapshot,
    workspace_root: &Path,
    tag: &str,
    slug: &str,
    options: &RenderOptions,
) -> Result<String, DemoError> {
    let entry = snapshot
        .indices
        .demo(tag, slug)
        .ok_or_else(|| DemoError::NotFound {
            tag: tag.to_string(),
            slug: slug.to_string(),
        })?;

    let source_path = workspace_root.join(&entry.source_file);
    let fragment = match fs::read_to_string(&source_path) {
        Ok(fragment) => fragment,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(DemoError::SourceMissing { path: source_path });
        }
        Err(err) => {
            return Err(DemoError::Io {
                path: source_path,
                source: err,
            });
        }
    };

    if !options.chrome {
        return Ok(render_bare_shell(tag, slug, &fragment));
    }

    debug!(target: "demo.render", tag, slug, "demo_rendered");
    Ok(render_chrome_page(snapshot, tag, slug, &fragment, options))
}

fn render_bare_shell(tag: &str, slug: &str, fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 256);
    out.push_str("<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>");
    out.push_str(&encode_minimal(tag));
    out.push_str(" \u{00b7} ");
    out.push_str(&encode_minimal(slug));
    out.push_str("</title>\n</head>\n<body>\n");
    out.push_str(fragment);
    out.push_str("\n</body>\n</html>\n");
    out
}

fn render_chrome_page(
    snapshot: &ManifestSnapshot,
    tag: &str,
    slug: &str,
    fragment: &str,
    options: &RenderOptions,
) -> String {
    let mut known_tags: Vec<&str> = snapshot
        .indices
        .tag_to_element
        .keys()
        .map(String::as_str)
        .collect();
    known_tags.sort_unstable();
    let instances = scan_instances(fragment, &known_tags);

    // Element types to render knobs for: the primary element first, then
    // every other known tag in order of first appearance in the fragment.
    let mut knob_tags: Vec<&str> = Vec::new();
    if snapshot.indices.tag_to_element.contains_key(tag) {
        knob_tags.push(tag);
    }
    for instance in &instances {
        let t = instance.tag.as_str();
        if !knob_tags.contains(&t) {
            knob_tags.push(t);
        }
    }

    let mut out = String::with_capacity(fragment.len() + 4096);
    out.push_str("<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>");
    out.push_str(&encode_minimal(tag));
    out.push_str(" \u{00b7} ");
    out.push_str(&encode_minimal(slug));
    out.push_str("</title>\n<link rel=\"stylesheet\" href=\"");
    out.push_str(CHROME_STYLE_URL);
    out.push_str("\">\n<script type=\"module\" src=\"");
    out.push_str(CHROME_SCRIPT_URL);
    out.push_str("\"></script>\n</head>\n<body>\n<cem-serve-chrome tag-name=\"");
    out.push_str(&crate::knobs::encode_attribute(tag));
    out.push('"');
    if options.any_knobs() {
        out.push_str(" knobs");
    }
    out.push_str(">\n<div class=\"cem-demo\" slot=\"demo\">\n");
    out.push_str(fragment);
    out.push_str("\n</div>\n");

    for knob_tag in knob_tags {
        if options.any_knobs() {
            if let Some(custom) = options.custom_knob_templates.get(knob_tag) {
                out.push_str(custom);
                continue;
            }
        }
        let Some(decl_ref) = snapshot.indices.tag_to_element.get(knob_tag) else {
            continue;
        };
        let Some(decl) = snapshot.manifest.get(*decl_ref) else {
            continue;
        };
        let tag_instances: Vec<_> = instances
            .iter()
            .filter(|i| i.tag == knob_tag)
            .cloned()
            .collect();
        render_knob_groups(
            &mut out,
            knob_tag,
            decl,
            options,
            &tag_instances,
            knob_tag == tag,
        );
    }

    out.push_str("</cem-serve-chrome>\n</body>\n</html>\n");
    out
}

/// Developer-facing 404 page. It is a full HTML document, so the middleware
/// still injects the reload client and the page recovers on its own once
/// the demo exists.
pub fn render_not_found(snapshot: &ManifestSnapshot, tag: &str, slug: &str) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>demo not found</title>\n<link rel=\"stylesheet\" href=\"");
    out.push_str(CHROME_STYLE_URL);
    out.push_str("\">\n</head>\n<body>\n<main class=\"cem-not-found\">\n<h1>No demo <code>");
    out.push_str(&encode_minimal(slug));
    out.push_str("</code> for <code>&lt;");
    out.push_str(&encode_minimal(tag));
    out.push_str("&gt;</code></h1>\n");

    let known: Vec<_> = snapshot.indices.demos_for_tag(tag).collect();
    if known.is_empty() {
        out.push_str("<p>This element has no demos yet. Create one under a <code>demo/</code> directory next to its source.</p>\n");
    } else {
        out.push_str("<p>Known demos for this element:</p>\n<ul>\n");
        for entry in known {
            out.push_str("<li><a href=\"");
            out.push_str(&crate::knobs::encode_attribute(&entry.local_route));
            out.push_str("\">");
            out.push_str(&encode_minimal(&entry.slug));
            out.push_str("</a></li>\n");
        }
        out.push_str("</ul>\n");
    }
    out.push_str("</main>\n</body>\n</html>\n");
    out
}
