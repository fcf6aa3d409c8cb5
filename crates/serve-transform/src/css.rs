//! CSS producer: wrap a stylesheet as a JS module.
//!
//! The module default-exports a `CSSStyleSheet` built with `replaceSync`,
//! so element code can `import sheet from './x.css'` and adopt it. Which
//! files get this treatment is the caller's decision (the include pattern
//! gate lives in config); this producer only performs the wrap.

use crate::cache::TransformEntry;
use crate::ts::JS_CONTENT_TYPE;
use std::path::Path;

/// Escape CSS text for embedding in a JS template literal. Backslashes
/// first, then the literal-significant characters.
fn escape_template_literal(css: &str) -> String {
    css.replace('\\', "\\\\")
        .replace('`', "\\`")
        .replace("${", "\\${")
}

pub fn to_stylesheet_module(path: &Path, css: &str) -> TransformEntry {
    let escaped = escape_template_literal(css);
    let code = format!(
        "// {}\n\
         const sheet = new CSSStyleSheet();\n\
         sheet.replaceSync(`{escaped}`);\n\
         export default sheet;\n",
        path.display()
    );
    TransformEntry::new(code.into_bytes(), None, JS_CONTENT_TYPE)
}
