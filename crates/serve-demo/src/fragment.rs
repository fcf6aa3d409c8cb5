//! Lightweight scan of a demo fragment for custom-element instances.
//!
//! The renderer only needs tag occurrences, their attributes, and their
//! immediate text content (for labels). A conforming HTML parse is not
//! required for that: demo fragments are small, author-controlled
//! documents, and the scanner deliberately ignores anything it does not
//! understand.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementInstance {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    /// Text between the opening tag and the next markup boundary, untrimmed.
    pub text: String,
    /// 1-based occurrence index among instances of the same tag.
    pub index: usize,
}

impl ElementInstance {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Find instances of `known_tags` in document order.
pub fn scan_instances(fragment: &str, known_tags: &[&str]) -> Vec<ElementInstance> {
    let mut instances: Vec<ElementInstance> = Vec::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let bytes = fragment.as_bytes();
    let mut pos = 0;

    while let Some(offset) = fragment[pos..].find('<') {
        let start = pos + offset;
        let rest = &fragment[start + 1..];
        let Some(tag) = known_tags.iter().find(|t| {
            rest.starts_with(**t)
                && rest[t.len()..]
                    .bytes()
                    .next()
                    .is_none_or(|b| b == b'>' || b.is_ascii_whitespace() || b == b'/')
        }) else {
            pos = start + 1;
            continue;
        };

        let Some(close) = fragment[start..].find('>') else {
            break;
        };
        let close = start + close;
        let attrs = parse_attrs(&fragment[start + 1 + tag.len()..close]);
        let text_start = close + 1;
        let text_end = fragment[text_start..]
            .find('<')
            .map(|i| text_start + i)
            .unwrap_or(bytes.len());
        let index = counts.entry((*tag).to_string()).or_insert(0);
        *index += 1;
        instances.push(ElementInstance {
            tag: (*tag).to_string(),
            attrs,
            text: fragment[text_start..text_end].to_string(),
            index: *index,
        });
        pos = close + 1;
    }
    instances
}

/// Attribute soup inside one opening tag. Handles `name`, `name=value`,
/// `name="value"`, and `name='value'`. Delimiters are all ASCII, so byte
/// indexing stays on UTF-8 boundaries.
fn parse_attrs(raw: &str) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    let raw = raw.trim().trim_end_matches('/');
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let name_start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let name = raw[name_start..i].to_string();

        let mut value = String::new();
        if i < bytes.len() && bytes[i] == b'=' {
            i += 1;
            if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
                let quote = bytes[i];
                i += 1;
                let value_start = i;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                value = raw[value_start..i].to_string();
                i = (i + 1).min(bytes.len());
            } else {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                value = raw[value_start..i].to_string();
            }
        }
        if !name.is_empty() {
            attrs.insert(name, value);
        }
    }
    attrs
}
