//! Instance labeling for knob groups.
//!
//! When a demo contains several instances of the same element, each needs a
//! stable, human-readable label. The priority order is a documented
//! contract shared with the client runtime:
//!
//! 1. `id` attribute
//! 2. trimmed text content
//! 3. `aria-label` attribute
//! 4. slot name + occurrence index
//! 5. tag name + occurrence index
//!
//! The result is a pure function of the element's attributes and text;
//! repeated resolution is identical.

use crate::fragment::ElementInstance;

const MAX_TEXT_LABEL: usize = 40;

pub fn instance_label(instance: &ElementInstance) -> String {
    if let Some(id) = instance.attr("id") {
        if !id.is_empty() {
            return id.to_string();
        }
    }

    let text = instance.text.trim();
    if !text.is_empty() {
        return truncate_on_char_boundary(text, MAX_TEXT_LABEL);
    }

    if let Some(aria) = instance.attr("aria-label") {
        if !aria.is_empty() {
            return aria.to_string();
        }
    }

    if let Some(slot) = instance.attr("slot") {
        if !slot.is_empty() {
            return format!("{slot} {}", instance.index);
        }
    }

    format!("{} {}", instance.tag, instance.index)
}

fn truncate_on_char_boundary(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\u{2026}", &text[..end])
}
