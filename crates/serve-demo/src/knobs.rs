//! Server-side knob-group rendering.
//!
//! Every knob family ships as declarative shadow DOM inside a
//! `<cem-knob-group>` host, so the client runtime can clone a group for a
//! newly inserted element without a round trip. Controls are chosen from
//! the attribute's declared type. Output is deterministic: same
//! declaration, same options, same bytes.

use crate::fragment::ElementInstance;
use crate::label::instance_label;
use crate::route::{KnobFamily, RenderOptions};
use htmlescape::encode_minimal;
use serve_manifest::{ControlKind, Declaration};

/// Escape for a double-quoted attribute value. `encode_minimal` covers
/// `&`, `<`, `>`; the quote is the only remaining breakout.
pub(crate) fn encode_attribute(value: &str) -> String {
    encode_minimal(value).replace('"', "&quot;")
}

/// Append every enabled, non-empty knob group for `tag` to `out`.
pub fn render_knob_groups(
    out: &mut String,
    tag: &str,
    decl: &Declaration,
    options: &RenderOptions,
    instances: &[ElementInstance],
    expanded: bool,
) {
    if options.family_enabled(KnobFamily::Attributes) && !decl.attributes.is_empty() {
        render_group(out, tag, KnobFamily::Attributes, expanded, instances, |out| {
            for attribute in &decl.attributes {
                render_attribute_control(out, attribute);
            }
        });
    }
    if options.family_enabled(KnobFamily::Slots) && !decl.slots.is_empty() {
        render_group(out, tag, KnobFamily::Slots, expanded, instances, |out| {
            for slot in &decl.slots {
                let name = if slot.name.is_empty() {
                    "default"
                } else {
                    slot.name.as_str()
                };
                out.push_str("<label class=\"knob\"><input type=\"checkbox\" data-knob=\"slot\" data-slot=\"");
                out.push_str(&encode_attribute(name));
                out.push_str("\" checked> ");
                out.push_str(&encode_minimal(name));
                out.push_str("</label>\n");
            }
        });
    }
    if options.family_enabled(KnobFamily::CssProperties) && !decl.css_properties.is_empty() {
        render_group(out, tag, KnobFamily::CssProperties, expanded, instances, |out| {
            for property in &decl.css_properties {
                out.push_str("<label class=\"knob\">");
                out.push_str(&encode_minimal(&property.name));
                out.push_str(" <input type=\"text\" data-knob=\"css-property\" data-prop=\"");
                out.push_str(&encode_attribute(&property.name));
                out.push('"');
                if let Some(default) = &property.default {
                    out.push_str(" value=\"");
                    out.push_str(&encode_attribute(default));
                    out.push('"');
                }
                out.push_str("></label>\n");
            }
        });
    }
    if options.family_enabled(KnobFamily::CssStates) && !decl.css_states.is_empty() {
        render_group(out, tag, KnobFamily::CssStates, expanded, instances, |out| {
            for state in &decl.css_states {
                out.push_str("<label class=\"knob\"><input type=\"checkbox\" data-knob=\"css-state\" data-state=\"");
                out.push_str(&encode_attribute(&state.name));
                out.push_str("\"> ");
                out.push_str(&encode_minimal(&state.name));
                out.push_str("</label>\n");
            }
        });
    }
}

fn render_group(
    out: &mut String,
    tag: &str,
    family: KnobFamily,
    expanded: bool,
    instances: &[ElementInstance],
    controls: impl FnOnce(&mut String),
) {
    out.push_str("<cem-knob-group data-tag=\"");
    out.push_str(&encode_attribute(tag));
    out.push_str("\" data-family=\"");
    out.push_str(family.as_str());
    out.push_str("\">\n<template shadowrootmode=\"open\">\n");
    out.push_str("<link rel=\"stylesheet\" href=\"/__cem/chrome.css\">\n");
    out.push_str("<details class=\"knob-group\"");
    if expanded {
        out.push_str(" open");
    }
    out.push_str("><summary>");
    out.push_str(&encode_minimal(tag));
    out.push_str(" \u{00b7} ");
    out.push_str(family.as_str());
    out.push_str("</summary>\n");

    if instances.len() > 1 {
        out.push_str("<select class=\"knob-target\" data-knob-target>\n");
        for instance in instances {
            out.push_str("<option value=\"");
            out.push_str(&instance.index.to_string());
            out.push_str("\">");
            out.push_str(&encode_minimal(&instance_label(instance)));
            out.push_str("</option>\n");
        }
        out.push_str("</select>\n");
    }

    controls(out);
    out.push_str("</details>\n</template>\n</cem-knob-group>\n");
}

fn render_attribute_control(out: &mut String, attribute: &serve_manifest::AttributeDecl) {
    let name = attribute.name.as_str();
    let default = attribute.default.as_deref().map(strip_quotes);
    match attribute.control_kind() {
        ControlKind::Checkbox => {
            out.push_str("<label class=\"knob\"><input type=\"checkbox\" data-knob=\"attribute\" data-attr=\"");
            out.push_str(&encode_attribute(name));
            out.push('"');
            if matches!(default, Some("true")) {
                out.push_str(" checked");
            }
            out.push_str("> ");
            out.push_str(&encode_minimal(name));
            out.push_str("</label>\n");
        }
        ControlKind::Select(options) => {
            out.push_str("<label class=\"knob\">");
            out.push_str(&encode_minimal(name));
            out.push_str(" <select data-knob=\"attribute\" data-attr=\"");
            out.push_str(&encode_attribute(name));
            out.push_str("\">\n");
            for option in &options {
                out.push_str("<option value=\"");
                out.push_str(&encode_attribute(option));
                out.push('"');
                if default == Some(option.as_str()) {
                    out.push_str(" selected");
                }
                out.push('>');
                out.push_str(&encode_minimal(option));
                out.push_str("</option>\n");
            }
            out.push_str("</select></label>\n");
        }
        ControlKind::Number => {
            out.push_str("<label class=\"knob\">");
            out.push_str(&encode_minimal(name));
            out.push_str(" <input type=\"number\" data-knob=\"attribute\" data-attr=\"");
            out.push_str(&encode_attribute(name));
            out.push('"');
            if let Some(default) = default {
                out.push_str(" value=\"");
                out.push_str(&encode_attribute(default));
                out.push('"');
            }
            out.push_str("></label>\n");
        }
        ControlKind::MultiCheckbox(options) => {
            out.push_str("<fieldset class=\"knob\"><legend>");
            out.push_str(&encode_minimal(name));
            out.push_str("</legend>\n");
            for option in &options {
                out.push_str("<label><input type=\"checkbox\" data-knob=\"attribute-list\" data-attr=\"");
                out.push_str(&encode_attribute(name));
                out.push_str("\" data-value=\"");
                out.push_str(&encode_attribute(option));
                out.push_str("\"> ");
                out.push_str(&encode_minimal(option));
                out.push_str("</label>\n");
            }
            out.push_str("</fieldset>\n");
        }
        ControlKind::Text => {
            out.push_str("<label class=\"knob\">");
            out.push_str(&encode_minimal(name));
            out.push_str(" <input type=\"text\" data-knob=\"attribute\" data-attr=\"");
            out.push_str(&encode_attribute(name));
            out.push('"');
            if let Some(default) = default {
                out.push_str(" value=\"");
                out.push_str(&encode_attribute(default));
                out.push('"');
            }
            out.push_str("></label>\n");
        }
    }
}

/// CEM defaults are source text: `'flat'` means the string `flat`.
fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| trimmed.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
        .unwrap_or(trimmed)
}
