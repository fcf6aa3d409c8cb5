//! The Custom Elements Manifest value model.
//!
//! A [`Manifest`] is an immutable description of the project's components:
//! an ordered sequence of modules, each holding a flat arena of
//! declarations. Cross-references between entities are arena indices
//! ([`DeclRef`]), never pointers, so a manifest can be published behind an
//! `Arc` and shared across request handlers without any interior mutability.
//!
//! The serde view matches the `custom-elements.json` schema closely enough
//! to deserialize real generator output; fields this server does not consume
//! are ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub modules: Vec<ManifestModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestModule {
    /// Workspace-relative path of the source file this module describes.
    pub path: PathBuf,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

/// Index of a declaration within a manifest: `(module index, declaration
/// index)`. Stable for the lifetime of one manifest value; never reused
/// across swaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeclRef {
    pub module: usize,
    pub decl: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Present and `true` only for custom-element class declarations.
    #[serde(default)]
    pub custom_element: bool,
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDecl>,
    #[serde(default)]
    pub slots: Vec<SlotDecl>,
    #[serde(default)]
    pub css_parts: Vec<CssPartDecl>,
    #[serde(default)]
    pub css_properties: Vec<CssPropertyDecl>,
    #[serde(default)]
    pub css_states: Vec<CssStateDecl>,
    #[serde(default)]
    pub events: Vec<EventDecl>,
    #[serde(default)]
    pub demos: Vec<DemoDecl>,
    /// CSS files imported (transitively) by the defining module. Feeds the
    /// watcher's dependency set.
    #[serde(default)]
    pub css_imports: Vec<PathBuf>,
}

impl Declaration {
    pub fn is_element(&self) -> bool {
        self.custom_element && self.tag_name.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub type_info: Option<TypeInfo>,
    #[serde(default)]
    pub default: Option<String>,
    /// Reflected DOM property name, when it differs from the attribute.
    #[serde(default)]
    pub field_name: Option<String>,
}

impl AttributeDecl {
    pub fn control_kind(&self) -> ControlKind {
        self.type_info
            .as_ref()
            .map(|t| ControlKind::from_type_text(&t.text))
            .unwrap_or(ControlKind::Text)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TypeInfo {
    #[serde(default)]
    pub text: String,
}

/// The interactive control a knob renders for an attribute, chosen from the
/// attribute's declared type text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// `boolean` -> presence-toggled checkbox.
    Checkbox,
    /// Union of string literals -> `<select>` with one option per member.
    Select(Vec<String>),
    /// `number` -> numeric input.
    Number,
    /// Array of a string-literal union -> one checkbox per member.
    MultiCheckbox(Vec<String>),
    /// Everything else, including plain `string`.
    Text,
}

impl ControlKind {
    /// Parse a CEM type expression. Recognized shapes, in order:
    /// `boolean`, `number`, `('a'|'b')[]` / `Array<'a'|'b'>`, `'a'|'b'`.
    /// Anything else (including unions mixing literals with other types)
    /// degrades to a text control.
    pub fn from_type_text(text: &str) -> ControlKind {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return ControlKind::Text;
        }
        match trimmed {
            "boolean" => return ControlKind::Checkbox,
            "number" => return ControlKind::Number,
            "string" => return ControlKind::Text,
            _ => {}
        }

        if let Some(inner) = trimmed
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(")[]"))
        {
            if let Some(options) = parse_literal_union(inner) {
                return ControlKind::MultiCheckbox(options);
            }
        }
        if let Some(inner) = trimmed
            .strip_prefix("Array<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            if let Some(options) = parse_literal_union(inner) {
                return ControlKind::MultiCheckbox(options);
            }
        }
        if let Some(options) = parse_literal_union(trimmed) {
            return ControlKind::Select(options);
        }
        ControlKind::Text
    }
}

/// `'a' | 'b' | 'c'` (or double-quoted) -> member list. Returns `None` when
/// any branch is not a quoted literal.
fn parse_literal_union(text: &str) -> Option<Vec<String>> {
    let mut options = Vec::new();
    for branch in text.split('|') {
        let branch = branch.trim();
        let unquoted = branch
            .strip_prefix('\'')
            .and_then(|b| b.strip_suffix('\''))
            .or_else(|| branch.strip_prefix('"').and_then(|b| b.strip_suffix('"')))?;
        options.push(unquoted.to_string());
    }
    (!options.is_empty()).then_some(options)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlotDecl {
    /// Empty string names the default slot.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CssPartDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CssPropertyDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub syntax: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CssStateDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DemoDecl {
    /// Canonical (authored) URL for the demo, when the generator knows one.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    /// Workspace-relative path of the demo HTML fragment.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl Manifest {
    pub fn get(&self, decl: DeclRef) -> Option<&Declaration> {
        self.modules.get(decl.module)?.declarations.get(decl.decl)
    }

    /// Iterate `(DeclRef, module path, declaration)` over every custom
    /// element, in manifest order.
    pub fn elements(&self) -> impl Iterator<Item = (DeclRef, &Path, &Declaration)> {
        self.modules.iter().enumerate().flat_map(|(mi, module)| {
            module
                .declarations
                .iter()
                .enumerate()
                .filter(|(_, d)| d.is_element())
                .map(move |(di, d)| {
                    (
                        DeclRef {
                            module: mi,
                            decl: di,
                        },
                        module.path.as_path(),
                        d,
                    )
                })
        })
    }

    pub fn element_count(&self) -> usize {
        self.elements().count()
    }
}
