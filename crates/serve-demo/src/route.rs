//! Demo URL grammar.
//!
//! `/components/{tag}/demo/{slug}/` with optional query switches:
//! `?chrome=false` for the bare fragment in a minimal shell,
//! `?disable-knobs=all`, and repeated `?disable-knobs[]=family` to disable
//! named knob families. Routes without the trailing slash are recognized so
//! the server can answer with a canonical redirect.

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoRoute {
    pub tag: String,
    pub slug: String,
    pub trailing_slash: bool,
}

impl DemoRoute {
    pub fn canonical_path(&self) -> String {
        format!("/components/{}/demo/{}/", self.tag, self.slug)
    }
}

/// Parse a request path (no query) against the demo grammar.
pub fn parse_demo_path(path: &str) -> Option<DemoRoute> {
    let trimmed = path.strip_prefix("/components/")?;
    let (trimmed, trailing_slash) = match trimmed.strip_suffix('/') {
        Some(rest) => (rest, true),
        None => (trimmed, false),
    };
    let mut parts = trimmed.split('/');
    let tag = parts.next()?;
    let demo = parts.next()?;
    let slug = parts.next()?;
    if demo != "demo" || parts.next().is_some() || tag.is_empty() || slug.is_empty() {
        return None;
    }
    // Custom element tag names contain a dash; rejecting others keeps the
    // grammar from shadowing static paths under /components/.
    if !tag.contains('-') {
        return None;
    }
    Some(DemoRoute {
        tag: tag.to_string(),
        slug: slug.to_string(),
        trailing_slash,
    })
}

/// Knob families a query can disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KnobFamily {
    Attributes,
    Slots,
    CssProperties,
    CssStates,
}

impl KnobFamily {
    pub const ALL: [KnobFamily; 4] = [
        KnobFamily::Attributes,
        KnobFamily::Slots,
        KnobFamily::CssProperties,
        KnobFamily::CssStates,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnobFamily::Attributes => "attributes",
            KnobFamily::Slots => "slots",
            KnobFamily::CssProperties => "css-properties",
            KnobFamily::CssStates => "css-states",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "attributes" => Some(KnobFamily::Attributes),
            "slots" => Some(KnobFamily::Slots),
            "css-properties" => Some(KnobFamily::CssProperties),
            "css-states" => Some(KnobFamily::CssStates),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub chrome: bool,
    pub disable_all_knobs: bool,
    pub disabled_families: BTreeSet<KnobFamily>,
    /// User-supplied knob markup by tag name; replaces the generated
    /// groups for that tag wholesale.
    pub custom_knob_templates: std::collections::BTreeMap<String, String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            chrome: true,
            disable_all_knobs: false,
            disabled_families: BTreeSet::new(),
            custom_knob_templates: std::collections::BTreeMap::new(),
        }
    }
}

impl RenderOptions {
    pub fn family_enabled(&self, family: KnobFamily) -> bool {
        !self.disable_all_knobs && !self.disabled_families.contains(&family)
    }

    pub fn any_knobs(&self) -> bool {
        !self.disable_all_knobs
            && KnobFamily::ALL
                .iter()
                .any(|f| !self.disabled_families.contains(f))
    }
}

/// Parse the raw query string. Unknown keys and unknown family names are
/// ignored; the page still renders.
pub fn parse_query(query: &str) -> RenderOptions {
    let mut options = RenderOptions::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        let key = urlencoding::decode(key).map(|c| c.into_owned()).unwrap_or_default();
        let value = urlencoding::decode(value)
            .map(|c| c.into_owned())
            .unwrap_or_default();
        match key.as_str() {
            "chrome" => {
                if value == "false" {
                    options.chrome = false;
                }
            }
            "disable-knobs" | "disable-knobs[]" => {
                if value == "all" {
                    options.disable_all_knobs = true;
                } else if let Some(family) = KnobFamily::parse(&value) {
                    options.disabled_families.insert(family);
                }
            }
            _ => {}
        }
    }
    options
}
