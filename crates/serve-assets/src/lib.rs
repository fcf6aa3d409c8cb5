//! Embedded client runtime served under `/__cem/`.
//!
//! The three assets are compiled into the binary; a missing one is a
//! programmer error caught by [`verify`] at startup, not a runtime 404.

pub const RELOAD_JS: &str = include_str!("../assets/reload.js");
pub const CHROME_JS: &str = include_str!("../assets/chrome.js");
pub const CHROME_CSS: &str = include_str!("../assets/chrome.css");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedAsset {
    /// Path relative to the `/__cem/` mount.
    pub path: &'static str,
    pub content_type: &'static str,
    pub body: &'static str,
}

pub const ASSETS: [EmbeddedAsset; 3] = [
    EmbeddedAsset {
        path: "reload.js",
        content_type: "application/javascript",
        body: RELOAD_JS,
    },
    EmbeddedAsset {
        path: "chrome.js",
        content_type: "application/javascript",
        body: CHROME_JS,
    },
    EmbeddedAsset {
        path: "chrome.css",
        content_type: "text/css",
        body: CHROME_CSS,
    },
];

/// Look up an asset by its path under `/__cem/` (no leading slash).
pub fn lookup(path: &str) -> Option<EmbeddedAsset> {
    ASSETS.iter().copied().find(|a| a.path == path)
}

/// Startup sanity check. An empty embedded asset means the build is broken;
/// callers treat this as fatal.
pub fn verify() -> Result<(), &'static str> {
    for asset in ASSETS {
        if asset.body.trim().is_empty() {
            return Err(asset.path);
        }
    }
    Ok(())
}
