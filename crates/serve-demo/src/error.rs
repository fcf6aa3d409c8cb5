//! Demo resolution and rendering failures.

use serve_events::{ErrorKind, ReloadEvent};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("no demo `{slug}` for element `{tag}`")]
    NotFound { tag: String, slug: String },

    #[error("demo source {} does not exist", path.display())]
    SourceMissing { path: PathBuf },

    #[error("reading demo source {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DemoError {
    /// 404 for resolution failures the author can fix by creating the file
    /// or fixing the URL; 500 for real I/O trouble.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DemoError::NotFound { .. } | DemoError::SourceMissing { .. })
    }

    pub fn to_event(&self) -> ReloadEvent {
        let source = match self {
            DemoError::SourceMissing { path } | DemoError::Io { path, .. } => {
                Some(path.display().to_string())
            }
            DemoError::NotFound { .. } => None,
        };
        ReloadEvent::Error {
            kind: ErrorKind::Template,
            message: self.to_string(),
            source,
            loc: None,
        }
    }
}
