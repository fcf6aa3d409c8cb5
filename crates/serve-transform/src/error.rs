//! Transform failure taxonomy.
//!
//! Transform errors are user-code errors: they surface to the browser as a
//! structured overlay payload and as the HTTP error body, and they are never
//! cached. The conversion to the wire event lives here so every producer
//! reports failures the same way.

use serve_events::{ErrorKind, ReloadEvent, SourceLoc};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{}: {message}", path.display(), loc.map(|l| l.line).unwrap_or(0))]
    Parse {
        kind: ErrorKind,
        path: PathBuf,
        message: String,
        loc: Option<SourceLoc>,
    },

    #[error("{} is not valid UTF-8", path.display())]
    NotUtf8 { path: PathBuf },

    #[error("unsupported ECMAScript target `{0}`")]
    UnsupportedTarget(String),

    #[error("transform canceled by shutdown")]
    Canceled,
}

impl TransformError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The reload event the hub broadcasts for this failure.
    pub fn to_event(&self) -> ReloadEvent {
        match self {
            TransformError::Parse {
                kind,
                path,
                message,
                loc,
            } => ReloadEvent::Error {
                kind: *kind,
                message: message.clone(),
                source: Some(path.display().to_string()),
                loc: *loc,
            },
            TransformError::Io { path, source } => ReloadEvent::Error {
                kind: ErrorKind::Ts,
                message: source.to_string(),
                source: Some(path.display().to_string()),
                loc: None,
            },
            TransformError::NotUtf8 { path } => ReloadEvent::Error {
                kind: ErrorKind::Ts,
                message: "file is not valid UTF-8".to_string(),
                source: Some(path.display().to_string()),
                loc: None,
            },
            TransformError::UnsupportedTarget(target) => ReloadEvent::Error {
                kind: ErrorKind::Ts,
                message: format!("unsupported ECMAScript target `{target}`"),
                source: None,
                loc: None,
            },
            TransformError::Canceled => ReloadEvent::Error {
                kind: ErrorKind::Ts,
                message: "transform canceled".to_string(),
                source: None,
                loc: None,
            },
        }
    }

    /// JSON body for the HTTP 500 carrying the same payload as the event.
    pub fn to_json(&self) -> String {
        self.to_event().to_json()
    }
}
