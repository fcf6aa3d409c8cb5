//! Shared event alphabet for the dev server.
//!
//! Three subsystems speak through the types in this crate: the watcher
//! classifies filesystem batches into [`ChangeKind`] and enqueues
//! [`RegenJob`]s, the regeneration engine publishes [`ReloadEvent`]s, and
//! the reload hub fans those events out to connected browsers as JSON text
//! frames. Keeping the alphabet in a leaf crate avoids dependency cycles
//! between the watcher, the engine, and the HTTP layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

// -------------------------------------------------------------------------------------------------
// Channel Policy
// -------------------------------------------------------------------------------------------------
// The regen queue is effectively depth-one: the watcher coalesces everything
// that arrives while a job is in flight into a single pending job, so a small
// bounded channel is enough and keeps memory flat under event storms. The
// per-client reload queue is bounded at CLIENT_QUEUE_CAP with a drop-oldest
// policy owned by the hub; the producer never blocks on a slow browser.
// -------------------------------------------------------------------------------------------------

/// Capacity of the watcher -> regen engine job channel.
pub const REGEN_CHANNEL_CAP: usize = 4;

/// Bounded send-queue depth per connected reload client (`Q` in the design).
pub const CLIENT_QUEUE_CAP: usize = 16;

/// Debounce window for filesystem event batches.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Debounce window for hub broadcasts (`W_b`).
pub const BROADCAST_DEBOUNCE: Duration = Duration::from_millis(50);

/// Per-client WebSocket write timeout (`T_w`).
pub const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat ping interval (`T_p`); a client missing pongs for two intervals
/// is closed.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for draining client queues during shutdown (`T_s`).
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Why a full reload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadReason {
    Manifest,
    Demo,
    Config,
}

/// Which producer an [`ReloadEvent::Error`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Ts,
    Css,
    Template,
    Manifest,
}

/// Source location for compile/render failures, when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

/// Server -> client reload event, serialized as a tagged JSON object.
///
/// Wire shape (see the external interface contract):
/// `{"type":"reload","reason":"manifest","files":["src/my-card.ts"]}` and
/// friends. The hub may attach a `coalesced` flag to the envelope when the
/// drop-oldest policy collapsed queued events; that flag lives on the
/// envelope, not here, so the event value itself stays a pure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReloadEvent {
    Reload {
        reason: ReloadReason,
        files: Vec<String>,
    },
    CssHmr {
        urls: Vec<String>,
    },
    ManifestUpdated {
        added: Vec<String>,
        removed: Vec<String>,
        changed: Vec<String>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        loc: Option<SourceLoc>,
    },
    Shutdown,
}

/// Discriminant of a [`ReloadEvent`], used by the hub for coalescing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Reload,
    ManifestUpdated,
    CssHmr,
    Error,
    Shutdown,
}

impl ReloadEvent {
    pub fn class(&self) -> EventClass {
        match self {
            ReloadEvent::Reload { .. } => EventClass::Reload,
            ReloadEvent::ManifestUpdated { .. } => EventClass::ManifestUpdated,
            ReloadEvent::CssHmr { .. } => EventClass::CssHmr,
            ReloadEvent::Error { .. } => EventClass::Error,
            ReloadEvent::Shutdown => EventClass::Shutdown,
        }
    }

    /// Coalescing precedence: `Reload > ManifestUpdated > CssHmr > Error`.
    ///
    /// Only consulted when a debounce window holds events of different
    /// classes and a higher class supersedes a lower one (a pending
    /// `CssHmr` is dropped once a `Reload` joins the batch). `Shutdown`
    /// never competes; the hub sends it out of band.
    pub fn precedence(&self) -> u8 {
        match self.class() {
            EventClass::Reload => 4,
            EventClass::ManifestUpdated => 3,
            EventClass::CssHmr => 2,
            EventClass::Error => 1,
            EventClass::Shutdown => 0,
        }
    }

    /// Merge `other` into `self`. Both events must share a class; the
    /// caller guarantees this. List payloads are unioned preserving first
    /// appearance order; for `Error` the newest event wins wholesale.
    pub fn merge_from(&mut self, other: ReloadEvent) {
        debug_assert_eq!(self.class(), other.class(), "cross-class merge");
        match (self, other) {
            (
                ReloadEvent::Reload { files, .. },
                ReloadEvent::Reload {
                    files: new_files, ..
                },
            ) => {
                union_into(files, new_files);
            }
            (
                ReloadEvent::CssHmr { urls },
                ReloadEvent::CssHmr { urls: new_urls },
            ) => {
                union_into(urls, new_urls);
            }
            (
                ReloadEvent::ManifestUpdated {
                    added,
                    removed,
                    changed,
                },
                ReloadEvent::ManifestUpdated {
                    added: a,
                    removed: r,
                    changed: c,
                },
            ) => {
                union_into(added, a);
                union_into(removed, r);
                union_into(changed, c);
            }
            (this @ ReloadEvent::Error { .. }, other @ ReloadEvent::Error { .. }) => {
                *this = other;
            }
            _ => {}
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail: every payload is made of
        // strings and integers.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"shutdown\"}"))
    }
}

fn union_into(dst: &mut Vec<String>, src: Vec<String>) {
    for item in src {
        if !dst.contains(&item) {
            dst.push(item);
        }
    }
}

/// Classification of a debounced filesystem batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A watched config file changed; config is reloaded before regen.
    ConfigChanged,
    /// An element source file changed (present in `file_to_tags` or matching
    /// the generator's input globs).
    ElementSourceChanged,
    /// A demo fragment changed and no element source did.
    DemoChanged,
    /// Only `.css` files changed, none of which are element sources.
    CssOnly,
    /// Nothing we track; the batch is dropped.
    Unknown,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::ConfigChanged => "config",
            ChangeKind::ElementSourceChanged => "element_source",
            ChangeKind::DemoChanged => "demo",
            ChangeKind::CssOnly => "css_only",
            ChangeKind::Unknown => "unknown",
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Shutdown signalling
// -------------------------------------------------------------------------------------------------

/// Broadcast half of the cooperative shutdown pair. Every long-running task
/// holds a [`ShutdownListener`]; the runtime owner signals once and all
/// listeners wake. Signalling is idempotent.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: tokio::sync::watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: tokio::sync::watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::watch::channel(false);
        Self { tx }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    /// Resolve once shutdown has been signalled. Immediate when the signal
    /// already fired.
    pub async fn wait(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // Err means the signal owner is gone, which is shutdown too.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }

    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// A unit of work for the regeneration engine: one classified batch.
#[derive(Debug, Clone)]
pub struct RegenJob {
    pub kind: ChangeKind,
    pub files: Vec<PathBuf>,
    pub received_at: Instant,
}

impl RegenJob {
    pub fn new(kind: ChangeKind, files: Vec<PathBuf>) -> Self {
        Self {
            kind,
            files,
            received_at: Instant::now(),
        }
    }

    /// Fold a later batch into this pending job. The kind escalates toward
    /// the broader classification: any element-source involvement wins over
    /// demo, which wins over css-only; config always wins.
    pub fn absorb(&mut self, other: RegenJob) {
        self.kind = match (self.kind, other.kind) {
            (ChangeKind::ConfigChanged, _) | (_, ChangeKind::ConfigChanged) => {
                ChangeKind::ConfigChanged
            }
            (ChangeKind::ElementSourceChanged, _) | (_, ChangeKind::ElementSourceChanged) => {
                ChangeKind::ElementSourceChanged
            }
            (ChangeKind::DemoChanged, _) | (_, ChangeKind::DemoChanged) => ChangeKind::DemoChanged,
            (ChangeKind::CssOnly, _) | (_, ChangeKind::CssOnly) => ChangeKind::CssOnly,
            (ChangeKind::Unknown, ChangeKind::Unknown) => ChangeKind::Unknown,
        };
        for file in other.files {
            if !self.files.contains(&file) {
                self.files.push(file);
            }
        }
    }
}
