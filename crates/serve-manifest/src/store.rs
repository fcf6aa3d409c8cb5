//! Single-writer / many-reader manifest cell.
//!
//! Readers capture one [`ManifestSnapshot`] at request entry and use it for
//! the whole request; the pair of manifest and indices travels together so a
//! reader can never observe indices derived from a different manifest.
//! Writers (the regeneration engine, exactly one) replace the snapshot
//! wholesale. Both sides hold the lock only long enough to clone or store an
//! `Arc`, so neither ever blocks the other for meaningful time.

use crate::index::{Indices, TagDiff};
use crate::model::Manifest;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
pub struct ManifestSnapshot {
    pub manifest: Arc<Manifest>,
    pub indices: Arc<Indices>,
    /// Monotonic swap counter; 0 is the startup snapshot.
    pub generation: u64,
}

impl ManifestSnapshot {
    fn initial(manifest: Manifest) -> Self {
        let indices = Indices::derive(&manifest);
        Self {
            manifest: Arc::new(manifest),
            indices: Arc::new(indices),
            generation: 0,
        }
    }
}

/// Advisory notification emitted on every swap.
#[derive(Debug, Clone, Default)]
pub struct ManifestNotice {
    pub generation: u64,
    pub diff: TagDiff,
}

pub struct ManifestStore {
    current: RwLock<Arc<ManifestSnapshot>>,
    notices: watch::Sender<ManifestNotice>,
}

impl ManifestStore {
    pub fn new(manifest: Manifest) -> Self {
        let (notices, _) = watch::channel(ManifestNotice::default());
        Self {
            current: RwLock::new(Arc::new(ManifestSnapshot::initial(manifest))),
            notices,
        }
    }

    /// Capture the current snapshot. Cheap: one Arc clone under a read
    /// guard.
    pub fn snapshot(&self) -> Arc<ManifestSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Atomically publish a new manifest with freshly derived indices.
    /// Returns the previous snapshot. Called only by the regeneration
    /// engine; the notice channel observes the post-swap state, so any
    /// broadcast that follows reflects the published manifest.
    pub fn swap(&self, manifest: Manifest, indices: Indices, diff: TagDiff) -> Arc<ManifestSnapshot> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let generation = guard.generation + 1;
        let next = Arc::new(ManifestSnapshot {
            manifest: Arc::new(manifest),
            indices: Arc::new(indices),
            generation,
        });
        let prev = std::mem::replace(&mut *guard, next);
        drop(guard);

        debug!(
            target: "manifest.store",
            generation,
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "manifest_swapped"
        );
        let _ = self.notices.send(ManifestNotice { generation, diff });
        prev
    }

    /// Subscribe to swap notices. Receivers that lag only observe the most
    /// recent notice, which is all an advisory consumer needs.
    pub fn subscribe(&self) -> watch::Receiver<ManifestNotice> {
        self.notices.subscribe()
    }
}
