//! Filesystem watching and manifest regeneration.

pub mod classify;
pub mod engine;
pub mod watcher;

pub use classify::Classifier;
pub use engine::{first_generation, watch_set_for, RegenEngine};
pub use watcher::{spawn as spawn_watcher, WatchSet, WatcherControl, WatcherHandle, WatcherOptions};
