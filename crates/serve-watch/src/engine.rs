//! Regeneration engine: consume jobs, produce swaps, publish events.
//!
//! Exactly one regen is in flight at a time; the watcher coalesces
//! everything that arrives meanwhile. The generator call is synchronous and
//! potentially long, so it runs on a blocking worker and never on a request
//! path. A failed generation keeps the previous manifest: stale but correct
//! service continues while the browser shows the error overlay.

use crate::watcher::{WatchSet, WatcherHandle};
use serve_config::{CliOverrides, ConfigCell};
use serve_events::{
    ChangeKind, ErrorKind, RegenJob, ReloadEvent, ReloadReason, ShutdownListener,
};
use serve_manifest::{Indices, Manifest, ManifestGenerator, ManifestStore, TagDiff};
use serve_transform::TransformCache;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct RegenEngine {
    root: PathBuf,
    store: Arc<ManifestStore>,
    generator: Arc<dyn ManifestGenerator>,
    cache: Arc<TransformCache>,
    config: Arc<ConfigCell>,
    cli: CliOverrides,
    events_tx: mpsc::Sender<ReloadEvent>,
    watcher: WatcherHandle,
}

impl RegenEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        store: Arc<ManifestStore>,
        generator: Arc<dyn ManifestGenerator>,
        cache: Arc<TransformCache>,
        config: Arc<ConfigCell>,
        cli: CliOverrides,
        events_tx: mpsc::Sender<ReloadEvent>,
        watcher: WatcherHandle,
    ) -> Self {
        Self {
            root,
            store,
            generator,
            cache,
            config,
            cli,
            events_tx,
            watcher,
        }
    }

    pub async fn run(self, mut jobs_rx: mpsc::Receiver<RegenJob>, mut shutdown: ShutdownListener) {
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                job = jobs_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
            self.watcher.job_done();
        }
        debug!(target: "manifest.regen", "engine_stopped");
    }

    async fn process(&self, job: RegenJob) {
        let started = Instant::now();
        let mut kind = job.kind;

        if matches!(kind, ChangeKind::ConfigChanged) {
            match serve_config::reload(&self.config.load(), &self.cli) {
                Ok(next) => {
                    self.config.store(next);
                    info!(target: "manifest.regen", "config_reloaded");
                }
                Err(err) => {
                    // Keep the previous config; the file may be mid-save.
                    warn!(target: "manifest.regen", ?err, "config_reload_failed");
                }
            }
            kind = ChangeKind::ElementSourceChanged;
        }

        let generator = self.generator.clone();
        let root = self.root.clone();
        let generated = tokio::task::spawn_blocking(move || generator.generate(&root)).await;

        let manifest = match generated {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(err)) => {
                warn!(target: "manifest.regen", ?err, "generation_failed_keeping_previous");
                self.send(ReloadEvent::Error {
                    kind: ErrorKind::Manifest,
                    message: format!("{err:#}"),
                    source: None,
                    loc: None,
                })
                .await;
                return;
            }
            Err(join_err) => {
                error!(target: "manifest.regen", ?join_err, "generator_worker_panicked");
                return;
            }
        };

        let prev = self.store.snapshot();
        let indices = Indices::derive(&manifest);
        let diff = TagDiff::compute(&prev.manifest, &manifest);
        let removed_sources = TagDiff::removed_sources(&prev.manifest, &manifest);
        let dependency_files = indices.dependency_files.clone();
        self.store.swap(manifest, indices, diff.clone());

        for file in &job.files {
            self.cache.invalidate(file);
        }
        for source in &removed_sources {
            self.cache.invalidate(&self.root.join(source));
        }

        self.publish(kind, job.kind, &job.files, &diff).await;

        let config = self.config.load();
        self.watcher.rebuild(watch_set_for(
            &self.root,
            &dependency_files,
            config.config_path.as_deref(),
        ));

        info!(
            target: "manifest.regen",
            kind = kind.as_str(),
            files = job.files.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "regen_complete"
        );
    }

    /// Event publication rules. `kind` is the effective kind after config
    /// escalation; `original_kind` keeps the reload reason honest for
    /// config-triggered reloads.
    async fn publish(
        &self,
        kind: ChangeKind,
        original_kind: ChangeKind,
        files: &[PathBuf],
        diff: &TagDiff,
    ) {
        match kind {
            ChangeKind::CssOnly if diff.is_empty() => {
                self.send(ReloadEvent::CssHmr {
                    urls: url_paths(&self.root, files),
                })
                .await;
            }
            ChangeKind::DemoChanged => {
                self.send(ReloadEvent::Reload {
                    reason: ReloadReason::Demo,
                    files: relative_paths(&self.root, files),
                })
                .await;
            }
            _ => {
                if !diff.is_empty() {
                    self.send(ReloadEvent::ManifestUpdated {
                        added: diff.added.clone(),
                        removed: diff.removed.clone(),
                        changed: diff.changed.clone(),
                    })
                    .await;
                }
                let reason = match original_kind {
                    ChangeKind::ConfigChanged => ReloadReason::Config,
                    _ => ReloadReason::Manifest,
                };
                self.send(ReloadEvent::Reload {
                    reason,
                    files: relative_paths(&self.root, files),
                })
                .await;
            }
        }
    }

    async fn send(&self, event: ReloadEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!(target: "manifest.regen", "event_channel_closed");
        }
    }
}

/// First generation at startup. A workspace without a manifest is served as
/// empty rather than refusing to start; the warning is the operator's cue.
pub fn first_generation(generator: &dyn ManifestGenerator, root: &Path) -> Manifest {
    match generator.generate(root) {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(
                target: "manifest.regen",
                ?err,
                "initial_generation_failed_starting_empty"
            );
            Manifest::default()
        }
    }
}

/// Absolute watch set for a manifest's dependency files plus the config
/// file, when one exists.
pub fn watch_set_for(
    root: &Path,
    dependency_files: &BTreeSet<PathBuf>,
    config_path: Option<&Path>,
) -> WatchSet {
    let files = dependency_files
        .iter()
        .map(|f| if f.is_absolute() { f.clone() } else { root.join(f) })
        .collect();
    let config_files = config_path
        .map(|p| BTreeSet::from([p.to_path_buf()]))
        .unwrap_or_default();
    WatchSet::new(files, config_files)
}

fn relative_paths(root: &Path, files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|f| {
            let rel = f.strip_prefix(root).unwrap_or(f);
            rel.to_string_lossy().replace('\\', "/")
        })
        .collect()
}

fn url_paths(root: &Path, files: &[PathBuf]) -> Vec<String> {
    relative_paths(root, files)
        .into_iter()
        .map(|rel| format!("/{rel}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::WatcherControl;
    use serve_config::{resolve, ConfigFile};
    use serve_manifest::{Declaration, InputSpec, ManifestModule};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct SeqGenerator {
        results: Mutex<VecDeque<anyhow::Result<Manifest>>>,
        spec: InputSpec,
    }

    impl SeqGenerator {
        fn new(results: Vec<anyhow::Result<Manifest>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                spec: InputSpec::default(),
            }
        }
    }

    impl ManifestGenerator for SeqGenerator {
        fn generate(&self, _root: &Path) -> anyhow::Result<Manifest> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("generator exhausted")))
        }

        fn input_spec(&self) -> &InputSpec {
            &self.spec
        }
    }

    fn manifest_with(tag: &str) -> Manifest {
        Manifest {
            schema_version: "1.0.0".into(),
            modules: vec![ManifestModule {
                path: PathBuf::from(format!("src/{tag}.ts")),
                declarations: vec![Declaration {
                    custom_element: true,
                    tag_name: Some(tag.into()),
                    ..Declaration::default()
                }],
            }],
        }
    }

    struct Harness {
        engine: RegenEngine,
        events_rx: mpsc::Receiver<ReloadEvent>,
        control_rx: crossbeam_channel::Receiver<WatcherControl>,
        store: Arc<ManifestStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(initial: Manifest, generator: SeqGenerator) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let store = Arc::new(ManifestStore::new(initial));
        let cache = Arc::new(TransformCache::default());
        let config = resolve(
            root.clone(),
            ConfigFile::default(),
            None,
            &CliOverrides::default(),
        )
        .unwrap();
        let (events_tx, events_rx) = mpsc::channel(16);
        let (watcher, control_rx, _done_rx) = WatcherHandle::detached();
        let engine = RegenEngine::new(
            root,
            store.clone(),
            Arc::new(generator),
            cache,
            Arc::new(ConfigCell::new(config)),
            CliOverrides::default(),
            events_tx,
            watcher,
        );
        Harness {
            engine,
            events_rx,
            control_rx,
            store,
            _dir: dir,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ReloadEvent>) -> ReloadEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn element_change_swaps_and_publishes_in_order() {
        let mut h = harness(
            manifest_with("my-card"),
            SeqGenerator::new(vec![Ok(manifest_with("my-card-v2"))]),
        );
        let file = h.engine.root.join("src/my-card.ts");
        h.engine
            .process(RegenJob::new(ChangeKind::ElementSourceChanged, vec![file]))
            .await;

        let first = next_event(&mut h.events_rx).await;
        let second = next_event(&mut h.events_rx).await;
        assert!(
            matches!(first, ReloadEvent::ManifestUpdated { .. }),
            "advisory precedes reload, got {first:?}"
        );
        assert_eq!(
            second,
            ReloadEvent::Reload {
                reason: ReloadReason::Manifest,
                files: vec!["src/my-card.ts".into()],
            }
        );

        assert_eq!(h.store.snapshot().generation, 1);
        assert!(h
            .store
            .snapshot()
            .indices
            .tag_to_element
            .contains_key("my-card-v2"));
        // Watch set was rebuilt from the new manifest.
        assert!(matches!(
            h.control_rx.try_recv(),
            Ok(WatcherControl::Rebuild(_))
        ));
    }

    #[tokio::test]
    async fn generator_error_keeps_previous_manifest() {
        let mut h = harness(
            manifest_with("my-card"),
            SeqGenerator::new(vec![Err(anyhow::anyhow!("parse exploded"))]),
        );
        h.engine
            .process(RegenJob::new(
                ChangeKind::ElementSourceChanged,
                vec![h.engine.root.join("src/my-card.ts")],
            ))
            .await;

        let event = next_event(&mut h.events_rx).await;
        match event {
            ReloadEvent::Error { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Manifest);
                assert!(message.contains("parse exploded"));
            }
            other => panic!("expected manifest error, got {other:?}"),
        }
        assert_eq!(h.store.snapshot().generation, 0, "no swap on failure");
        assert!(h
            .store
            .snapshot()
            .indices
            .tag_to_element
            .contains_key("my-card"));
    }

    #[tokio::test]
    async fn css_only_change_yields_hmr_not_reload() {
        let same = manifest_with("my-card");
        let mut h = harness(same.clone(), SeqGenerator::new(vec![Ok(same)]));
        h.engine
            .process(RegenJob::new(
                ChangeKind::CssOnly,
                vec![h.engine.root.join("src/my-card.css")],
            ))
            .await;

        let event = next_event(&mut h.events_rx).await;
        assert_eq!(
            event,
            ReloadEvent::CssHmr {
                urls: vec!["/src/my-card.css".into()],
            }
        );
        assert!(
            h.events_rx.try_recv().is_err(),
            "css-only publishes exactly one event"
        );
    }

    #[tokio::test]
    async fn demo_change_publishes_demo_reload() {
        let same = manifest_with("my-card");
        let mut h = harness(same.clone(), SeqGenerator::new(vec![Ok(same)]));
        h.engine
            .process(RegenJob::new(
                ChangeKind::DemoChanged,
                vec![h.engine.root.join("src/my-card/demo/index.html")],
            ))
            .await;

        let event = next_event(&mut h.events_rx).await;
        assert_eq!(
            event,
            ReloadEvent::Reload {
                reason: ReloadReason::Demo,
                files: vec!["src/my-card/demo/index.html".into()],
            }
        );
    }

    #[tokio::test]
    async fn config_change_reloads_config_and_reports_config_reason() {
        let same = manifest_with("my-card");
        let mut h = harness(same.clone(), SeqGenerator::new(vec![Ok(same)]));
        let config_file = h.engine.root.join("cem.config.yaml");
        h.engine
            .process(RegenJob::new(ChangeKind::ConfigChanged, vec![config_file]))
            .await;

        let event = next_event(&mut h.events_rx).await;
        assert_eq!(
            event,
            ReloadEvent::Reload {
                reason: ReloadReason::Config,
                files: vec!["cem.config.yaml".into()],
            }
        );
    }

    #[test]
    fn first_generation_falls_back_to_empty() {
        let generator = SeqGenerator::new(vec![Err(anyhow::anyhow!("no manifest"))]);
        let manifest = first_generation(&generator, Path::new("/nowhere"));
        assert_eq!(manifest.element_count(), 0);
    }
}
