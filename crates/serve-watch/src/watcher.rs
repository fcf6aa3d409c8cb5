//! Filesystem watcher: observe, debounce, classify, enqueue.
//!
//! The watcher runs on its own OS thread. notify delivers kernel events
//! into a crossbeam channel; the thread loop coalesces them into batches
//! closed by a debounce window, classifies each batch into one
//! [`ChangeKind`], and pushes a [`RegenJob`] to the engine over a bounded
//! tokio channel. While a job is in flight, further batches fold into a
//! single pending job that is flushed when the engine reports completion.
//!
//! Watch registration is directory-granular: every dependency file's parent
//! directory is watched non-recursively, which keeps deletes and renames
//! visible without a recursive watch over the whole workspace. Paths
//! outside the dependency set that match neither the generator's input
//! globs nor the demo glob never produce a job.

use crate::classify::Classifier;
use crossbeam_channel::{Receiver, Sender};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher as _};
use serve_events::{ChangeKind, RegenJob, DEBOUNCE_WINDOW};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Everything the watcher must observe: manifest dependency files plus the
/// config files named at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSet {
    pub files: BTreeSet<PathBuf>,
    pub config_files: BTreeSet<PathBuf>,
}

impl WatchSet {
    pub fn new(files: BTreeSet<PathBuf>, config_files: BTreeSet<PathBuf>) -> Self {
        Self {
            files,
            config_files,
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains(path) || self.config_files.contains(path)
    }

    /// Directories to register with notify: parents of every watched file,
    /// deduplicated.
    pub fn directories(&self) -> BTreeSet<PathBuf> {
        self.files
            .iter()
            .chain(self.config_files.iter())
            .filter_map(|f| f.parent().map(Path::to_path_buf))
            .collect()
    }
}

#[derive(Debug)]
pub enum WatcherControl {
    Rebuild(WatchSet),
    Shutdown,
}

/// Handle held by the engine (and the runtime owner) to steer the watcher
/// thread. All sends are non-blocking; a disconnected watcher is treated as
/// already stopped.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    control_tx: Sender<WatcherControl>,
    done_tx: Sender<()>,
}

impl WatcherHandle {
    /// Replace the watch set after a manifest swap.
    pub fn rebuild(&self, set: WatchSet) {
        let _ = self.control_tx.send(WatcherControl::Rebuild(set));
    }

    /// Signal that the in-flight regen job finished; any pending coalesced
    /// job is flushed in response.
    pub fn job_done(&self) {
        let _ = self.done_tx.send(());
    }

    pub fn shutdown(&self) {
        let _ = self.control_tx.send(WatcherControl::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, Receiver<WatcherControl>, Receiver<()>) {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        (
            Self {
                control_tx,
                done_tx,
            },
            control_rx,
            done_rx,
        )
    }
}

pub struct WatcherOptions {
    pub debounce: Duration,
    pub max_watched: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            debounce: DEBOUNCE_WINDOW,
            max_watched: serve_config::DEFAULT_MAX_WATCHED_FILES,
        }
    }
}

/// Start the watcher thread. Returns the join handle and the control
/// handle. The thread exits when `Shutdown` arrives or every handle is
/// dropped.
pub fn spawn(
    classifier: Classifier,
    initial: WatchSet,
    jobs_tx: mpsc::Sender<RegenJob>,
    options: WatcherOptions,
) -> anyhow::Result<(std::thread::JoinHandle<()>, WatcherHandle)> {
    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    let handle = WatcherHandle {
        control_tx,
        done_tx,
    };

    let thread = std::thread::Builder::new()
        .name("cem-watcher".into())
        .spawn(move || {
            let mut task = WatcherTask::new(classifier, initial, jobs_tx, options);
            task.run(control_rx, done_rx);
        })?;

    Ok((thread, handle))
}

struct WatcherTask {
    classifier: Classifier,
    watch_set: WatchSet,
    jobs_tx: mpsc::Sender<RegenJob>,
    options: WatcherOptions,
    registered: BTreeSet<PathBuf>,
    cap_warned: bool,
    batch: Vec<PathBuf>,
    batch_started: Option<Instant>,
    pending: Option<RegenJob>,
    inflight: bool,
}

impl WatcherTask {
    fn new(
        classifier: Classifier,
        initial: WatchSet,
        jobs_tx: mpsc::Sender<RegenJob>,
        options: WatcherOptions,
    ) -> Self {
        Self {
            classifier,
            watch_set: initial,
            jobs_tx,
            options,
            registered: BTreeSet::new(),
            cap_warned: false,
            batch: Vec::new(),
            batch_started: None,
            pending: None,
            inflight: false,
        }
    }

    fn run(&mut self, control_rx: Receiver<WatcherControl>, done_rx: Receiver<()>) {
        let (fs_tx, fs_rx) = crossbeam_channel::unbounded();
        let mut watcher = match RecommendedWatcher::new(
            move |event: Result<notify::Event, notify::Error>| {
                let _ = fs_tx.send(event);
            },
            NotifyConfig::default().with_follow_symlinks(true),
        ) {
            Ok(w) => w,
            Err(err) => {
                warn!(target: "manifest.watch", ?err, "watcher_init_failed");
                return;
            }
        };
        self.apply_watch_set(&mut watcher);
        info!(
            target: "manifest.watch",
            files = self.watch_set.files.len(),
            directories = self.registered.len(),
            "watcher_started"
        );

        loop {
            let timeout = match self.batch_started {
                Some(start) => self.options.debounce.saturating_sub(start.elapsed()),
                None => Duration::from_secs(3600),
            };
            crossbeam_channel::select! {
                recv(fs_rx) -> msg => {
                    match msg {
                        Ok(Ok(event)) => self.ingest(event),
                        Ok(Err(err)) => {
                            // Transient kernel-side failure (e.g. inotify
                            // queue exhaustion). The next rebuild
                            // re-registers every directory.
                            warn!(target: "manifest.watch", ?err, "watch_event_error");
                        }
                        Err(_) => break,
                    }
                },
                recv(control_rx) -> msg => {
                    match msg {
                        Ok(WatcherControl::Rebuild(set)) => {
                            self.watch_set = set;
                            self.apply_watch_set(&mut watcher);
                        }
                        Ok(WatcherControl::Shutdown) | Err(_) => break,
                    }
                },
                recv(done_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    self.inflight = false;
                    if let Some(job) = self.pending.take() {
                        self.dispatch(job);
                    }
                },
                default(timeout) => {
                    if self
                        .batch_started
                        .is_some_and(|start| start.elapsed() >= self.options.debounce)
                    {
                        self.flush_batch();
                    }
                },
            }
        }
        debug!(target: "manifest.watch", "watcher_stopped");
    }

    fn ingest(&mut self, event: notify::Event) {
        for path in event.paths {
            if !self.classifier.is_relevant(&self.watch_set, &path) {
                trace!(target: "manifest.watch", path = %path.display(), "event_ignored");
                continue;
            }
            if !self.batch.contains(&path) {
                self.batch.push(path);
            }
            if self.batch_started.is_none() {
                self.batch_started = Some(Instant::now());
            }
        }
    }

    fn flush_batch(&mut self) {
        let files = std::mem::take(&mut self.batch);
        self.batch_started = None;
        if files.is_empty() {
            return;
        }
        let kind = self.classifier.classify(&self.watch_set, &files);
        debug!(
            target: "manifest.watch",
            kind = kind.as_str(),
            files = files.len(),
            "batch_classified"
        );
        if matches!(kind, ChangeKind::Unknown) {
            return;
        }
        self.dispatch(RegenJob::new(kind, files));
    }

    fn dispatch(&mut self, job: RegenJob) {
        if self.inflight {
            match &mut self.pending {
                Some(pending) => pending.absorb(job),
                None => self.pending = Some(job),
            }
            return;
        }
        match self.jobs_tx.blocking_send(job) {
            Ok(()) => self.inflight = true,
            Err(err) => {
                // Engine gone; nothing left to feed.
                debug!(target: "manifest.watch", ?err, "job_channel_closed");
            }
        }
    }

    fn apply_watch_set(&mut self, watcher: &mut RecommendedWatcher) {
        let wanted = self.watch_set.directories();

        for stale in self.registered.difference(&wanted).cloned().collect::<Vec<_>>() {
            let _ = watcher.unwatch(&stale);
            self.registered.remove(&stale);
        }

        for dir in wanted {
            if self.registered.contains(&dir) {
                continue;
            }
            if self.registered.len() >= self.options.max_watched {
                if !self.cap_warned {
                    warn!(
                        target: "manifest.watch",
                        cap = self.options.max_watched,
                        "watch_cap_reached_paths_skipped"
                    );
                    self.cap_warned = true;
                }
                break;
            }
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.registered.insert(dir);
                }
                Err(err) => {
                    // Re-attempted on the next rebuild.
                    warn!(
                        target: "manifest.watch",
                        dir = %dir.display(),
                        ?err,
                        "watch_add_failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serve_manifest::{InputSpec, Manifest, ManifestStore};
    use std::fs;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn classifier_for(root: &Path) -> Classifier {
        Classifier::new(
            root.to_path_buf(),
            Arc::new(ManifestStore::new(Manifest::default())),
            Arc::new(InputSpec::default()),
        )
    }

    async fn recv_job(rx: &mut mpsc::Receiver<RegenJob>) -> RegenJob {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("job within deadline")
            .expect("channel open")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn element_source_change_yields_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let file = src.join("my-card.ts");
        fs::write(&file, "export {}\n").unwrap();

        let (jobs_tx, mut jobs_rx) = mpsc::channel(4);
        let watch_set = WatchSet::new(BTreeSet::from([file.clone()]), BTreeSet::new());
        let (_thread, handle) = spawn(
            classifier_for(dir.path()),
            watch_set,
            jobs_tx,
            WatcherOptions::default(),
        )
        .unwrap();

        // Give the watcher a moment to register the directory.
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(&file, "export const x = 1\n").unwrap();

        let job = recv_job(&mut jobs_rx).await;
        assert_eq!(job.kind, ChangeKind::ElementSourceChanged);
        assert!(job.files.contains(&file));
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn burst_within_window_coalesces() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let a = src.join("a.ts");
        let b = src.join("b.ts");
        fs::write(&a, "export {}\n").unwrap();
        fs::write(&b, "export {}\n").unwrap();

        let (jobs_tx, mut jobs_rx) = mpsc::channel(4);
        let watch_set = WatchSet::new(
            BTreeSet::from([a.clone(), b.clone()]),
            BTreeSet::new(),
        );
        let (_thread, handle) = spawn(
            classifier_for(dir.path()),
            watch_set,
            jobs_tx,
            WatcherOptions {
                debounce: Duration::from_millis(150),
                ..WatcherOptions::default()
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(&a, "export const a = 1\n").unwrap();
        fs::write(&b, "export const b = 1\n").unwrap();

        let job = recv_job(&mut jobs_rx).await;
        assert_eq!(job.kind, ChangeKind::ElementSourceChanged);
        assert!(job.files.len() >= 2, "both edits land in one batch");

        // No second job without further edits and without job_done.
        handle.job_done();
        let extra = timeout(Duration::from_millis(400), jobs_rx.recv()).await;
        assert!(extra.is_err(), "burst produced a single job");
        handle.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unwatched_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let watched = src.join("card.ts");
        fs::write(&watched, "export {}\n").unwrap();
        let unwatched = src.join("notes.txt");

        let (jobs_tx, mut jobs_rx) = mpsc::channel(4);
        let watch_set = WatchSet::new(BTreeSet::from([watched]), BTreeSet::new());
        let (_thread, handle) = spawn(
            classifier_for(dir.path()),
            watch_set,
            jobs_tx,
            WatcherOptions::default(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::write(&unwatched, "scratch\n").unwrap();

        let got = timeout(Duration::from_millis(500), jobs_rx.recv()).await;
        assert!(got.is_err(), "txt file outside the set must not classify");
        handle.shutdown();
    }

    #[test]
    fn directories_deduplicate_parents() {
        let set = WatchSet::new(
            BTreeSet::from([
                PathBuf::from("/w/src/a.ts"),
                PathBuf::from("/w/src/b.ts"),
                PathBuf::from("/w/demo/index.html"),
            ]),
            BTreeSet::from([PathBuf::from("/w/cem.config.yaml")]),
        );
        assert_eq!(
            set.directories(),
            BTreeSet::from([
                PathBuf::from("/w/src"),
                PathBuf::from("/w/demo"),
                PathBuf::from("/w"),
            ])
        );
    }
}
