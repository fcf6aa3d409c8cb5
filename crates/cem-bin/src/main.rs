//! cemserve entrypoint.
use anyhow::{Context, Result};
use clap::Parser;
use serve_config::{CliOverrides, ConfigCell, ServeConfig, PORT_PROBE_CEILING};
use serve_events::{RegenJob, ReloadEvent, ShutdownSignal, REGEN_CHANNEL_CAP};
use serve_http::RouterCtx;
use serve_importmap::{ImportMapCache, PackageJsonSource};
use serve_manifest::{CemFileGenerator, InputSpec, ManifestStore};
use serve_reload::ReloadHub;
use serve_transform::TransformCache;
use serve_watch::{
    first_generation, spawn_watcher, watch_set_for, Classifier, RegenEngine, WatcherHandle,
    WatcherOptions,
};
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "cemserve", version, about = "Custom-elements development server")]
struct Args {
    /// Workspace directory to serve (defaults to the current directory).
    pub directory: Option<PathBuf>,
    /// Port to bind; auto-increments when taken.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,
    /// Open the browser after the first successful bind.
    #[arg(long, short = 'o')]
    pub open: bool,
    /// Configuration file path (overrides discovery of `cem.config.yaml`).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// ECMAScript target for the TypeScript transform.
    #[arg(long)]
    pub target: Option<String>,
    /// Import-map override file.
    #[arg(long = "import-map")]
    pub import_map: Option<PathBuf>,
    /// Glob(s) of CSS files served as constructable-stylesheet modules.
    #[arg(long = "transform-css")]
    pub transform_css: Vec<String>,
    /// Disable reload-client injection.
    #[arg(long = "no-reload")]
    pub no_reload: bool,
    /// Directory of user chrome/knob templates.
    #[arg(long = "template-dir")]
    pub template_dir: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            port: self.port,
            open: self.open,
            target: self.target.clone(),
            import_map: self.import_map.clone(),
            transform_css: self.transform_css.clone(),
            no_reload: self.no_reload,
            template_dir: self.template_dir.clone(),
        }
    }
}

fn configure_logging() -> Option<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    match tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .try_init()
    {
        Ok(()) => Some(guard),
        Err(_) => {
            // A subscriber is already installed (tests); drop the guard so
            // the writer shuts down.
            None
        }
    }
}

/// A panic anywhere in the server is a crash of the whole dev loop, not
/// just one task: tell connected browsers the server is going away (their
/// reload clients drop into reconnect backoff instead of silently hanging)
/// and trip the cooperative shutdown before the default hook aborts or
/// unwinds. `ReloadHub::broadcast` never blocks, so it is safe from a
/// panicking thread.
fn install_crash_reporter(hub: ReloadHub, shutdown: ShutdownSignal) {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(move || {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info.location().map(|l| l.to_string());
            tracing::error!(
                target: "runtime.panic",
                thread = std::thread::current().name().unwrap_or("unnamed"),
                location = location.as_deref(),
                "panic_shutting_down"
            );
            hub.broadcast(ReloadEvent::Shutdown);
            shutdown.signal();
            default_hook(info);
        }));
    });
}

struct ServerRuntime {
    shutdown: ShutdownSignal,
    hub: ReloadHub,
    watcher: WatcherHandle,
    watcher_thread: Option<std::thread::JoinHandle<()>>,
    engine_task: Option<JoinHandle<()>>,
    broadcaster_task: Option<JoinHandle<()>>,
}

impl ServerRuntime {
    async fn finalize_shutdown(mut self) {
        info!(target: "runtime.shutdown", stage = "begin", "shutdown_stage");

        self.hub.shutdown().await;
        self.watcher.shutdown();
        self.shutdown.signal();

        if let Some(handle) = self.engine_task.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(target: "runtime.shutdown", ?err, "engine_join_failed"),
                Err(_) => warn!(target: "runtime.shutdown", "engine_join_timeout"),
            }
        }
        if let Some(handle) = self.broadcaster_task.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(target: "runtime.shutdown", ?err, "broadcaster_join_failed")
                }
                Err(_) => warn!(target: "runtime.shutdown", "broadcaster_join_timeout"),
            }
        }
        if let Some(thread) = self.watcher_thread.take() {
            let join = tokio::task::spawn_blocking(move || thread.join());
            match tokio::time::timeout(Duration::from_secs(2), join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(_) => error!(target: "runtime.shutdown", "watcher_join_failed"),
                Err(_) => warn!(target: "runtime.shutdown", "watcher_join_timeout"),
            }
        }

        info!(target: "runtime.shutdown", stage = "complete", "shutdown_stage");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = configure_logging();
    info!(target: "runtime", "startup");

    let args = Args::parse();
    let cli = args.overrides();

    let root = args
        .directory
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let root = root
        .canonicalize()
        .with_context(|| format!("workspace directory {}", root.display()))?;

    // Startup-fatal checks: invalid config and broken embedded assets.
    let (config_file, config_path) = serve_config::load_from(&root, args.config.clone())?;
    let config = serve_config::resolve(root.clone(), config_file, config_path, &cli)?;
    serve_assets::verify()
        .map_err(|asset| anyhow::anyhow!("embedded asset `{asset}` is empty"))?;

    run_server(root, config, cli).await
}

async fn run_server(root: PathBuf, config: ServeConfig, cli: CliOverrides) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let config_cell = Arc::new(ConfigCell::new(config));

    // Manifest bootstrap. A workspace without a manifest starts empty and
    // serves; the watcher picks up the first successful generation later.
    let input_spec = Arc::new(InputSpec::default());
    let generator = Arc::new(CemFileGenerator::new(input_spec.clone()));
    let manifest = first_generation(generator.as_ref(), &root);
    info!(
        target: "runtime.startup",
        elements = manifest.element_count(),
        modules = manifest.modules.len(),
        "manifest_ready"
    );
    let store = Arc::new(ManifestStore::new(manifest));

    let cache = Arc::new(TransformCache::default());
    let import_source = PackageJsonSource::new(
        config_cell.load().import_map_input.clone(),
        config_cell.load().import_map_generate,
    );
    let import_maps = Arc::new(ImportMapCache::new(import_source));

    // Reload hub + broadcaster. The crash reporter hangs off the hub so a
    // panic reaches connected clients before the process dies.
    let (hub, broadcaster) = ReloadHub::new(shutdown.listener());
    let broadcaster_task = tokio::spawn(broadcaster);
    install_crash_reporter(hub.clone(), shutdown.clone());

    // Watcher and regeneration engine.
    let (jobs_tx, jobs_rx) = mpsc::channel::<RegenJob>(REGEN_CHANNEL_CAP);
    let classifier = Classifier::new(root.clone(), store.clone(), input_spec);
    let initial_watch = {
        let snapshot = store.snapshot();
        watch_set_for(
            &root,
            &snapshot.indices.dependency_files,
            config_cell.load().config_path.as_deref(),
        )
    };
    let (watcher_thread, watcher) = spawn_watcher(
        classifier,
        initial_watch,
        jobs_tx,
        WatcherOptions {
            max_watched: config_cell.load().max_watched_files,
            ..WatcherOptions::default()
        },
    )?;
    let engine = RegenEngine::new(
        root.clone(),
        store.clone(),
        generator,
        cache.clone(),
        config_cell.clone(),
        cli,
        hub.intake(),
        watcher.clone(),
    );
    let engine_task = tokio::spawn(engine.run(jobs_rx, shutdown.listener()));

    // HTTP frontend.
    let ctx = Arc::new(RouterCtx::new(
        root.clone(),
        config_cell.clone(),
        store,
        cache,
        import_maps,
        hub.clone(),
        shutdown.clone(),
    ));
    let router = serve_http::build_router(ctx);

    let port = config_cell.load().port;
    let (listener, bound_port) = serve_http::bind_with_increment(port, PORT_PROBE_CEILING).await?;
    info!(target: "runtime", "serving at http://localhost:{bound_port}");

    if config_cell.load().open {
        let url = format!("http://localhost:{bound_port}");
        if let Err(err) = open::that_detached(&url) {
            warn!(target: "runtime", ?err, "browser_open_failed");
        }
    }

    spawn_signal_handler(shutdown.clone());
    // Drain the hub as soon as shutdown is signalled, while the server is
    // still finishing in-flight requests.
    {
        let hub = hub.clone();
        let mut signal_listener = shutdown.listener();
        tokio::spawn(async move {
            signal_listener.wait().await;
            hub.shutdown().await;
        });
    }

    let serve_result = serve_http::serve(listener, router, shutdown.listener()).await;

    let runtime = ServerRuntime {
        shutdown,
        hub,
        watcher,
        watcher_thread: Some(watcher_thread),
        engine_task: Some(engine_task),
        broadcaster_task: Some(broadcaster_task),
    };
    runtime.finalize_shutdown().await;
    serve_result
}

fn spawn_signal_handler(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    error!(target: "runtime", ?err, "sigterm_handler_failed");
                    let _ = ctrl_c.await;
                    shutdown.signal();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!(target: "runtime", signal = "SIGINT", "signal_received"),
                _ = sigterm.recv() => info!(target: "runtime", signal = "SIGTERM", "signal_received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!(target: "runtime", signal = "SIGINT", "signal_received");
        }
        shutdown.signal();
    });
}
