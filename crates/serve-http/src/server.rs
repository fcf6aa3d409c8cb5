//! HTTP frontend: router assembly, port binding, graceful shutdown.

use crate::debug;
use crate::middleware::{
    Cors, CssTransform, DemoRender, HtmlInject, RequestLog, StaticFiles, TsTransform,
};
use crate::pipeline::{Pipeline, Request};
use crate::ws;
use anyhow::{bail, Context};
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS,
};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serve_config::ConfigCell;
use serve_events::{ShutdownListener, ShutdownSignal};
use serve_importmap::{ImportMapCache, PackageJsonSource};
use serve_manifest::ManifestStore;
use serve_reload::ReloadHub;
use serve_transform::TransformCache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// How long in-flight requests get after shutdown is signalled.
const INFLIGHT_DRAIN: Duration = Duration::from_secs(5);

/// Shared state behind every route and pipeline member.
pub struct RouterCtx {
    pub root: PathBuf,
    pub config: Arc<ConfigCell>,
    pub store: Arc<ManifestStore>,
    pub cache: Arc<TransformCache>,
    pub import_maps: Arc<ImportMapCache<PackageJsonSource>>,
    pub hub: ReloadHub,
    pub shutdown: ShutdownSignal,
    pipeline: Pipeline,
}

impl RouterCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        config: Arc<ConfigCell>,
        store: Arc<ManifestStore>,
        cache: Arc<TransformCache>,
        import_maps: Arc<ImportMapCache<PackageJsonSource>>,
        hub: ReloadHub,
        shutdown: ShutdownSignal,
    ) -> Self {
        // The contract order: log, CORS, import-map injection, TS, CSS,
        // demo, static.
        let pipeline = Pipeline::new(vec![
            Arc::new(RequestLog),
            Arc::new(Cors),
            Arc::new(HtmlInject {
                root: root.clone(),
                config: config.clone(),
                import_maps: import_maps.clone(),
            }),
            Arc::new(TsTransform {
                root: root.clone(),
                config: config.clone(),
                cache: cache.clone(),
                hub: hub.clone(),
                shutdown: shutdown.clone(),
            }),
            Arc::new(CssTransform {
                root: root.clone(),
                config: config.clone(),
                cache: cache.clone(),
                hub: hub.clone(),
            }),
            Arc::new(DemoRender {
                root: root.clone(),
                config: config.clone(),
                store: store.clone(),
                hub: hub.clone(),
            }),
            Arc::new(StaticFiles { root: root.clone() }),
        ]);

        Self {
            root,
            config,
            store,
            cache,
            import_maps,
            hub,
            shutdown,
            pipeline,
        }
    }

    /// Run a request through the middleware chain. The fallback handler
    /// and the integration tests share this entry point.
    pub async fn dispatch(&self, req: Request) -> Response {
        self.pipeline.dispatch(req).await
    }
}

pub fn build_router(ctx: Arc<RouterCtx>) -> Router {
    Router::new()
        .route("/__cem-reload", get(ws::upgrade))
        .route("/__cem/{*asset}", get(asset_handler))
        .route("/__cem-debug", get(debug::handler))
        .fallback(pipeline_handler)
        .with_state(ctx)
}

async fn pipeline_handler(State(ctx): State<Arc<RouterCtx>>, req: Request) -> Response {
    ctx.dispatch(req).await
}

async fn asset_handler(
    AxumPath(asset): AxumPath<String>,
    State(ctx): State<Arc<RouterCtx>>,
) -> Response {
    let Some(asset) = serve_assets::lookup(&asset) else {
        let mut res = Response::new(Body::from("unknown asset\n"));
        *res.status_mut() = StatusCode::NOT_FOUND;
        return res;
    };

    // A user template directory may override any chrome asset by name.
    let body = match &ctx.config.load().template_dir {
        Some(dir) => match tokio::fs::read(dir.join(asset.path)).await {
            Ok(bytes) => Body::from(bytes),
            Err(_) => Body::from(asset.body),
        },
        None => Body::from(asset.body),
    };

    let mut res = Response::new(body);
    let headers = res.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(asset.content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    res
}

/// Bind `port`, probing upward on collision up to `port + ceiling`. A port
/// of 0 asks the OS for any free port. Returns the listener and the port
/// actually bound.
pub async fn bind_with_increment(port: u16, ceiling: u16) -> anyhow::Result<(TcpListener, u16)> {
    if port == 0 {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("binding OS-assigned port")?;
        let bound = listener.local_addr()?.port();
        return Ok((listener, bound));
    }

    let last = port.saturating_add(ceiling);
    for candidate in port..=last {
        match TcpListener::bind(("127.0.0.1", candidate)).await {
            Ok(listener) => return Ok((listener, candidate)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(target: "server.http", port = candidate, "port_in_use_trying_next");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("binding port {candidate}"));
            }
        }
    }
    bail!("every port from {port} through {last} is in use");
}

/// Run the server until shutdown. Stops accepting immediately on signal,
/// then gives in-flight requests [`INFLIGHT_DRAIN`] before returning.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: ShutdownListener,
) -> anyhow::Result<()> {
    let mut graceful_listener = shutdown.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        graceful_listener.wait().await;
    });

    let mut drain_listener = shutdown;
    tokio::select! {
        result = server => {
            result.context("http server")?;
        }
        _ = async {
            drain_listener.wait().await;
            tokio::time::sleep(INFLIGHT_DRAIN).await;
        } => {
            warn!(target: "server.http", "inflight_drain_deadline_hit");
        }
    }
    info!(target: "server.http", "server_stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_zero_binds_anything_free() {
        let (listener, port) = bind_with_increment(0, 0).await.unwrap();
        assert_ne!(port, 0);
        drop(listener);
    }

    #[tokio::test]
    async fn collision_increments_to_next_port() {
        let (held, held_port) = bind_with_increment(0, 0).await.unwrap();
        let (second, second_port) = bind_with_increment(held_port, 5).await.unwrap();
        assert_eq!(second_port, held_port + 1);
        drop(held);
        drop(second);
    }

    #[tokio::test]
    async fn exhausted_ceiling_is_an_error() {
        let (_held, held_port) = bind_with_increment(0, 0).await.unwrap();
        let err = bind_with_increment(held_port, 0).await.unwrap_err();
        assert!(err.to_string().contains("in use"));
    }
}
