//! On-demand TypeScript transform.
//!
//! Matches `.ts`/`.tsx` workspace files (and monorepo-linked packages that
//! resolve back into the workspace); everything else flows to the next
//! middleware. Responses carry `Cache-Control: no-cache` plus a weak ETag
//! equal to the content hash, so an unchanged file costs a 304 instead of a
//! transform.

use crate::middleware::log::CacheStatus;
use crate::paths::resolve_request_path;
use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serve_config::ConfigCell;
use serve_events::ShutdownSignal;
use serve_reload::ReloadHub;
use serve_transform::{
    should_transform_dependency, ts::transpile, TransformCache, TransformEntry, TransformError,
    TransformKey, TransformKind,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

pub struct TsTransform {
    pub root: PathBuf,
    pub config: Arc<ConfigCell>,
    pub cache: Arc<TransformCache>,
    pub hub: ReloadHub,
    pub shutdown: ShutdownSignal,
}

#[async_trait]
impl Middleware for TsTransform {
    fn name(&self) -> &'static str {
        "ts"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let path = req.uri().path();
        if !(path.ends_with(".ts") || path.ends_with(".tsx")) {
            return next.run(req).await;
        }
        let Some(abs) = resolve_request_path(&self.root, path) else {
            return next.run(req).await;
        };
        if !abs.is_file() || !should_transform_dependency(&abs, &self.root) {
            return next.run(req).await;
        }
        let Ok(bytes) = tokio::fs::read(&abs).await else {
            return next.run(req).await;
        };
        let mtime = tokio::fs::metadata(&abs)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        let key = TransformKey::from_contents(&abs, TransformKind::Ts, mtime, &bytes);
        let etag = weak_etag(key.content_hash);
        if if_none_match(req.headers(), &etag) {
            return not_modified(&etag);
        }

        let (result, cache_status) = match self.cache.get(&key) {
            Some(entry) => (Ok(entry), "hit"),
            None => {
                let produced = self
                    .cache
                    .produce(key, || self.producer(abs.clone(), bytes))
                    .await;
                (produced, "miss")
            }
        };

        match result {
            Ok(entry) => transform_response(&entry, &etag, cache_status),
            Err(err) => {
                warn!(target: "transform.cache", path = %abs.display(), %err, "ts_transform_failed");
                self.hub.broadcast(err.to_event());
                transform_error_response(&err)
            }
        }
    }
}

impl TsTransform {
    async fn producer(
        &self,
        path: PathBuf,
        bytes: Vec<u8>,
    ) -> Result<TransformEntry, TransformError> {
        let source = String::from_utf8(bytes).map_err(|_| TransformError::NotUtf8 {
            path: path.clone(),
        })?;
        let target = self.config.load().es_target.clone();
        let mut shutdown = self.shutdown.listener();
        let task = tokio::task::spawn_blocking(move || transpile(&path, &source, &target));
        tokio::select! {
            biased;
            _ = shutdown.wait() => Err(TransformError::Canceled),
            joined = task => joined.map_err(|_| TransformError::Canceled)?,
        }
    }
}

pub(crate) fn weak_etag(content_hash: u64) -> String {
    format!("W/\"{content_hash:016x}\"")
}

pub(crate) fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|candidate| candidate.trim() == etag))
}

pub(crate) fn etag_value(etag: &str) -> axum::http::HeaderValue {
    // Etags here are quoted ASCII hex; try_from cannot fail on them.
    axum::http::HeaderValue::try_from(etag)
        .unwrap_or_else(|_| axum::http::HeaderValue::from_static("W/\"0\""))
}

pub(crate) fn not_modified(etag: &str) -> Response {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::NOT_MODIFIED;
    res.headers_mut().insert(ETAG, etag_value(etag));
    res.headers_mut()
        .insert(CACHE_CONTROL, axum::http::HeaderValue::from_static("no-cache"));
    res
}

pub(crate) fn transform_response(
    entry: &TransformEntry,
    etag: &str,
    cache_status: &'static str,
) -> Response {
    let mut res = Response::new(Body::from(entry.bytes.clone()));
    res.headers_mut().insert(
        CONTENT_TYPE,
        axum::http::HeaderValue::from_static(entry.content_type),
    );
    res.headers_mut()
        .insert(CACHE_CONTROL, axum::http::HeaderValue::from_static("no-cache"));
    res.headers_mut().insert(ETAG, etag_value(etag));
    res.extensions_mut().insert(CacheStatus(cache_status));
    res
}

/// 500 carrying the same structured payload the overlay receives.
pub(crate) fn transform_error_response(err: &TransformError) -> Response {
    let mut res = Response::new(Body::from(err.to_json()));
    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    res.headers_mut().insert(
        CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    res.extensions_mut().insert(CacheStatus("error"));
    res
}

// Shared by the CSS middleware.
pub(crate) fn file_mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use axum::response::IntoResponse;
    use serve_config::{resolve, CliOverrides, ConfigFile};
    use serve_events::ShutdownSignal;
    use std::fs;

    /// Terminal marker: reaching it means the middleware called `next`.
    struct FellThrough;

    #[async_trait]
    impl Middleware for FellThrough {
        fn name(&self) -> &'static str {
            "fell-through"
        }

        async fn handle(&self, _req: Request, _next: Next<'_>) -> Response {
            (StatusCode::IM_A_TEAPOT, "fell through").into_response()
        }
    }

    fn middleware_for(root: &Path) -> (TsTransform, ShutdownSignal) {
        let config = resolve(
            root.to_path_buf(),
            ConfigFile::default(),
            None,
            &CliOverrides::default(),
        )
        .unwrap();
        let shutdown = ShutdownSignal::new();
        let (hub, _broadcaster) = ReloadHub::new(shutdown.listener());
        let ts = TsTransform {
            root: root.to_path_buf(),
            config: Arc::new(ConfigCell::new(config)),
            cache: Arc::new(TransformCache::default()),
            hub,
            shutdown: shutdown.clone(),
        };
        (ts, shutdown)
    }

    fn pipeline(ts: TsTransform) -> Pipeline {
        Pipeline::new(vec![Arc::new(ts), Arc::new(FellThrough)])
    }

    fn get(path: &str) -> Request {
        axum::http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    fn workspace_with_source() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/my-card.ts"),
            "export const greet = (name: string): string => name;\n",
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn non_ts_paths_fall_through() {
        let dir = workspace_with_source();
        let (ts, _shutdown) = middleware_for(dir.path());
        let pipeline = pipeline(ts);
        for path in ["/src/app.js", "/index.html", "/src/my-card.css"] {
            let res = pipeline.dispatch(get(path)).await;
            assert_eq!(res.status(), StatusCode::IM_A_TEAPOT, "{path}");
        }
    }

    #[tokio::test]
    async fn missing_file_falls_through() {
        let dir = workspace_with_source();
        let (ts, _shutdown) = middleware_for(dir.path());
        let res = pipeline(ts).dispatch(get("/src/ghost.ts")).await;
        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn plain_dependency_sources_fall_through() {
        let dir = workspace_with_source();
        let dep = dir.path().join("node_modules/lit/decorators.ts");
        fs::create_dir_all(dep.parent().unwrap()).unwrap();
        fs::write(&dep, "export const x: number = 1;\n").unwrap();

        let (ts, _shutdown) = middleware_for(dir.path());
        let res = pipeline(ts)
            .dispatch(get("/node_modules/lit/decorators.ts"))
            .await;
        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn workspace_source_transforms_with_cache_status() {
        let dir = workspace_with_source();
        let (ts, _shutdown) = middleware_for(dir.path());
        let pipeline = pipeline(ts);

        let first = pipeline.dispatch(get("/src/my-card.ts")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            first.headers().get(CONTENT_TYPE).unwrap(),
            "application/javascript"
        );
        assert_eq!(first.headers().get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(first.extensions().get::<CacheStatus>().unwrap().0, "miss");
        let etag = first.headers().get(ETAG).unwrap().to_str().unwrap();
        assert!(etag.starts_with("W/\""));

        let second = pipeline.dispatch(get("/src/my-card.ts")).await;
        assert_eq!(second.extensions().get::<CacheStatus>().unwrap().0, "hit");
    }

    #[tokio::test]
    async fn matching_if_none_match_short_circuits_to_304() {
        let dir = workspace_with_source();
        let (ts, _shutdown) = middleware_for(dir.path());
        let pipeline = pipeline(ts);

        let first = pipeline.dispatch(get("/src/my-card.ts")).await;
        let etag = first
            .headers()
            .get(ETAG)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let revalidation = axum::http::Request::builder()
            .uri("/src/my-card.ts")
            .header(IF_NONE_MATCH, etag)
            .body(Body::empty())
            .unwrap();
        let res = pipeline.dispatch(revalidation).await;
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert!(res.headers().get(ETAG).is_some());
    }

    #[tokio::test]
    async fn shutdown_cancels_cold_transform() {
        let dir = workspace_with_source();
        let (ts, shutdown) = middleware_for(dir.path());
        shutdown.signal();

        let res = pipeline(ts).dispatch(get("/src/my-card.ts")).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.extensions().get::<CacheStatus>().unwrap().0, "error");
        let body = axum::body::to_bytes(res.into_body(), 64 * 1024).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["type"], "error");
        assert!(payload["message"].as_str().unwrap().contains("canceled"));
    }

    #[test]
    fn weak_etag_shape() {
        assert_eq!(weak_etag(0xabc), "W/\"0000000000000abc\"");
    }

    #[test]
    fn if_none_match_handles_candidate_lists() {
        let mut headers = HeaderMap::new();
        let etag = weak_etag(7);
        headers.insert(
            IF_NONE_MATCH,
            format!("\"other\", {etag}").parse().unwrap(),
        );
        assert!(if_none_match(&headers, &etag));
        assert!(!if_none_match(&headers, &weak_etag(8)));
        assert!(!if_none_match(&HeaderMap::new(), &etag));
    }

    #[test]
    fn not_modified_carries_validator() {
        let res = not_modified("W/\"1\"");
        assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(res.headers().get(ETAG).unwrap(), "W/\"1\"");
    }
}
