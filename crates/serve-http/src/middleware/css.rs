//! Pattern-gated CSS-to-module transform.
//!
//! A `.css` file inside the configured include set (and outside the exclude
//! set) is served as a JS module exporting a constructable stylesheet. Any
//! other `.css` request flows on to the static fallback and is served as
//! plain CSS.

use crate::middleware::ts::{
    file_mtime, if_none_match, not_modified, transform_error_response, transform_response,
    weak_etag,
};
use crate::paths::resolve_request_path;
use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::response::Response;
use serve_config::ConfigCell;
use serve_reload::ReloadHub;
use serve_transform::{
    css::to_stylesheet_module, TransformCache, TransformEntry, TransformError, TransformKey,
    TransformKind,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub struct CssTransform {
    pub root: PathBuf,
    pub config: Arc<ConfigCell>,
    pub cache: Arc<TransformCache>,
    pub hub: ReloadHub,
}

#[async_trait]
impl Middleware for CssTransform {
    fn name(&self) -> &'static str {
        "css"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let path = req.uri().path();
        if !path.ends_with(".css") {
            return next.run(req).await;
        }
        let Some(abs) = resolve_request_path(&self.root, path) else {
            return next.run(req).await;
        };
        if !self.config.load().css_transform_applies(&abs) || !abs.is_file() {
            return next.run(req).await;
        }
        let Ok(bytes) = tokio::fs::read(&abs).await else {
            return next.run(req).await;
        };

        let key = TransformKey::from_contents(&abs, TransformKind::Css, file_mtime(&abs), &bytes);
        let etag = weak_etag(key.content_hash);
        if if_none_match(req.headers(), &etag) {
            return not_modified(&etag);
        }

        let (result, cache_status) = match self.cache.get(&key) {
            Some(entry) => (Ok(entry), "hit"),
            None => {
                let abs = abs.clone();
                let produced = self
                    .cache
                    .produce(key, || async move { produce_css(&abs, bytes) })
                    .await;
                (produced, "miss")
            }
        };

        match result {
            Ok(entry) => transform_response(&entry, &etag, cache_status),
            Err(err) => {
                warn!(target: "transform.cache", path = %abs.display(), %err, "css_transform_failed");
                self.hub.broadcast(err.to_event());
                transform_error_response(&err)
            }
        }
    }
}

fn produce_css(path: &std::path::Path, bytes: Vec<u8>) -> Result<TransformEntry, TransformError> {
    let source = String::from_utf8(bytes).map_err(|_| TransformError::NotUtf8 {
        path: path.to_path_buf(),
    })?;
    Ok(to_stylesheet_module(path, &source))
}
