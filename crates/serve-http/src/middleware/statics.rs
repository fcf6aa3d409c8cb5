//! Static fallback: serve workspace files with correct MIME types.
//!
//! Last in the chain. Strong ETags for static assets; HTML additionally
//! gets `Cache-Control: no-cache` so edits show up on plain reloads even
//! without the reload client.

use crate::middleware::ts::{etag_value, if_none_match};
use crate::paths::resolve_request_path;
use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::Response;
use std::path::PathBuf;

pub struct StaticFiles {
    pub root: PathBuf,
}

#[async_trait]
impl Middleware for StaticFiles {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return next.run(req).await;
        }
        let Some(mut abs) = resolve_request_path(&self.root, req.uri().path()) else {
            return next.run(req).await;
        };
        if abs.is_dir() {
            abs = abs.join("index.html");
        }
        if !abs.is_file() {
            return next.run(req).await;
        }
        let Ok(bytes) = tokio::fs::read(&abs).await else {
            let mut res = Response::new(Body::from("read failed\n"));
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return res;
        };

        let etag = format!("\"{:016x}\"", seahash::hash(&bytes));
        if if_none_match(req.headers(), &etag) {
            let mut res = Response::new(Body::empty());
            *res.status_mut() = StatusCode::NOT_MODIFIED;
            res.headers_mut().insert(ETAG, etag_value(&etag));
            return res;
        }

        let mime = mime_guess::from_path(&abs).first_or_octet_stream();
        let is_html = mime.essence_str() == "text/html";

        let body = if req.method() == Method::HEAD {
            Body::empty()
        } else {
            Body::from(bytes)
        };
        let mut res = Response::new(body);
        if let Ok(value) = HeaderValue::try_from(mime.as_ref()) {
            res.headers_mut().insert(CONTENT_TYPE, value);
        }
        res.headers_mut().insert(ETAG, etag_value(&etag));
        if is_html {
            res.headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
        res
    }
}
