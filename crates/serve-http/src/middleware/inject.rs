//! Import-map and reload-client injection into HTML responses.
//!
//! Runs early in the chain so it post-processes whatever a later
//! middleware produced, demo pages and static HTML alike. Non-HTML
//! responses pass through untouched.
//!
//! Only the `<head>` segment is ever buffered: chunks are collected from
//! the body stream until the closing head tag (or a small bound) is seen,
//! the rewriter runs over that prefix alone, and everything after it is
//! forwarded as-is without leaving the stream. A document whose head has
//! not closed within [`MAX_HEAD_SEGMENT`] is served unmodified.

use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use axum::response::Response;
use futures_util::stream::{self, StreamExt};
use lol_html::{element, HtmlRewriter, Settings};
use serve_config::ConfigCell;
use serve_importmap::{ImportMapCache, PackageJsonSource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on the buffered pre-`</head>` prefix. Real heads are a few
/// hundred bytes; anything beyond this is not a page we can inject into.
const MAX_HEAD_SEGMENT: usize = 64 * 1024;

pub const RELOAD_CLIENT_TAG: &str =
    r#"<script type="module" src="/__cem/reload.js"></script>"#;

pub struct HtmlInject {
    pub root: PathBuf,
    pub config: Arc<ConfigCell>,
    pub import_maps: Arc<ImportMapCache<PackageJsonSource>>,
}

#[async_trait]
impl Middleware for HtmlInject {
    fn name(&self) -> &'static str {
        "inject"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let res = next.run(req).await;
        if !is_html(&res) {
            return res;
        }

        let snippet = self.head_snippet();
        let (mut parts, body) = res.into_parts();
        // The body is about to change length; stale validators must not
        // survive.
        parts.headers.remove(CONTENT_LENGTH);
        parts.headers.remove(ETAG);
        Response::from_parts(parts, rewrite_head_segment(body, snippet).await)
    }
}

impl HtmlInject {
    fn head_snippet(&self) -> String {
        let mut snippet = String::new();
        match self.import_maps.get(&self.root) {
            Ok(map) => snippet.push_str(&map.script_tag()),
            Err(err) => {
                warn!(target: "importmap", ?err, "import_map_unavailable");
            }
        }
        if self.config.load().inject_reload_client {
            snippet.push_str(RELOAD_CLIENT_TAG);
        }
        snippet
    }
}

fn is_html(res: &Response) -> bool {
    res.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"))
}

/// Buffer the body stream up to just past `</head>`, rewrite that prefix,
/// and chain the untouched remainder of the stream behind it.
async fn rewrite_head_segment(body: Body, snippet: String) -> Body {
    let mut rest = body.into_data_stream();
    let mut raw: Vec<u8> = Vec::new();
    let mut pending_error = None;
    let mut saw_eof = false;

    let head_end = loop {
        if let Some(end) = find_head_close(&raw) {
            break Some(end);
        }
        if raw.len() >= MAX_HEAD_SEGMENT {
            break None;
        }
        match rest.next().await {
            Some(Ok(chunk)) => raw.extend_from_slice(&chunk),
            Some(Err(err)) => {
                pending_error = Some(err);
                break None;
            }
            None => {
                saw_eof = true;
                break None;
            }
        }
    };

    let buffered: Vec<Result<Bytes, axum::Error>> = match head_end {
        // The prefix ends on a complete end tag, so the rewriter never
        // sees a truncated token.
        Some(end) => {
            let tail = raw.split_off(end);
            vec![Ok(rewrite_prefix(raw, &snippet)), Ok(Bytes::from(tail))]
        }
        // Stream ended: the whole (short) document is the prefix.
        None if saw_eof => vec![Ok(rewrite_prefix(raw, &snippet))],
        // Head never closed within the bound, or the read failed mid-head.
        // Serve what was collected unmodified.
        None => {
            debug!(
                target: "server.http",
                buffered = raw.len(),
                "head_segment_unclosed_passing_through"
            );
            let mut items: Vec<Result<Bytes, axum::Error>> = vec![Ok(Bytes::from(raw))];
            if let Some(err) = pending_error {
                items.push(Err(err));
            }
            items
        }
    };

    Body::from_stream(stream::iter(buffered).chain(rest))
}

fn rewrite_prefix(prefix: Vec<u8>, snippet: &str) -> Bytes {
    match inject_into_head(&prefix, snippet) {
        Ok(rewritten) => Bytes::from(rewritten),
        Err(err) => {
            warn!(target: "server.http", ?err, "html_rewrite_failed_passing_through");
            Bytes::from(prefix)
        }
    }
}

/// Byte offset just past the `</head>` end tag, when present. ASCII
/// case-insensitive, as the tokenizer is.
fn find_head_close(haystack: &[u8]) -> Option<usize> {
    const NEEDLE: &[u8] = b"</head>";
    haystack
        .windows(NEEDLE.len())
        .position(|window| window.eq_ignore_ascii_case(NEEDLE))
        .map(|start| start + NEEDLE.len())
}

fn inject_into_head(html: &[u8], snippet: &str) -> Result<Vec<u8>, lol_html::errors::RewritingError> {
    let mut output = Vec::with_capacity(html.len() + snippet.len());
    let snippet = snippet.to_string();
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![element!("head", move |el| {
                el.prepend(&snippet, lol_html::html_content::ContentType::Html);
                Ok(())
            })],
            ..Settings::default()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(html)?;
    rewriter.end()?;
    Ok(output)
}
