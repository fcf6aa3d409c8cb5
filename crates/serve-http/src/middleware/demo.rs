//! Demo route handling: canonical redirect, resolution, render.

use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use serve_config::ConfigCell;
use serve_demo::{parse_demo_path, parse_query, render_demo, render_not_found};
use serve_manifest::ManifestStore;
use serve_reload::ReloadHub;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub struct DemoRender {
    pub root: PathBuf,
    pub config: Arc<ConfigCell>,
    pub store: Arc<ManifestStore>,
    pub hub: ReloadHub,
}

#[async_trait]
impl Middleware for DemoRender {
    fn name(&self) -> &'static str {
        "demo"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let Some(route) = parse_demo_path(req.uri().path()) else {
            return next.run(req).await;
        };

        // Canonical form carries the trailing slash; redirect the rest.
        if !route.trailing_slash {
            let location = match req.uri().query() {
                Some(query) => format!("{}?{query}", route.canonical_path()),
                None => route.canonical_path(),
            };
            return redirect(&location);
        }

        let mut options = parse_query(req.uri().query().unwrap_or(""));
        let config = self.config.load();
        if !config.knobs_enabled {
            options.disable_all_knobs = true;
        }
        options.custom_knob_templates = serve_demo::load_knob_templates(
            &self.root,
            config.template_dir.as_deref(),
            config.knob_template_glob.as_deref(),
        );
        let snapshot = self.store.snapshot();

        match render_demo(&snapshot, &self.root, &route.tag, &route.slug, &options) {
            Ok(html) => html_response(StatusCode::OK, html),
            Err(err) if err.is_not_found() => {
                warn!(target: "demo.render", tag = route.tag.as_str(), slug = route.slug.as_str(), %err, "demo_not_found");
                html_response(
                    StatusCode::NOT_FOUND,
                    render_not_found(&snapshot, &route.tag, &route.slug),
                )
            }
            Err(err) => {
                warn!(target: "demo.render", %err, "demo_render_failed");
                self.hub.broadcast(err.to_event());
                let mut res = Response::new(Body::from(err.to_event().to_json()));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                res
            }
        }
    }
}

fn redirect(location: &str) -> Response {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::PERMANENT_REDIRECT;
    if let Ok(value) = HeaderValue::try_from(location) {
        res.headers_mut().insert(LOCATION, value);
    }
    res
}

fn html_response(status: StatusCode, html: String) -> Response {
    let mut res = Response::new(Body::from(html));
    *res.status_mut() = status;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    res.headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    res
}
