//! `/__cem-debug`: one JSON snapshot of everything worth pasting into a
//! bug report.

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderValue;
use axum::response::Response;
use serde_json::json;
use std::sync::Arc;

use crate::server::RouterCtx;

pub async fn handler(State(ctx): State<Arc<RouterCtx>>) -> Response {
    let snapshot = ctx.store.snapshot();
    let config = ctx.config.load();
    let cache = ctx.cache.stats();
    let import_map = ctx
        .import_maps
        .get(&ctx.root)
        .ok()
        .and_then(|m| serde_json::from_str::<serde_json::Value>(&m.to_json()).ok())
        .unwrap_or(serde_json::Value::Null);

    let body = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "watchDir": ctx.root.display().to_string(),
        "port": config.port,
        "esTarget": config.es_target.clone(),
        "reload": format!("{:?}", config.reload_mode).to_lowercase(),
        "knobs": {
            "enabled": config.knobs_enabled,
            "templates": config.knob_template_glob.clone(),
        },
        "cssTransform": {
            "include": config.css_include_patterns.clone(),
            "exclude": config.css_exclude_patterns.clone(),
        },
        "manifest": {
            "generation": snapshot.generation,
            "modules": snapshot.manifest.modules.len(),
            "elements": snapshot.manifest.element_count(),
            "demos": snapshot.indices.demos.len(),
            "watchedFiles": snapshot.indices.dependency_files.len(),
        },
        "transformCache": {
            "hits": cache.hits,
            "misses": cache.misses,
            "evictions": cache.evictions,
            "entries": cache.entries,
            "bytes": cache.bytes,
        },
        "importMap": import_map,
        "reloadClients": ctx.hub.client_count(),
    });

    let mut res = Response::new(axum::body::Body::from(body.to_string()));
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    res
}
