//! End-to-end pipeline flows against a real workspace on disk.

use axum::body::Body;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, ETAG, IF_NONE_MATCH, LOCATION,
};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serve_config::{resolve, CliOverrides, ConfigCell, ConfigFile};
use serve_events::ShutdownSignal;
use serve_http::RouterCtx;
use serve_importmap::{ImportMapCache, PackageJsonSource};
use serve_manifest::{CemFileGenerator, ManifestGenerator, ManifestStore};
use serve_reload::ReloadHub;
use serve_transform::TransformCache;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        root,
        "custom-elements.json",
        r##"{
            "schemaVersion": "1.0.0",
            "modules": [{
                "path": "src/my-card.ts",
                "declarations": [{
                    "kind": "class",
                    "name": "MyCard",
                    "customElement": true,
                    "tagName": "my-card",
                    "attributes": [
                        {"name": "variant", "type": {"text": "'flat' | 'raised'"}, "default": "'flat'"}
                    ],
                    "slots": [{"name": ""}],
                    "cssProperties": [{"name": "--card-bg", "default": "#fff"}]
                }]
            }]
        }"##,
    );
    write(
        root,
        "src/my-card.ts",
        "export class MyCard extends HTMLElement {\n  greet(name: string): string {\n    return `hi ${name}`;\n  }\n}\ncustomElements.define('my-card', MyCard);\n",
    );
    write(root, "src/my-card/demo/index.html", "<my-card>Hello</my-card>\n");
    write(root, "src/my-card/my-card.css", ":host { display: block }\n");
    write(root, "demo-shared/reset.css", "* { margin: 0 }\n");
    write(
        root,
        "index.html",
        "<html><head><title>workspace</title></head><body><my-card></my-card></body></html>\n",
    );
    write(
        root,
        "package.json",
        r#"{"name": "fixture", "dependencies": {"lit": "^3.0.0"}}"#,
    );
    write(
        root,
        "node_modules/lit/package.json",
        r#"{"name": "lit", "exports": {".": {"import": "./index.js"}}}"#,
    );
    write(root, "node_modules/lit/index.js", "export const html = () => {};\n");
    dir
}

fn ctx_for(root: &Path) -> (Arc<RouterCtx>, ShutdownSignal) {
    let config_file: ConfigFile = serde_yaml_from(
        r#"
serve:
  transforms:
    css:
      include: ["src/**/*.css"]
"#,
    );
    let config = resolve(
        root.to_path_buf(),
        config_file,
        None,
        &CliOverrides::default(),
    )
    .unwrap();

    let generator = CemFileGenerator::default();
    let manifest = generator.generate(root).unwrap();
    let store = Arc::new(ManifestStore::new(manifest));

    let shutdown = ShutdownSignal::new();
    let (hub, broadcaster) = ReloadHub::new(shutdown.listener());
    tokio::spawn(broadcaster);

    let ctx = RouterCtx::new(
        root.to_path_buf(),
        Arc::new(ConfigCell::new(config)),
        store,
        Arc::new(TransformCache::default()),
        Arc::new(ImportMapCache::new(PackageJsonSource::new(None, true))),
        hub,
        shutdown.clone(),
    );
    (Arc::new(ctx), shutdown)
}

fn serde_yaml_from(yaml: &str) -> ConfigFile {
    serde_yaml::from_str(yaml).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_string(res: Response) -> String {
    let bytes = axum::body::to_bytes(res.into_body(), 32 * 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn cold_start_serves_demo_page_with_injection() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/components/my-card/demo/index/")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
    let html = body_string(res).await;
    assert!(html.contains("<my-card>Hello</my-card>"));
    assert!(html.contains(r#"<script type="importmap">"#));
    assert!(html.contains(r#""lit":"/node_modules/lit/index.js""#));
    assert!(html.contains(r#"<script type="module" src="/__cem/reload.js"></script>"#));
}

#[tokio::test]
async fn ts_transform_serves_js_with_weak_etag() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/src/my-card.ts")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(CONTENT_TYPE).unwrap(),
        "application/javascript"
    );
    let etag = res.headers().get(ETAG).unwrap().to_str().unwrap().to_string();
    assert!(etag.starts_with("W/\""));
    let js = body_string(res).await;
    assert!(js.contains("class MyCard"));
    assert!(!js.contains(": string"), "types stripped");

    let revalidation = Request::builder()
        .uri("/src/my-card.ts")
        .header(IF_NONE_MATCH, etag.clone())
        .body(Body::empty())
        .unwrap();
    let res = ctx.dispatch(revalidation).await;
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn concurrent_ts_requests_share_one_result() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            let res = ctx.dispatch(get("/src/my-card.ts")).await;
            let etag = res
                .headers()
                .get(ETAG)
                .unwrap()
                .to_str()
                .unwrap()
                .to_string();
            (etag, body_string(res).await)
        }));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    let (first_etag, first_body) = &results[0];
    assert!(results
        .iter()
        .all(|(etag, body)| etag == first_etag && body == first_body));
    assert_eq!(ctx.cache.stats().entries, 1, "one cached transform");
}

#[tokio::test]
async fn css_include_set_serves_stylesheet_module() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/src/my-card/my-card.css")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(CONTENT_TYPE).unwrap(),
        "application/javascript"
    );
    let js = body_string(res).await;
    assert!(js.contains("new CSSStyleSheet()"));

    // Outside the include set: plain CSS from the static fallback.
    let res = ctx.dispatch(get("/demo-shared/reset.css")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "text/css");
    let css = body_string(res).await;
    assert!(css.contains("margin: 0"));
}

#[tokio::test]
async fn demo_route_without_slash_redirects_canonically() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx
        .dispatch(get("/components/my-card/demo/index?chrome=false"))
        .await;
    assert_eq!(res.status(), StatusCode::PERMANENT_REDIRECT);
    assert_eq!(
        res.headers().get(LOCATION).unwrap(),
        "/components/my-card/demo/index/?chrome=false"
    );
}

#[tokio::test]
async fn disabled_attribute_knobs_keep_other_families() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx
        .dispatch(get(
            "/components/my-card/demo/index/?disable-knobs%5B%5D=attributes",
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let html = body_string(res).await;
    assert!(!html.contains(r#"data-family="attributes""#));
    assert!(html.contains(r#"data-family="slots""#));
    assert!(html.contains(r#"data-family="css-properties""#));
}

#[tokio::test]
async fn unknown_demo_renders_developer_404_with_reload_client() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/components/my-card/demo/nope/")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let html = body_string(res).await;
    assert!(html.contains("No demo"));
    // Full document, so the injection middleware booted the reload client.
    assert!(html.contains("/__cem/reload.js"));
}

#[tokio::test]
async fn static_html_gets_injection_and_no_cache() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/")).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()
            .get(axum::http::header::CACHE_CONTROL)
            .unwrap(),
        "no-cache"
    );
    let html = body_string(res).await;
    assert!(html.contains(r#"<script type="importmap">"#));
    assert!(html.contains("workspace"));
}

#[tokio::test]
async fn path_traversal_is_rejected() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/../../etc/passwd")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_path_is_404_with_cors_headers() {
    let dir = workspace();
    let (ctx, _shutdown) = ctx_for(dir.path());

    let res = ctx.dispatch(get("/no/such/file.txt")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        res.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}
