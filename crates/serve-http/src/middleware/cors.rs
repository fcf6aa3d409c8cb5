//! Permissive CORS for local development plus sniffing protection, applied
//! to every pipeline response.

use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::http::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, X_CONTENT_TYPE_OPTIONS};
use axum::response::Response;

pub struct Cors;

#[async_trait]
impl Middleware for Cors {
    fn name(&self) -> &'static str {
        "cors"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let mut res = next.run(req).await;
        let headers = res.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        res
    }
}
