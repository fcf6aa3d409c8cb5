//! Request logging. Pass-through: observes, never mutates.

use crate::pipeline::{Middleware, Next, Request};
use async_trait::async_trait;
use axum::response::Response;
use std::time::Instant;
use tracing::info;

/// Marker inserted into response extensions by the transform middlewares so
/// the log line can carry cache effectiveness.
#[derive(Debug, Clone, Copy)]
pub struct CacheStatus(pub &'static str);

pub struct RequestLog;

#[async_trait]
impl Middleware for RequestLog {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let started = Instant::now();

        let res = next.run(req).await;

        let cache = res
            .extensions()
            .get::<CacheStatus>()
            .map(|c| c.0)
            .unwrap_or("-");
        info!(
            target: "server.http",
            method = %method,
            path = path.as_str(),
            status = res.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            cache,
            "request"
        );
        res
    }
}
