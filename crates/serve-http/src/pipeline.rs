//! The middleware chain.
//!
//! A middleware is a plain struct with one method: handle the request or
//! call `next`. The chain order is a contract, fixed at construction:
//! log, CORS, import-map injection, TS transform, CSS transform, demo
//! render, static fallback. A transform middleware short-circuits exactly
//! when it matched the path; otherwise the request flows on.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub type Request = axum::http::Request<Body>;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, req: Request, next: Next<'_>) -> Response;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub async fn run(self, req: Request) -> Response {
        match self.rest.split_first() {
            Some((middleware, rest)) => middleware.handle(req, Next { rest }).await,
            None => (StatusCode::NOT_FOUND, "not found\n").into_response(),
        }
    }
}

pub struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(chain: Vec<Arc<dyn Middleware>>) -> Self {
        Self { chain }
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        Next { rest: &self.chain }.run(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tag(&'static str, Arc<Vec<AtomicUsize>>, usize);

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, req: Request, next: Next<'_>) -> Response {
            self.1[self.2].store(1, Ordering::SeqCst);
            next.run(req).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &'static str {
            "short"
        }

        async fn handle(&self, _req: Request, _next: Next<'_>) -> Response {
            (StatusCode::OK, "done").into_response()
        }
    }

    #[tokio::test]
    async fn chain_runs_in_order_until_short_circuit() {
        let hits = Arc::new(vec![AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)]);
        let pipeline = Pipeline::new(vec![
            Arc::new(Tag("a", hits.clone(), 0)),
            Arc::new(Tag("b", hits.clone(), 1)),
            Arc::new(ShortCircuit),
            Arc::new(Tag("after", hits.clone(), 2)),
        ]);
        let res = pipeline
            .dispatch(Request::new(Body::empty()))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(hits[0].load(Ordering::SeqCst), 1);
        assert_eq!(hits[1].load(Ordering::SeqCst), 1);
        assert_eq!(hits[2].load(Ordering::SeqCst), 0, "short circuit stops the chain");
    }

    #[tokio::test]
    async fn empty_chain_is_a_404() {
        let pipeline = Pipeline::new(vec![]);
        let res = pipeline.dispatch(Request::new(Body::empty())).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
