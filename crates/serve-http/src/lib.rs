//! HTTP frontend: the middleware pipeline, WebSocket endpoint, embedded
//! asset routes, and server lifecycle.

pub mod debug;
pub mod middleware;
pub mod paths;
pub mod pipeline;
pub mod server;
pub mod ws;

pub use pipeline::{Middleware, Next, Pipeline, Request};
pub use server::{bind_with_increment, build_router, serve, RouterCtx};
