//! Concrete pipeline members, in contract order.

pub mod cors;
pub mod css;
pub mod demo;
pub mod inject;
pub mod log;
pub mod statics;
pub mod ts;

pub use cors::Cors;
pub use css::CssTransform;
pub use demo::DemoRender;
pub use inject::HtmlInject;
pub use log::{CacheStatus, RequestLog};
pub use statics::StaticFiles;
pub use ts::TsTransform;
