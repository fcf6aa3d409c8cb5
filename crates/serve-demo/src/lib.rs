//! Demo routing and server-side knob rendering.

pub mod error;
pub mod fragment;
pub mod knobs;
pub mod label;
pub mod render;
pub mod route;
pub mod templates;

pub use error::DemoError;
pub use fragment::{scan_instances, ElementInstance};
pub use label::instance_label;
pub use render::{render_demo, render_not_found, CHROME_SCRIPT_URL, CHROME_STYLE_URL};
pub use route::{parse_demo_path, parse_query, DemoRoute, KnobFamily, RenderOptions};
pub use templates::load_knob_templates;
