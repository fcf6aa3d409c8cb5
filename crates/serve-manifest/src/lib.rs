//! Custom Elements Manifest model, derived indices, and the swap store.

pub mod generate;
pub mod index;
pub mod model;
pub mod store;

pub use generate::{CemFileGenerator, InputSpec, ManifestGenerator, MANIFEST_FILE_NAME};
pub use index::{DemoEntry, Indices, TagDiff};
pub use model::{
    AttributeDecl, ControlKind, CssPartDecl, CssPropertyDecl, CssStateDecl, Declaration, DeclRef,
    DemoDecl, EventDecl, Manifest, ManifestModule, SlotDecl, TypeInfo,
};
pub use store::{ManifestNotice, ManifestSnapshot, ManifestStore};
