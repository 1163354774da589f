//! uvimage - reproducible container images for Python environments
//!
//! Normalizes a declarative environment spec, fingerprints it, resolves it
//! with uv into a pinned lock and builds it into an image tagged with the
//! fingerprint. An unchanged spec costs one cache lookup, never a rebuild.

pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod orchestration;
pub mod pipeline;
pub mod plan;
mod process;
pub mod registry;
pub mod resolver;
pub mod spec;
pub mod ui;

pub use error::{StageError, UvImageError, UvImageResult};
pub use pipeline::Pipeline;
