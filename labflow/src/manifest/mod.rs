//! Declarative pipeline manifests.
//!
//! A manifest enumerates the pipeline's parameters and stages. Stages are
//! immutable once the graph is built; all validation here is structural and
//! runs before anything executes.

mod pipeline;
mod resources;
mod stage;

pub use pipeline::{PipelineManifest, MANIFEST_FILE};
pub use resources::{parse_duration, parse_size_mb, ResourceSpec};
pub use stage::{
    expand_pattern, is_glob_pattern, InputSource, StageDecl, TEMPLATE_PLACEHOLDER,
};
