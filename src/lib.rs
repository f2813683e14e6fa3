pub mod builder;
pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod job;
pub mod lockfile;
pub mod manifest;
pub mod matrix;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod process;
pub mod publish;
pub mod report;
pub mod scheduler;
pub mod toolchain;
pub mod trigger;
pub mod validation;
pub mod version;

pub use error::{ErrorKind, PipelineError};
pub use manifest::PipelineManifest;
pub use matrix::{MatrixEntry, TargetMatrix};
pub use pipeline::{Backends, PipelineExecutor, RunSummary, build_pipeline};
pub use publish::artifact_name;
pub use version::VersionString;
