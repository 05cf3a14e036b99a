pub mod config;
pub mod error;
pub mod field_input;
pub mod gradient;
pub mod image;
pub mod matcher;
pub mod metadata;
pub mod orchestrator;
pub mod permutation;
pub mod phase_encoding;
pub mod plan;
pub mod qc;
pub mod recombine;
pub mod resolver;
pub mod slice_timing;
pub mod strategy;
pub mod timing;
pub mod tools;
pub mod types;

pub use config::{PreprocConfig, QcMode, ToolOptions};
pub use error::{DwiError, ErrorKind, Result};
pub use metadata::ImageMetadata;
pub use orchestrator::{
    read_metadata, resolve_run, CorrectionOrchestrator, ResolvedRun, RunReport, RunState,
};
pub use tools::{SubprocessRunner, ToolPaths, ToolRunner};
pub use types::*;
