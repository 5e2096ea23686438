//! Sandbox lifecycle and grain composition

pub mod attributes;
pub mod grain;
pub mod instance;
pub mod reclaim;

pub use attributes::{Attribute, Attributes};
pub use grain::Grain;
pub use instance::{DisposeReport, GrainFailure, Sandbox, SandboxId, SandboxState};
pub use reclaim::{reclaim_dir, reclaim_dir_with, DirRemover, FsRemover, ReclaimOutcome};
