//! Execution backends for Conveyor.
//!
//! - [`shell::ShellRunner`] and [`docker::DockerRunner`] run build commands
//! - [`git::GitSource`] fetches source revisions
//! - [`store`] holds the artifact store backends
//! - [`workspace::Workspace`] manages per-action scratch directories

pub mod docker;
pub mod git;
pub mod shell;
pub mod store;
pub mod workspace;

pub use conveyor_core::executor::{CommandOutcome, CommandRunner, CommandSpec, LogLine, LogStream};
pub use docker::DockerRunner;
pub use git::GitSource;
pub use shell::ShellRunner;
pub use store::{FsArtifactStore, MemoryArtifactStore};
pub use workspace::Workspace;
