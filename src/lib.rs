//! cakit: run coding-agent CLIs and extract normalized usage statistics.
//!
//! This library launches an agent CLI against one prompt, locates the
//! session, log or telemetry files that run produced, and reduces them to
//! a uniform result document with a strict exit-code verdict.

pub mod cli;
pub mod error;
pub mod runner;
pub mod storage;
pub mod trajectory;

// Re-export commonly used types
pub use error::{ArtifactError, EnvError, ExtractionFailed, InstallError, ProcessError, StoreError, UsageError};
pub use runner::{AgentKind, AgentRunner, RunRequest, RunResult};
