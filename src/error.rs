//! Error types for cakit operations.
//!
//! Each subsystem of the run engine owns one error enum:
//! - Input validation (rejected before any process is spawned)
//! - Environment composition
//! - Process launching
//! - Artifact extraction
//! - Structured store access
//! - Output and trajectory files

use std::path::PathBuf;

use thiserror::Error;

/// Malformed CLI input. Always reported with exit code 2.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("prompt is required")]
    EmptyPrompt,

    #[error("media file not found: {}", .0.display())]
    MediaNotFound(PathBuf),

    #[error("{subject} input is not supported by {display_name} CLI.")]
    UnsupportedMedia {
        subject: String,
        display_name: String,
    },

    #[error("invalid reasoning effort '{value}' (expected one of: {allowed})")]
    InvalidReasoningEffort { value: String, allowed: String },

    #[error("reasoning effort is not supported by {0} CLI.")]
    ReasoningEffortUnsupported(String),

    #[error("working directory does not exist: {}", .0.display())]
    MissingWorkdir(PathBuf),
}

impl UsageError {
    /// Exit code reported for every usage error.
    pub const EXIT_CODE: i32 = 2;
}

/// Configuration defects found while composing the child environment.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("missing required environment variable(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("{agent} OAuth is enabled but auth file not found at {}; run `{agent} login`.", path.display())]
    AuthMissing { agent: String, path: PathBuf },

    #[error("failed to read env file {}: {source}", path.display())]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare run directory: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the Process Runner that are not an exit code.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write stdin: {0}")]
    Stdin(std::io::Error),

    #[error("process wait failed: {0}")]
    Wait(std::io::Error),
}

/// The expected output shape was absent or malformed.
///
/// Carries the agent and a precise reason. The run result reports every
/// dependent stat as absent when this is produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{agent}: extraction failed: {reason}")]
pub struct ExtractionFailed {
    pub agent: String,
    pub reason: String,
}

impl ExtractionFailed {
    pub fn new(agent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            reason: reason.into(),
        }
    }
}

/// Errors reading a run's structured store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("unexpected store contents: {0}")]
    Shape(String),
}

/// Errors writing output or trajectory files.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output directory could not be resolved")]
    NoOutputDir,
}

/// Errors from install and configure operations.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{agent} does not support version selection")]
    VersionUnsupported { agent: String },

    #[error("{agent} has no release for platform {platform}")]
    UnsupportedPlatform { agent: String, platform: String },

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("failed to write config {}: {source}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config serialization error: {0}")]
    Serialize(String),

    #[error("environment error: {0}")]
    Env(#[from] EnvError),
}
