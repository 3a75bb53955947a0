//! Trajectory inputs and the rendered document.

use std::path::{Path, PathBuf};

use serde_json::Value;

/// Structured session data an adapter recovered for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectorySource {
    /// Artifact the data was read from, when it came from a file.
    pub path: Option<PathBuf>,
    /// Short description used when there is no path (e.g. an exported session).
    pub label: String,
    /// The decoded payload.
    pub value: Value,
}

impl TrajectorySource {
    /// Data read from an artifact file.
    pub fn from_file(path: impl Into<PathBuf>, value: Value) -> Self {
        let path = path.into();
        Self {
            label: path.display().to_string(),
            path: Some(path),
            value,
        }
    }

    /// Data produced by a command or query rather than read from one file.
    pub fn labelled(label: impl Into<String>, value: Value) -> Self {
        Self {
            path: None,
            label: label.into(),
            value,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// The human-readable trace written next to the raw output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrajectoryDocument {
    /// Where the content came from: an artifact path, a label or "raw output".
    pub source: String,
    /// Whether a structured artifact was converted.
    pub structured: bool,
    pub text: String,
}
