//! Configuration for agent runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::agents::AgentKind;
use super::env::EnvSnapshot;
use crate::error::UsageError;

/// Default directory for raw output and trajectory files, relative to home.
pub const DEFAULT_OUTPUT_SUBDIR: &str = ".cache/cakit";

/// Reasoning effort level forwarded to agents that accept one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub const ALL: [ReasoningEffort; 5] = [
        ReasoningEffort::Minimal,
        ReasoningEffort::Low,
        ReasoningEffort::Medium,
        ReasoningEffort::High,
        ReasoningEffort::Xhigh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }

    /// Comma-separated list used in error messages.
    pub fn joined(levels: &[ReasoningEffort]) -> String {
        levels
            .iter()
            .map(ReasoningEffort::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningEffort {
    type Err = UsageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == normalized)
            .ok_or_else(|| UsageError::InvalidReasoningEffort {
                value: s.to_string(),
                allowed: Self::joined(&Self::ALL),
            })
    }
}

/// Immutable input to one run.
///
/// Values are kept as the user supplied them. Validation happens in the
/// executor so that rejected input still produces a result document.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Agent to run.
    pub agent: AgentKind,
    /// Prompt text.
    pub prompt: String,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Explicit model override.
    pub model: Option<String>,
    /// Raw reasoning effort value.
    pub reasoning_effort: Option<String>,
    /// Image arguments (repeatable, possibly comma-separated).
    pub images: Vec<String>,
    /// Video arguments.
    pub videos: Vec<String>,
    /// Extra env file overlaid on the inherited environment.
    pub env_file: Option<PathBuf>,
    /// Deadline for the agent process.
    pub timeout: Option<Duration>,
}

impl RunRequest {
    /// Creates a request with no optional inputs.
    pub fn new(agent: AgentKind, prompt: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            prompt: prompt.into(),
            workdir: workdir.into(),
            model: None,
            reasoning_effort: None,
            images: Vec::new(),
            videos: Vec::new(),
            env_file: None,
            timeout: None,
        }
    }

    /// Sets the model override. Blank values are ignored.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: Option<String>) -> Self {
        self.reasoning_effort = effort;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_videos(mut self, videos: Vec<String>) -> Self {
        self.videos = videos;
        self
    }

    pub fn with_env_file(mut self, path: Option<PathBuf>) -> Self {
        self.env_file = path;
        self
    }

    /// Sets the deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parses the reasoning effort, if any.
    pub fn parsed_reasoning_effort(&self) -> Result<Option<ReasoningEffort>, UsageError> {
        match self.reasoning_effort.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => value.parse().map(Some),
        }
    }
}

/// Where `install` places agent binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallScope {
    /// Under the user-scope npm prefix or tool directories.
    #[default]
    User,
    /// System-wide.
    Global,
}

impl fmt::Display for InstallScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallScope::User => f.write_str("user"),
            InstallScope::Global => f.write_str("global"),
        }
    }
}

impl FromStr for InstallScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(InstallScope::User),
            "global" => Ok(InstallScope::Global),
            other => Err(format!("Unknown install scope: {} (expected user or global)", other)),
        }
    }
}

/// Engine-level settings shared by every run of one invocation.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Directory receiving `{agent}-{stamp}-{run8}.log` files.
    pub output_dir: PathBuf,
    /// Keep per-run scratch directories after the run.
    pub keep_scratch: bool,
}

impl EngineSettings {
    /// Resolves settings from `CAKIT_OUTPUT_DIR` or the default location.
    pub fn from_env(snapshot: &EnvSnapshot) -> Self {
        let output_dir = match snapshot.get("CAKIT_OUTPUT_DIR") {
            Some(dir) => snapshot.expand(dir),
            None => snapshot
                .home()
                .map(|home| home.join(DEFAULT_OUTPUT_SUBDIR))
                .unwrap_or_else(|| std::env::temp_dir().join("cakit")),
        };
        Self {
            output_dir,
            keep_scratch: snapshot.flag("CAKIT_KEEP_SCRATCH"),
        }
    }

    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasoning_effort_parse() {
        assert_eq!("HIGH".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::High);
        assert_eq!(" xhigh ".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::Xhigh);
        let err = "extreme".parse::<ReasoningEffort>().unwrap_err();
        assert_eq!(
            err,
            UsageError::InvalidReasoningEffort {
                value: "extreme".to_string(),
                allowed: "minimal, low, medium, high, xhigh".to_string(),
            }
        );
    }

    #[test]
    fn test_run_request_builder() {
        let request = RunRequest::new(AgentKind::Codex, "fix the bug", "/tmp/work")
            .with_model(Some("  ".to_string()))
            .with_reasoning_effort(Some("low".to_string()))
            .with_timeout(Some(Duration::from_secs(30)));

        assert!(request.model.is_none());
        assert_eq!(
            request.parsed_reasoning_effort().unwrap(),
            Some(ReasoningEffort::Low)
        );
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_engine_settings_output_dir() {
        let snap = EnvSnapshot::from_pairs([("HOME", "/home/u")]);
        let settings = EngineSettings::from_env(&snap);
        assert_eq!(settings.output_dir, PathBuf::from("/home/u/.cache/cakit"));
        assert!(!settings.keep_scratch);

        let snap = EnvSnapshot::from_pairs([("HOME", "/home/u"), ("CAKIT_OUTPUT_DIR", "~/runs")]);
        let settings = EngineSettings::from_env(&snap);
        assert_eq!(settings.output_dir, PathBuf::from("/home/u/runs"));
    }
}
