//! Agent adapters for the supported coding-agent CLIs.
//!
//! Each adapter knows how to:
//! 1. Compose the child environment from its variable whitelist
//! 2. Build the command line, injecting media the way the agent takes it
//! 3. Locate the run's artifacts and decode its documented output schema
//! 4. Install and configure the agent

pub mod aider;
pub mod auggie;
pub mod claude;
pub mod codebuddy;
pub mod codex;
pub mod continue_cli;
pub mod copilot;
pub mod crush;
pub mod factory;
pub mod gemini;
pub mod goose;
pub mod kilocode;
pub mod opencode;
pub mod openclaw;
pub mod openhands;
pub mod payload;
pub mod qoder;
pub mod qwen;
pub mod swe_agent;
pub mod trae_cn;
pub mod trae_oss;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::{ReasoningEffort, RunRequest};
use super::env::{ComposedEnvironment, EnvSnapshot};
use super::locator::RunArtifactSet;
use super::media::MediaSet;
use super::process::{ProcessOutcome, ProcessSpec};
use super::result::RunStats;
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::trajectory::TrajectorySource;

pub use aider::AiderAdapter;
pub use auggie::AuggieAdapter;
pub use claude::ClaudeAdapter;
pub use codebuddy::CodebuddyAdapter;
pub use codex::CodexAdapter;
pub use continue_cli::ContinueAdapter;
pub use copilot::CopilotAdapter;
pub use crush::CrushAdapter;
pub use factory::FactoryAdapter;
pub use gemini::GeminiAdapter;
pub use goose::GooseAdapter;
pub use kilocode::KilocodeAdapter;
pub use opencode::OpencodeAdapter;
pub use openclaw::OpenclawAdapter;
pub use openhands::OpenhandsAdapter;
pub use qoder::QoderAdapter;
pub use qwen::QwenAdapter;
pub use swe_agent::SweAgentAdapter;
pub use trae_cn::TraeCnAdapter;
pub use trae_oss::TraeOssAdapter;

/// Supported agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    Qwen,
    Crush,
    Goose,
    Opencode,
    Openhands,
    SweAgent,
    Copilot,
    Aider,
    Auggie,
    Codebuddy,
    Factory,
    Qoder,
    Continue,
    Kilocode,
    Openclaw,
    TraeCn,
    TraeOss,
}

impl AgentKind {
    /// Every agent, in a stable order.
    pub const ALL: [AgentKind; 20] = [
        AgentKind::Claude,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::Qwen,
        AgentKind::Crush,
        AgentKind::Goose,
        AgentKind::Opencode,
        AgentKind::Openhands,
        AgentKind::SweAgent,
        AgentKind::Copilot,
        AgentKind::Aider,
        AgentKind::Auggie,
        AgentKind::Codebuddy,
        AgentKind::Factory,
        AgentKind::Qoder,
        AgentKind::Continue,
        AgentKind::Kilocode,
        AgentKind::Openclaw,
        AgentKind::TraeCn,
        AgentKind::TraeOss,
    ];

    /// Identifier used on the command line and in result documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::Qwen => "qwen",
            AgentKind::Crush => "crush",
            AgentKind::Goose => "goose",
            AgentKind::Opencode => "opencode",
            AgentKind::Openhands => "openhands",
            AgentKind::SweAgent => "swe-agent",
            AgentKind::Copilot => "copilot",
            AgentKind::Aider => "aider",
            AgentKind::Auggie => "auggie",
            AgentKind::Codebuddy => "codebuddy",
            AgentKind::Factory => "factory",
            AgentKind::Qoder => "qoder",
            AgentKind::Continue => "continue",
            AgentKind::Kilocode => "kilocode",
            AgentKind::Openclaw => "openclaw",
            AgentKind::TraeCn => "trae-cn",
            AgentKind::TraeOss => "trae-oss",
        }
    }

    /// Returns the display name used in user-facing messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::Claude => "Anthropic Claude Code",
            AgentKind::Codex => "OpenAI Codex",
            AgentKind::Gemini => "Google Gemini CLI",
            AgentKind::Qwen => "Qwen Code",
            AgentKind::Crush => "Crush",
            AgentKind::Goose => "Goose CLI",
            AgentKind::Opencode => "OpenCode",
            AgentKind::Openhands => "OpenHands",
            AgentKind::SweAgent => "SWE-agent",
            AgentKind::Copilot => "GitHub Copilot CLI",
            AgentKind::Aider => "Aider",
            AgentKind::Auggie => "Auggie",
            AgentKind::Codebuddy => "CodeBuddy Code",
            AgentKind::Factory => "Factory Droid CLI",
            AgentKind::Qoder => "Qoder",
            AgentKind::Continue => "Continue",
            AgentKind::Kilocode => "Kilo Code",
            AgentKind::Openclaw => "OpenClaw",
            AgentKind::TraeCn => "Trae CLI (CN)",
            AgentKind::TraeOss => "Trae Agent (OSS)",
        }
    }

    /// Executable name.
    pub fn binary(&self) -> &'static str {
        match self {
            AgentKind::SweAgent => "sweagent",
            AgentKind::Factory => "droid",
            AgentKind::Qoder => "qodercli",
            AgentKind::Continue => "cn",
            AgentKind::TraeCn => "traecli",
            AgentKind::TraeOss => "trae-cli",
            other => other.as_str(),
        }
    }

    /// Variable holding an explicit executable path, e.g. `CAKIT_SWE_AGENT_BIN`.
    pub fn bin_env_var(&self) -> String {
        format!("CAKIT_{}_BIN", self.as_str().to_uppercase().replace('-', "_"))
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        match normalized.as_str() {
            "sweagent" => Ok(AgentKind::SweAgent),
            "claude-code" => Ok(AgentKind::Claude),
            other => AgentKind::ALL
                .iter()
                .copied()
                .find(|kind| kind.as_str() == other)
                .ok_or_else(|| format!("Unknown agent: {}", s)),
        }
    }
}

/// How an agent accepts media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaStrategy {
    /// Media is not accepted.
    Unsupported,
    /// Passed through a command-line flag or positional argument.
    Native,
    /// Copied under the working directory and referenced as `@{path}`.
    Symbolic,
    /// Named in a natural-language preamble along with the tool to open it.
    Natural { tool: &'static str },
}

/// What an agent accepts beyond a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub images: bool,
    pub videos: bool,
    pub media: MediaStrategy,
    pub reasoning_efforts: &'static [ReasoningEffort],
}

impl Capabilities {
    /// Prompt only.
    pub const PROMPT_ONLY: Capabilities = Capabilities {
        images: false,
        videos: false,
        media: MediaStrategy::Unsupported,
        reasoning_efforts: &[],
    };
}

/// Everything an adapter needs to know about one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub request: RunRequest,
    pub run_id: Uuid,
    /// Engine-owned per-run directory, removed after the run.
    pub scratch: PathBuf,
    /// Resolved executable, or the bare binary name.
    pub binary: PathBuf,
    pub media: MediaSet,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub snapshot: EnvSnapshot,
}

impl RunContext {
    pub fn workdir(&self) -> &Path {
        &self.request.workdir
    }

    pub fn prompt(&self) -> &str {
        &self.request.prompt
    }

    pub fn model_override(&self) -> Option<&str> {
        self.request.model.as_deref()
    }

    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch.join(name)
    }

    /// A process spec for the agent binary in the working directory.
    pub fn command(&self) -> ProcessSpec {
        ProcessSpec::new(&self.binary, self.workdir())
    }
}

/// The command line for one run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub spec: ProcessSpec,
    /// Commands that must succeed before `spec` starts, run in order.
    pub setup: Vec<ProcessSpec>,
    /// Copies of media made for this run.
    pub staged_media: Vec<PathBuf>,
}

impl Invocation {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            setup: Vec::new(),
            staged_media: Vec::new(),
        }
    }

    pub fn with_setup(mut self, step: ProcessSpec) -> Self {
        self.setup.push(step);
        self
    }

    pub fn with_staged_media(mut self, staged: Vec<PathBuf>) -> Self {
        self.staged_media = staged;
        self
    }
}

/// What an adapter decoded from a run.
///
/// `stats` holds every field that decoded, even when `failure` is set.
/// Fields that did not decode stay absent.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub stats: RunStats,
    pub failure: Option<ExtractionFailed>,
    pub artifacts: RunArtifactSet,
    pub trajectory: Option<TrajectorySource>,
    /// The output carried an explicit error event.
    pub error_event: bool,
}

impl Extraction {
    /// All-or-nothing decode; a failure leaves every stat absent.
    pub fn new(stats: Result<RunStats, ExtractionFailed>) -> Self {
        match stats {
            Ok(stats) => Self::partial(stats, None),
            Err(failure) => Self::partial(RunStats::default(), Some(failure)),
        }
    }

    /// Fields decoded independently, with the first failure if any.
    pub fn partial(stats: RunStats, failure: Option<ExtractionFailed>) -> Self {
        Self {
            stats,
            failure,
            artifacts: RunArtifactSet::new(),
            trajectory: None,
            error_event: false,
        }
    }

    /// The stats when every field decoded.
    pub fn result(&self) -> Result<RunStats, ExtractionFailed> {
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(self.stats.clone()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: RunArtifactSet) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_trajectory(mut self, trajectory: Option<TrajectorySource>) -> Self {
        self.trajectory = trajectory;
        self
    }

    pub fn with_error_event(mut self, error_event: bool) -> Self {
        self.error_event = error_event;
        self
    }
}

/// How an agent binary is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    /// `npm install -g [--prefix P] package[@version]`.
    Npm { package: &'static str },
    /// `uv tool install package[==version] --python 3.12`.
    UvTool { package: &'static str },
    /// `python -m pip install` of a versioned source archive.
    Pip {
        url_template: &'static str,
        default_version: &'static str,
    },
    /// Installer script piped to bash.
    Script {
        url: &'static str,
        version_env: Option<&'static str>,
    },
    /// Release tarball unpacked under `~/.local/share/cakit/<agent>/v<version>`
    /// with `entry` linked into `~/.local/bin`.
    ///
    /// `url_template` takes `{version}`, `{os}` and `{arch}`; without an
    /// explicit version the latest one is read from `latest_url`.
    Archive {
        latest_url: &'static str,
        url_template: &'static str,
        entry: &'static str,
    },
}

impl InstallPlan {
    pub fn supports_version(&self) -> bool {
        !matches!(self, InstallPlan::Script { version_env: None, .. })
    }
}

/// Trait for agent adapters.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Returns the agent kind.
    fn kind(&self) -> AgentKind;

    /// Returns the media and reasoning options the agent accepts.
    fn capabilities(&self) -> Capabilities {
        Capabilities::PROMPT_ONLY
    }

    /// Builds the child environment from the agent's whitelist.
    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError>;

    /// Builds the command line.
    fn build_command(&self, ctx: &RunContext, env: &ComposedEnvironment) -> Result<Invocation, EnvError>;

    /// Locates the run's artifacts and decodes its stats.
    async fn extract_stats(
        &self,
        ctx: &RunContext,
        env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction;

    /// Returns how the agent is installed.
    fn install_plan(&self) -> InstallPlan;

    /// Writes agent-native configuration. `None` when nothing was written.
    fn configure(&self, _snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        Ok(None)
    }

    /// Arguments that print the agent version.
    fn version_args(&self) -> Vec<String> {
        vec!["--version".to_string()]
    }

    /// Whether a successful run must leave a trajectory artifact.
    fn requires_trajectory(&self) -> bool {
        false
    }
}

/// Creates an adapter for the given agent.
pub fn create_adapter(kind: AgentKind) -> Box<dyn AgentAdapter> {
    match kind {
        AgentKind::Claude => Box::new(ClaudeAdapter),
        AgentKind::Codex => Box::new(CodexAdapter),
        AgentKind::Gemini => Box::new(GeminiAdapter),
        AgentKind::Qwen => Box::new(QwenAdapter),
        AgentKind::Crush => Box::new(CrushAdapter),
        AgentKind::Goose => Box::new(GooseAdapter),
        AgentKind::Opencode => Box::new(OpencodeAdapter),
        AgentKind::Openhands => Box::new(OpenhandsAdapter),
        AgentKind::SweAgent => Box::new(SweAgentAdapter),
        AgentKind::Copilot => Box::new(CopilotAdapter),
        AgentKind::Aider => Box::new(AiderAdapter),
        AgentKind::Auggie => Box::new(AuggieAdapter),
        AgentKind::Codebuddy => Box::new(CodebuddyAdapter),
        AgentKind::Factory => Box::new(FactoryAdapter),
        AgentKind::Qoder => Box::new(QoderAdapter),
        AgentKind::Continue => Box::new(ContinueAdapter),
        AgentKind::Kilocode => Box::new(KilocodeAdapter),
        AgentKind::Openclaw => Box::new(OpenclawAdapter),
        AgentKind::TraeCn => Box::new(TraeCnAdapter),
        AgentKind::TraeOss => Box::new(TraeOssAdapter),
    }
}

/// Builds the prompt for symbolic or natural media strategies.
///
/// Returns the prompt to send and any staged copies.
pub fn media_prompt(ctx: &RunContext, strategy: MediaStrategy) -> Result<(String, Vec<PathBuf>), EnvError> {
    use super::media::{natural_prompt, stage_media, symbolic_prompt};

    if ctx.media.is_empty() {
        return Ok((ctx.prompt().to_string(), Vec::new()));
    }
    match strategy {
        MediaStrategy::Symbolic => {
            let staged = stage_media(ctx.workdir(), &ctx.media.all())?;
            Ok((symbolic_prompt(ctx.prompt(), ctx.workdir(), &staged), staged))
        }
        MediaStrategy::Natural { tool } => Ok((natural_prompt(ctx.prompt(), tool, &ctx.media), Vec::new())),
        MediaStrategy::Native | MediaStrategy::Unsupported => Ok((ctx.prompt().to_string(), Vec::new())),
    }
}

/// Writes a configuration file, creating parent directories.
pub fn write_config(path: &Path, contents: &str) -> Result<PathBuf, InstallError> {
    let to_err = |source| InstallError::Config {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    std::fs::write(path, contents).map_err(to_err)?;
    Ok(path.to_path_buf())
}

/// Serializes a JSON config with two-space indentation.
pub fn write_json_config(path: &Path, value: &serde_json::Value) -> Result<PathBuf, InstallError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| InstallError::Serialize(e.to_string()))?;
    write_config(path, &format!("{}\n", text))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_round_trip_names() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
            assert_eq!(create_adapter(kind).kind(), kind);
        }
        assert_eq!("SWE_AGENT".parse::<AgentKind>().unwrap(), AgentKind::SweAgent);
        assert_eq!("trae_oss".parse::<AgentKind>().unwrap(), AgentKind::TraeOss);
        assert!("cursor".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_binary_and_env_var() {
        assert_eq!(AgentKind::SweAgent.binary(), "sweagent");
        assert_eq!(AgentKind::Factory.binary(), "droid");
        assert_eq!(AgentKind::Qoder.binary(), "qodercli");
        assert_eq!(AgentKind::Continue.binary(), "cn");
        assert_eq!(AgentKind::TraeCn.binary(), "traecli");
        assert_eq!(AgentKind::TraeCn.bin_env_var(), "CAKIT_TRAE_CN_BIN");
        assert_eq!(AgentKind::SweAgent.bin_env_var(), "CAKIT_SWE_AGENT_BIN");
        assert_eq!(AgentKind::Claude.bin_env_var(), "CAKIT_CLAUDE_BIN");
    }

    #[test]
    fn test_install_plan_version_support() {
        assert!(InstallPlan::Npm { package: "x" }.supports_version());
        assert!(!InstallPlan::Script {
            url: "https://example.invalid/install.sh",
            version_env: None
        }
        .supports_version());
    }

    #[test]
    fn test_media_prompt_symbolic_stages_files() {
        let work = tempfile::TempDir::new().unwrap();
        let scratch = tempfile::TempDir::new().unwrap();
        let image = work.path().join("shot.png");
        std::fs::write(&image, "png").unwrap();

        let mut ctx = testing::context(AgentKind::Gemini, work.path(), scratch.path(), &[]);
        ctx.media.images.push(image);
        let (prompt, staged) = media_prompt(&ctx, MediaStrategy::Symbolic).unwrap();
        assert_eq!(prompt, "@{.cakit-media/00-shot.png}\n\nfix the tests");
        assert_eq!(staged.len(), 1);
    }
}
