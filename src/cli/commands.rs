//! CLI command definitions for cakit.
//!
//! Every command prints JSON documents to stdout and returns the process
//! exit code; diagnostics go through `tracing` to stderr.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::runner::env::EnvSnapshot;
use crate::runner::{AgentKind, AgentRunner, InstallScope, RunRequest};

/// Run coding-agent CLIs and report normalized usage statistics.
#[derive(Parser, Debug)]
#[command(name = "cakit")]
#[command(about = "Run coding-agent CLIs and extract usage statistics")]
#[command(version)]
#[command(
    long_about = "cakit runs a coding-agent CLI headlessly against one prompt and prints a JSON result with per-model token usage, LLM and tool call counts, the final response and the run's exit code.\n\nExample usage:\n  cakit run codex \"fix the failing test\" --cwd ./repo"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run an agent against a prompt and print the result document.
    Run(RunArgs),

    /// Install an agent CLI (or all of them).
    Install(InstallArgs),

    /// Write agent-native configuration from environment variables.
    Configure(ConfigureArgs),
}

/// Arguments for `cakit run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Agent to run (claude, codex, gemini, ...).
    pub agent: AgentKind,

    /// Prompt text.
    pub prompt: String,

    /// Working directory for the agent.
    #[arg(long, default_value = ".")]
    pub cwd: PathBuf,

    /// Image file; repeatable, comma-separated values allowed.
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Video file; repeatable.
    #[arg(long = "video")]
    pub videos: Vec<String>,

    /// Model override.
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Reasoning effort (minimal, low, medium, high, xhigh).
    #[arg(long)]
    pub reasoning_effort: Option<String>,

    /// Extra environment file overlaid on the inherited environment.
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Deadline for the agent process, in seconds.
    #[arg(long, env = "CAKIT_RUN_TIMEOUT")]
    pub timeout: Option<u64>,
}

/// Arguments for `cakit install`.
#[derive(Parser, Debug)]
pub struct InstallArgs {
    /// Agent to install, or `all`.
    pub agent: AgentSelector,

    /// Version or tag to install.
    #[arg(long)]
    pub version: Option<String>,

    /// Install scope (user or global).
    #[arg(long, default_value = "user")]
    pub scope: InstallScope,
}

/// Arguments for `cakit configure`.
#[derive(Parser, Debug)]
pub struct ConfigureArgs {
    /// Agent to configure, or `all`.
    pub agent: AgentSelector,
}

/// One agent or every agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSelector {
    All,
    One(AgentKind),
}

impl AgentSelector {
    pub fn agents(&self) -> Vec<AgentKind> {
        match self {
            AgentSelector::All => AgentKind::ALL.to_vec(),
            AgentSelector::One(kind) => vec![*kind],
        }
    }
}

impl fmt::Display for AgentSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSelector::All => f.write_str("all"),
            AgentSelector::One(kind) => kind.fmt(f),
        }
    }
}

impl FromStr for AgentSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(AgentSelector::All);
        }
        s.parse().map(AgentSelector::One)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<i32> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns the exit code the process should terminate with.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    let runner = AgentRunner::new(EnvSnapshot::capture());
    match cli.command {
        Commands::Run(args) => run_agent_command(&runner, args).await,
        Commands::Install(args) => run_install_command(&runner, args).await,
        Commands::Configure(args) => run_configure_command(&runner, args),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_agent_command(runner: &AgentRunner, args: RunArgs) -> anyhow::Result<i32> {
    let request = build_request(args);
    let result = runner.run(request).await;
    info!(
        "{} finished: cakit_exit_code={} command_exit_code={:?}",
        result.agent, result.cakit_exit_code, result.command_exit_code
    );
    print_json(&result)?;
    Ok(result.cakit_exit_code)
}

fn build_request(args: RunArgs) -> RunRequest {
    // a missing directory is reported by validation
    let workdir = std::fs::canonicalize(&args.cwd).unwrap_or(args.cwd);
    RunRequest::new(args.agent, args.prompt, workdir)
        .with_model(args.model)
        .with_reasoning_effort(args.reasoning_effort)
        .with_images(args.images)
        .with_videos(args.videos)
        .with_env_file(args.env_file)
        .with_timeout(args.timeout.filter(|secs| *secs > 0).map(Duration::from_secs))
}

async fn run_install_command(runner: &AgentRunner, args: InstallArgs) -> anyhow::Result<i32> {
    let mut failed = 0usize;
    for kind in args.agent.agents() {
        let result = runner.install(kind, args.version.as_deref(), args.scope).await;
        if !result.ok {
            failed += 1;
        }
        print_json(&result)?;
    }
    info!("Install {}: {} failure(s)", args.agent, failed);
    Ok(if failed == 0 { 0 } else { 1 })
}

fn run_configure_command(runner: &AgentRunner, args: ConfigureArgs) -> anyhow::Result<i32> {
    let mut failed = 0usize;
    for kind in args.agent.agents() {
        let result = runner.configure(kind);
        if !result.ok {
            failed += 1;
        }
        print_json(&result)?;
    }
    Ok(if failed == 0 { 0 } else { 1 })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
