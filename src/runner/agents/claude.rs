//! Claude Code adapter.
//!
//! Stdout is one terminal JSON result object. Tool calls come from the
//! session transcript whose file name is the session id, plus the
//! sub-agent transcripts filed under that session.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::payload;
use super::{
    write_json_config, AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext,
};
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::runner::env::{resolve_model, ComposedEnvironment, EnvSnapshot};
use crate::runner::locator::{sorted_files, unique_named_file, ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const PASS_THROUGH: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_AUTH_TOKEN",
    "ANTHROPIC_BASE_URL",
    "CLAUDE_CONFIG_DIR",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
];

/// Adapter for Claude Code.
pub struct ClaudeAdapter;

impl ClaudeAdapter {
    fn config_dir(snapshot: &EnvSnapshot) -> Option<PathBuf> {
        snapshot.dir_or_home("CLAUDE_CONFIG_DIR", ".claude")
    }

    /// Telemetry is on when an endpoint is set and the flag was not given.
    fn telemetry(snapshot: &EnvSnapshot) -> (Option<String>, Option<String>) {
        let endpoint = snapshot.get("OTEL_EXPORTER_OTLP_ENDPOINT").map(str::to_string);
        let flag = match snapshot.get("CLAUDE_CODE_ENABLE_TELEMETRY") {
            Some(flag) => Some(flag.to_string()),
            None if endpoint.is_some() => Some("1".to_string()),
            None => None,
        };
        (flag, endpoint)
    }

    /// Decodes the terminal result object. Tool calls are filled in later.
    fn decode_result(result: &Value) -> Result<RunStats, String> {
        let mut stats = RunStats::default();
        for (model, usage) in payload::object(result, "modelUsage")? {
            let input = payload::uint(usage, "inputTokens")?;
            let cache_read = payload::uint(usage, "cacheReadInputTokens")?;
            let cache_creation = payload::uint(usage, "cacheCreationInputTokens")?;
            let output = payload::uint(usage, "outputTokens")?;
            stats.add_usage(model.clone(), ModelUsage::summed(input + cache_read + cache_creation, output));
        }
        stats.llm_calls = Some(payload::uint(result, "num_turns")?);
        stats.total_cost = Some(payload::number(result, "total_cost_usd")?);
        Ok(stats.with_response(payload::opt_string(result, "result")?.map(str::to_string)))
    }

    /// Sub-agent transcripts stored next to the session as
    /// `<session_id>/subagents/agent-*.jsonl`.
    fn subagent_transcripts(session: &Path) -> Vec<PathBuf> {
        sorted_files(&session.with_extension("").join("subagents"), "agent-*.jsonl")
    }

    /// Counts `tool_use` items in assistant lines of a session transcript.
    fn count_tool_uses(lines: &[Value]) -> u64 {
        lines
            .iter()
            .filter(|line| payload::event_type(line) == Some("assistant"))
            .filter_map(|line| line.pointer("/message/content").and_then(Value::as_array))
            .flatten()
            .filter(|item| payload::event_type(item) == Some("tool_use"))
            .count() as u64
    }
}

#[async_trait]
impl AgentAdapter for ClaudeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.pass_through(&ctx.snapshot, PASS_THROUGH);
        let (flag, _) = Self::telemetry(&ctx.snapshot);
        env.set_opt("CLAUDE_CODE_ENABLE_TELEMETRY", flag.as_deref());
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let mut spec = ctx
            .command()
            .args(["-p", "--output-format", "json", "--dangerously-skip-permissions"]);
        let model = resolve_model(
            ctx.model_override(),
            &ctx.snapshot,
            "CLAUDE_CODE_MODEL",
            Some("ANTHROPIC_MODEL"),
        );
        if let Some(model) = model {
            spec = spec.arg("--model").arg(model);
        }
        Ok(Invocation::new(spec.arg(ctx.prompt())))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);

        let result = match payload::terminal_object(&outcome.stdout) {
            Ok(result) => result,
            Err(reason) => return Extraction::new(Err(fail(reason))),
        };
        let error_event = result.get("is_error").and_then(Value::as_bool) == Some(true);

        let (mut stats, failure) = match Self::decode_result(&result) {
            Ok(stats) => (stats, None),
            Err(reason) => {
                let response = payload::opt_string(&result, "result").ok().flatten();
                (RunStats::default().with_response(response.map(str::to_string)), Some(fail(reason)))
            }
        };
        let (flag, endpoint) = Self::telemetry(&ctx.snapshot);
        if flag.is_some() {
            stats.telemetry_log = endpoint;
        }

        let mut artifacts = RunArtifactSet::new();
        let mut trajectory = None;
        let session = payload::non_blank(&result, "session_id").and_then(|session_id| {
            let root = Self::config_dir(&ctx.snapshot)
                .ok_or_else(|| "home directory is not set".to_string())?
                .join("projects");
            let path = unique_named_file(&root, &format!("{}.jsonl", session_id), 2).map_err(|e| e.to_string())?;
            Ok((session_id, path))
        });
        match session {
            Ok((session_id, path)) => match payload::read_json_lines(&path) {
                Ok(lines) => {
                    debug!("Claude session {} at {}", session_id, path.display());
                    let mut tool_calls = Self::count_tool_uses(&lines);
                    let mut subagents = Vec::new();
                    for transcript in Self::subagent_transcripts(&path) {
                        match payload::read_json_lines(&transcript) {
                            Ok(sub_lines) => {
                                tool_calls += Self::count_tool_uses(&sub_lines);
                                artifacts.push(ArtifactKind::Session, &transcript, session_id.clone());
                                subagents.push(Value::Array(sub_lines));
                            }
                            Err(reason) => warn!("claude: {}", reason),
                        }
                    }
                    stats.tool_calls = Some(tool_calls);
                    artifacts.push(ArtifactKind::Session, &path, session_id);
                    let trace = if subagents.is_empty() {
                        Value::Array(lines)
                    } else {
                        json!({ "session": lines, "subagents": subagents })
                    };
                    trajectory = Some(TrajectorySource::from_file(&path, trace));
                }
                Err(reason) => warn!("claude: {}", reason),
            },
            Err(reason) => warn!("claude: session transcript unavailable: {}", reason),
        }

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(trajectory)
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@anthropic-ai/claude-code",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let Some(model) = snapshot.first_of(&["CLAUDE_CODE_MODEL", "ANTHROPIC_MODEL"]) else {
            return Ok(None);
        };
        let Some(dir) = Self::config_dir(snapshot) else {
            return Ok(None);
        };
        write_json_config(&dir.join("settings.json"), &json!({ "model": model })).map(Some)
    }
}
