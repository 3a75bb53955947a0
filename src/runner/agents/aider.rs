//! Aider adapter.
//!
//! Stats come from the analytics log aider writes with `--analytics-log`;
//! the final answer comes from the LLM history file.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::config::ReasoningEffort;
use crate::runner::env::{resolve_model, ComposedEnvironment, Requirements};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const ANALYTICS_LOG: &str = "analytics.jsonl";
const INPUT_HISTORY: &str = "input.history";
const CHAT_HISTORY: &str = "chat.history.md";
const LLM_HISTORY: &str = "llm.history.log";

const EFFORTS: [ReasoningEffort; 3] = [ReasoningEffort::Low, ReasoningEffort::Medium, ReasoningEffort::High];

pub struct AiderAdapter;

impl AiderAdapter {
    /// Litellm-style `provider/model`. A bare model is taken as OpenAI.
    fn normalize_model(model: &str) -> String {
        let model = model.trim();
        if model.contains('/') {
            return model.to_string();
        }
        if let Some((provider, name)) = model.split_once(':') {
            let (provider, name) = (provider.trim(), name.trim());
            if !provider.is_empty() && !name.is_empty() {
                return format!("{}/{}", provider, name);
            }
        }
        format!("openai/{}", model)
    }

    fn model(ctx: &RunContext) -> Option<String> {
        resolve_model(ctx.model_override(), &ctx.snapshot, "AIDER_MODEL", Some("OPENAI_DEFAULT_MODEL"))
            .map(|model| Self::normalize_model(&model))
    }

    fn decode(events: &[Value]) -> Result<RunStats, String> {
        let mut stats = RunStats::default();
        let mut llm_calls = 0;
        let mut tool_calls = 0;
        for event in events {
            let name = payload::non_blank(event, "event")?;
            if name.starts_with("command_") {
                tool_calls += 1;
            }
            if name != "message_send" {
                continue;
            }
            let properties = payload::get(event, "properties")?;
            stats.add_usage(
                payload::non_blank(properties, "main_model")?,
                ModelUsage::with_total(
                    payload::uint(properties, "prompt_tokens")?,
                    payload::uint(properties, "completion_tokens")?,
                    payload::uint(properties, "total_tokens")?,
                ),
            );
            if let Some(cost) = properties.get("total_cost").and_then(Value::as_f64) {
                stats.total_cost = Some(cost);
            }
            llm_calls += 1;
        }
        if llm_calls == 0 {
            return Err("analytics log has no message_send events".to_string());
        }
        stats.llm_calls = Some(llm_calls);
        stats.tool_calls = Some(tool_calls);
        Ok(stats)
    }

    /// Assistant text of the last `LLM RESPONSE` block.
    fn llm_history_response(text: &str) -> Option<String> {
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.iter().rposition(|line| line.starts_with("LLM RESPONSE "))? + 1;
        let mut reply = Vec::new();
        let mut capturing = false;
        for &line in &lines[start..] {
            if line.starts_with("TO LLM ") || line.starts_with("LLM RESPONSE ") {
                break;
            }
            if line == "ASSISTANT" {
                capturing = true;
            } else if let Some(rest) = line.strip_prefix("ASSISTANT ") {
                reply.push(rest);
                capturing = false;
            } else if capturing {
                reply.push(line);
            }
        }
        let text = reply.join("\n").trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    /// Reply after the last `#### ` user line of the markdown chat history.
    fn chat_history_response(text: &str) -> Option<String> {
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.iter().rposition(|line| line.starts_with("#### "))? + 1;
        let mut reply: Vec<&str> = Vec::new();
        for &line in &lines[start..] {
            if line.starts_with("#### ") {
                break;
            }
            if line.starts_with('>') {
                if reply.iter().any(|l| !l.trim().is_empty()) {
                    break;
                }
                continue;
            }
            if !line.starts_with("# aider chat started") {
                reply.push(line);
            }
        }
        let text = reply.join("\n").trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    fn response(scratch: &Path) -> Option<String> {
        let read = |name: &str| fs::read_to_string(scratch.join(name)).ok();
        read(LLM_HISTORY)
            .and_then(|text| Self::llm_history_response(&text))
            .or_else(|| read(CHAT_HISTORY).and_then(|text| Self::chat_history_response(&text)))
    }
}

#[async_trait]
impl AgentAdapter for AiderAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Aider
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: false,
            media: MediaStrategy::Native,
            reasoning_efforts: &EFFORTS,
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let model = Self::model(ctx);
        let mut req = Requirements::new();
        let api_key = req.require(
            ctx.snapshot.first_of(&["AIDER_OPENAI_API_KEY", "OPENAI_API_KEY"]),
            "AIDER_OPENAI_API_KEY (or OPENAI_API_KEY)",
        );
        req.require(model.as_deref(), "AIDER_MODEL (or OPENAI_DEFAULT_MODEL)");
        req.finish()?;

        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set_opt("AIDER_OPENAI_API_KEY", api_key).set_opt(
            "AIDER_OPENAI_API_BASE",
            ctx.snapshot.first_of(&["AIDER_OPENAI_API_BASE", "OPENAI_BASE_URL"]),
        );
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let model = Self::model(ctx).ok_or_else(|| EnvError::Missing(vec!["AIDER_MODEL".to_string()]))?;
        let path = |name: &str| ctx.scratch_path(name).display().to_string();
        let mut spec = ctx
            .command()
            .arg("--message")
            .arg(ctx.prompt())
            .arg("--model")
            .arg(model)
            .args(["--edit-format", "ask", "--no-git", "--yes-always"])
            .args(["--no-show-model-warnings", "--no-show-release-notes", "--no-check-update"])
            .args(["--no-fancy-input", "--no-suggest-shell-commands", "--no-pretty", "--no-stream"])
            .arg("--analytics-log")
            .arg(path(ANALYTICS_LOG))
            .arg("--no-analytics")
            .arg("--input-history-file")
            .arg(path(INPUT_HISTORY))
            .arg("--chat-history-file")
            .arg(path(CHAT_HISTORY))
            .arg("--llm-history-file")
            .arg(path(LLM_HISTORY));
        if let Some(effort) = ctx.reasoning_effort {
            spec = spec.arg("--reasoning-effort").arg(effort.as_str());
        }
        spec = spec.args(ctx.media.images.iter().map(|image| image.display().to_string()));
        Ok(Invocation::new(spec))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        _outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let analytics = ctx.scratch_path(ANALYTICS_LOG);
        let events = match payload::read_json_lines(&analytics) {
            Ok(events) => events,
            Err(reason) => return Extraction::new(Err(fail(reason))),
        };

        let mut artifacts = RunArtifactSet::new();
        artifacts.push(ArtifactKind::Telemetry, &analytics, ctx.run_id.to_string());
        let llm_history = ctx.scratch_path(LLM_HISTORY);
        if llm_history.is_file() {
            artifacts.push(ArtifactKind::Log, &llm_history, ctx.run_id.to_string());
        }
        let (stats, failure) = match Self::decode(&events) {
            Ok(stats) => (stats, None),
            Err(reason) => (RunStats::default(), Some(fail(reason))),
        };
        let mut stats = stats.with_response(Self::response(&ctx.scratch));
        stats.telemetry_log = Some(analytics.display().to_string());
        let trace = json!({ "analytics": events });

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::from_file(&analytics, trace)))
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::UvTool { package: "aider-chat" }
    }
}
