//! OpenClaw adapter.
//!
//! Every run onboards a private `OPENCLAW_HOME` under scratch with the
//! custom OpenAI-compatible provider, then runs the local `main` agent with
//! a fixed session id. The final JSON document carries usage and the model;
//! the session transcript carries call counts.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::config::ReasoningEffort;
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::{ProcessOutcome, ProcessSpec};
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const AGENT_ID: &str = "main";

static UNSAFE_PROVIDER_CHARS: OnceLock<Option<Regex>> = OnceLock::new();

/// Provider settings passed to `openclaw onboard`.
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    api_key: String,
    base_url: String,
    model_id: String,
    provider_id: Option<String>,
}

impl Settings {
    fn resolve(snapshot: &EnvSnapshot, model_override: Option<&str>) -> Result<Self, EnvError> {
        let model_ref = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| snapshot.get("CAKIT_OPENCLAW_MODEL"));
        let (model_id, model_provider) = match model_ref.map(|m| m.split_once('/')) {
            Some(Some((provider, id))) => (Some(id.trim()).filter(|id| !id.is_empty()), provider_id(provider)),
            Some(None) => (model_ref, None),
            None => (None, None),
        };

        let mut req = Requirements::new();
        let api_key = req.require(snapshot.get("CAKIT_OPENCLAW_API_KEY"), "CAKIT_OPENCLAW_API_KEY");
        let base_url = req.require(snapshot.get("CAKIT_OPENCLAW_BASE_URL"), "CAKIT_OPENCLAW_BASE_URL");
        let model_id = req.require(model_id, "CAKIT_OPENCLAW_MODEL");
        req.finish()?;

        match (api_key, base_url, model_id) {
            (Some(api_key), Some(base_url), Some(model_id)) => Ok(Self {
                api_key: api_key.to_string(),
                base_url: base_url.to_string(),
                model_id: model_id.to_string(),
                provider_id: snapshot
                    .get("CAKIT_OPENCLAW_PROVIDER_ID")
                    .and_then(provider_id)
                    .or(model_provider),
            }),
            _ => Err(EnvError::Missing(vec!["CAKIT_OPENCLAW_API_KEY".to_string()])),
        }
    }

    fn onboard(&self, ctx: &RunContext) -> ProcessSpec {
        let spec = ctx
            .command()
            .args(["onboard", "--non-interactive", "--accept-risk", "--mode", "local"])
            .args(["--auth-choice", "custom-api-key"])
            .arg("--custom-base-url")
            .arg(self.base_url.as_str())
            .arg("--custom-model-id")
            .arg(self.model_id.as_str())
            .arg("--custom-api-key")
            .arg(self.api_key.as_str())
            .args(["--skip-channels", "--skip-skills", "--skip-health", "--skip-ui", "--skip-daemon", "--json"]);
        match &self.provider_id {
            Some(id) => spec.arg("--custom-provider-id").arg(id.as_str()),
            None => spec,
        }
    }
}

/// Lowercased, with runs of characters outside `[a-z0-9._-]` turned into `-`.
fn provider_id(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    let cleaned = match payload::cached_regex(&UNSAFE_PROVIDER_CHARS, r"[^a-z0-9._-]+") {
        Some(re) => re.replace_all(&lowered, "-").into_owned(),
        None => lowered,
    };
    let cleaned = cleaned.trim_matches('-');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

pub struct OpenclawAdapter;

impl OpenclawAdapter {
    fn home(ctx: &RunContext) -> PathBuf {
        ctx.scratch_path("openclaw")
    }

    fn session_id(ctx: &RunContext) -> String {
        format!("cakit-{}", ctx.run_id.simple())
    }

    fn transcript_path(home: &Path, session_id: &str) -> PathBuf {
        home.join(".openclaw")
            .join("agents")
            .join(AGENT_ID)
            .join("sessions")
            .join(format!("{}.jsonl", session_id))
    }

    /// Last non-blank `payloads[].text`.
    fn response(result: &Value) -> Result<Option<String>, String> {
        let mut last = None;
        for item in payload::array(result, "payloads")? {
            if let Some(text) = payload::opt_string(item, "text")?.map(str::trim).filter(|t| !t.is_empty()) {
                last = Some(text.to_string());
            }
        }
        Ok(last)
    }

    /// Aggregate usage from `meta.agentMeta`, keyed `provider/model`.
    fn decode_usage(result: &Value) -> Result<RunStats, String> {
        let meta = payload::at(result, &["meta", "agentMeta"])?;
        let model = format!("{}/{}", payload::non_blank(meta, "provider")?, payload::non_blank(meta, "model")?);
        let usage = payload::get(meta, "usage")?;
        let optional = |key: &str| match usage.get(key) {
            None | Some(Value::Null) => Ok(0),
            Some(_) => payload::uint(usage, key),
        };
        let prompt = payload::uint(usage, "input")? + optional("cacheRead")? + optional("cacheWrite")?;
        let completion = payload::uint(usage, "output")?;
        let usage = match usage.get("total") {
            None | Some(Value::Null) => ModelUsage::summed(prompt, completion),
            Some(_) => ModelUsage::with_total(prompt, completion, payload::uint(usage, "total")?),
        };
        let mut stats = RunStats::default();
        stats.add_usage(model, usage);
        Ok(stats)
    }

    /// LLM calls are assistant messages with usage; tool calls are `toolCall` blocks.
    fn decode_transcript(records: &[Value]) -> Result<(u64, u64), String> {
        let mut llm_calls = 0;
        let mut tool_calls = 0;
        for record in records {
            let Some(message) = record.get("message") else {
                continue;
            };
            if payload::string(message, "role")? != "assistant" {
                continue;
            }
            if let Some(usage) = message.get("usage").filter(|u| !u.is_null()) {
                payload::uint(usage, "input")?;
                payload::uint(usage, "output")?;
                llm_calls += 1;
            }
            if let Some(Value::Array(blocks)) = message.get("content") {
                tool_calls += blocks
                    .iter()
                    .filter(|block| payload::event_type(block) == Some("toolCall"))
                    .count() as u64;
            }
        }
        if llm_calls == 0 {
            return Err("transcript has no assistant usage".to_string());
        }
        Ok((llm_calls, tool_calls))
    }
}

#[async_trait]
impl AgentAdapter for OpenclawAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Openclaw
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: false,
            videos: false,
            media: MediaStrategy::Unsupported,
            reasoning_efforts: &[
                ReasoningEffort::Minimal,
                ReasoningEffort::Low,
                ReasoningEffort::Medium,
                ReasoningEffort::High,
            ],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let settings = Settings::resolve(&ctx.snapshot, ctx.model_override())?;
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set("OPENAI_API_KEY", settings.api_key)
            .set("OPENCLAW_HOME", Self::home(ctx).display().to_string());
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let settings = Settings::resolve(&ctx.snapshot, ctx.model_override())?;
        std::fs::create_dir_all(Self::home(ctx))?;
        let mut spec = ctx
            .command()
            .args(["agent", "--local", "--agent", AGENT_ID, "--session-id"])
            .arg(Self::session_id(ctx))
            .arg("--message")
            .arg(ctx.prompt())
            .arg("--json");
        if let Some(effort) = ctx.reasoning_effort {
            spec = spec.arg("--thinking").arg(effort.as_str());
        }
        Ok(Invocation::new(spec).with_setup(settings.onboard(ctx)))
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

        let mut failure = None;
        let response = Self::response(&result).unwrap_or_else(|reason| {
            failure.get_or_insert(fail(reason));
            None
        });
        let mut stats = Self::decode_usage(&result).unwrap_or_else(|reason| {
            failure.get_or_insert(fail(reason));
            RunStats::default()
        });
        stats.response = response;

        let mut artifacts = RunArtifactSet::new();
        let session_id = Self::session_id(ctx);
        let path = Self::transcript_path(&Self::home(ctx), &session_id);
        let mut trajectory = TrajectorySource::labelled("openclaw result", result);
        match payload::read_json_lines(&path) {
            Ok(records) => {
                artifacts.push(ArtifactKind::Session, &path, session_id.as_str());
                match Self::decode_transcript(&records) {
                    Ok((llm_calls, tool_calls)) => {
                        stats.llm_calls = Some(llm_calls);
                        stats.tool_calls = Some(tool_calls);
                    }
                    Err(reason) => {
                        failure.get_or_insert(fail(reason));
                    }
                }
                trajectory = TrajectorySource::from_file(&path, Value::Array(records));
            }
            Err(reason) => {
                warn!("openclaw: {}", reason);
                failure.get_or_insert(fail(reason));
            }
        }

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(Some(trajectory))
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm { package: "openclaw" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use std::fs;
    use tempfile::TempDir;

    const VARS: [(&str, &str); 3] = [
        ("CAKIT_OPENCLAW_API_KEY", "sk-oc"),
        ("CAKIT_OPENCLAW_BASE_URL", "https://llm.internal/v1"),
        ("CAKIT_OPENCLAW_MODEL", "Kimi Labs/kimi-k2"),
    ];

    const RESULT: &str = r#"{"payloads":[{"text":"Looking."},{"text":"Fixed the failing test."},{"mediaUrl":"x"}],
"meta":{"durationMs":1200,"agentMeta":{"sessionId":"s","provider":"kimi-labs","model":"kimi-k2",
"usage":{"input":1000,"output":150,"cacheRead":200,"total":1350}}}}"#;

    const TRANSCRIPT: &str = r#"{"type":"session","id":"s"}
{"type":"message","message":{"role":"user","content":[{"type":"text","text":"fix"}]}}
{"type":"message","message":{"role":"assistant","content":[{"type":"toolCall","id":"a"},{"type":"toolCall","id":"b"}],"usage":{"input":500,"output":100}}}
{"type":"message","message":{"role":"toolResult","content":[{"type":"text","text":"ok"}]}}
{"type":"message","message":{"role":"assistant","content":[{"type":"text","text":"Fixed"}],"usage":{"input":700,"output":50}}}
"#;

    #[test]
    fn test_settings_from_model_reference() {
        let snap = EnvSnapshot::from_pairs(VARS);
        let settings = Settings::resolve(&snap, None).unwrap();
        assert_eq!(settings.model_id, "kimi-k2");
        assert_eq!(settings.provider_id.as_deref(), Some("kimi-labs"));

        let snap = EnvSnapshot::from_pairs([("CAKIT_OPENCLAW_API_KEY", "sk")]);
        match Settings::resolve(&snap, None) {
            Err(EnvError::Missing(names)) => assert_eq!(names, vec!["CAKIT_OPENCLAW_BASE_URL", "CAKIT_OPENCLAW_MODEL"]),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(provider_id("--"), None);
    }

    #[test]
    fn test_build_command_onboards_first() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut ctx = context(AgentKind::Openclaw, work.path(), scratch.path(), &VARS);
        ctx.reasoning_effort = Some(ReasoningEffort::High);
        let env = OpenclawAdapter.compose_environment(&ctx).unwrap();
        assert_eq!(env.get("OPENCLAW_HOME"), Some(scratch.path().join("openclaw").to_str().unwrap()));

        let invocation = OpenclawAdapter.build_command(&ctx, &env).unwrap();
        assert_eq!(invocation.setup.len(), 1);
        let onboard = &invocation.setup[0].args;
        assert_eq!(&onboard[..2], ["onboard", "--non-interactive"]);
        assert_eq!(&onboard[onboard.len() - 2..], ["--custom-provider-id", "kimi-labs"]);
        let args = invocation.spec.args;
        let session_id = OpenclawAdapter::session_id(&ctx);
        assert_eq!(args[..6], ["agent", "--local", "--agent", "main", "--session-id", session_id.as_str()]);
        assert_eq!(args[args.len() - 2..], ["--thinking", "high"]);
    }

    #[test]
    fn test_decode_usage_and_response() {
        let result: Value = serde_json::from_str(RESULT).unwrap();
        let stats = OpenclawAdapter::decode_usage(&result).unwrap();
        let usage = stats.models_usage["kimi-labs/kimi-k2"];
        assert_eq!(usage.prompt_tokens, 1200);
        assert_eq!(usage.completion_tokens, 150);
        assert_eq!(usage.total_tokens, 1350);
        assert_eq!(
            OpenclawAdapter::response(&result).unwrap().as_deref(),
            Some("Fixed the failing test.")
        );
    }

    #[tokio::test]
    async fn test_extract_counts_from_transcript() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = context(AgentKind::Openclaw, work.path(), scratch.path(), &VARS);
        let path = OpenclawAdapter::transcript_path(&OpenclawAdapter::home(&ctx), &OpenclawAdapter::session_id(&ctx));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, TRANSCRIPT).unwrap();

        let env = OpenclawAdapter.compose_environment(&ctx).unwrap();
        let extraction = OpenclawAdapter
            .extract_stats(&ctx, &env, &ProcessOutcome::from_parts(RESULT, "", 0))
            .await;
        let stats = extraction.result().unwrap();
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.tool_calls, Some(2));
        assert_eq!(stats.response.as_deref(), Some("Fixed the failing test."));
        assert_eq!(extraction.trajectory.unwrap().path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_missing_transcript_keeps_usage() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = context(AgentKind::Openclaw, work.path(), scratch.path(), &VARS);
        let env = OpenclawAdapter.compose_environment(&ctx).unwrap();
        let extraction = OpenclawAdapter
            .extract_stats(&ctx, &env, &ProcessOutcome::from_parts(RESULT, "", 0))
            .await;
        assert!(extraction.failure.is_some());
        assert_eq!(extraction.stats.models_usage["kimi-labs/kimi-k2"].total_tokens, 1350);
        assert_eq!(extraction.stats.llm_calls, None);
    }

    #[test]
    fn test_assistant_usage_needs_output() {
        let records = payload::json_objects(r#"{"message":{"role":"assistant","usage":{"input":1}}}"#);
        assert_eq!(
            OpenclawAdapter::decode_transcript(&records).unwrap_err(),
            "missing field 'output'"
        );
    }
}
