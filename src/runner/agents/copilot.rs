//! GitHub Copilot CLI adapter.
//!
//! Copilot prints plain text, so stats come from its debug logs: each model
//! call is logged as a `data:` line followed by the JSON response body.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use super::payload;
use super::{
    media_prompt, AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy,
    RunContext,
};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{resolve_model, ComposedEnvironment};
use crate::runner::locator::{sorted_files, ArtifactKind, RunArtifactSet};
use crate::runner::process::{stdout_only, ProcessOutcome};
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

static LOG_PREFIX_RE: OnceLock<Option<Regex>> = OnceLock::new();

const LOG_DIR: &str = "logs";

const MEDIA: MediaStrategy = MediaStrategy::Natural { tool: "view" };

pub struct CopilotAdapter;

impl CopilotAdapter {
    /// Log line with its timestamp and level removed.
    fn message(line: &str) -> &str {
        match payload::cached_regex(&LOG_PREFIX_RE, r"^\d{4}-\d{2}-\d{2}T\S+\s+\[[A-Z]+\]\s?") {
            Some(re) => match re.find(line) {
                Some(prefix) => &line[prefix.end()..],
                None => line,
            },
            None => line,
        }
    }

    /// Parses the JSON object starting at `start`, growing line by line.
    ///
    /// Returns the object, if any, and the index after the consumed lines.
    fn json_block(messages: &[&str], start: usize) -> (Option<Value>, usize) {
        if !messages[start].trim_start().starts_with('{') {
            return (None, start + 1);
        }
        let mut buffer = String::new();
        for (index, message) in messages.iter().enumerate().skip(start) {
            if index > start {
                buffer.push('\n');
            }
            buffer.push_str(message);
            if let Ok(value) = serde_json::from_str::<Value>(buffer.trim()) {
                return (value.is_object().then_some(value), index + 1);
            }
        }
        (None, messages.len())
    }

    fn is_model_call(value: &Value) -> bool {
        value.get("usage").is_some_and(Value::is_object)
            && value
                .get("model")
                .and_then(Value::as_str)
                .is_some_and(|model| !model.trim().is_empty())
            && value.get("choices").is_some_and(Value::is_array)
    }

    /// Model-call payloads logged in one debug log, in order.
    fn model_calls(text: &str) -> Vec<Value> {
        let messages: Vec<&str> = text.lines().map(Self::message).collect();
        let mut calls = Vec::new();
        let mut index = 0;
        while index < messages.len() {
            if messages[index].trim() != "data:" {
                index += 1;
                continue;
            }
            let mut start = index + 1;
            while start < messages.len() && messages[start].trim().is_empty() {
                start += 1;
            }
            if start >= messages.len() {
                break;
            }
            let (block, next) = Self::json_block(&messages, start);
            index = next.max(index + 1);
            if let Some(value) = block.filter(Self::is_model_call) {
                calls.push(value);
            }
        }
        calls
    }

    fn load(log_dir: &Path) -> Result<(Vec<Value>, Vec<std::path::PathBuf>), String> {
        let files = sorted_files(log_dir, "process-*.log");
        let mut calls = Vec::new();
        for path in &files {
            let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            calls.extend(Self::model_calls(&String::from_utf8_lossy(&bytes)));
        }
        Ok((calls, files))
    }

    fn tool_calls(call: &Value) -> Result<u64, String> {
        let mut total = 0;
        for choice in payload::array(call, "choices")? {
            let message = match choice.get("message") {
                None | Some(Value::Null) => continue,
                Some(message @ Value::Object(_)) => message,
                Some(_) => return Err("choice 'message' is not an object".to_string()),
            };
            match message.get("tool_calls") {
                None | Some(Value::Null) => {}
                Some(Value::Array(calls)) => total += calls.len() as u64,
                Some(_) => return Err("field 'tool_calls' is not a list".to_string()),
            }
        }
        Ok(total)
    }

    fn response(calls: &[Value]) -> Option<String> {
        calls.iter().rev().find_map(|call| {
            call.get("choices")?.as_array()?.iter().rev().find_map(|choice| {
                choice
                    .get("message")?
                    .get("content")?
                    .as_str()
                    .map(str::trim)
                    .filter(|content| !content.is_empty())
                    .map(str::to_string)
            })
        })
    }

    fn decode(calls: &[Value]) -> Result<RunStats, String> {
        if calls.is_empty() {
            return Err("no model-call payloads in the debug logs".to_string());
        }
        let mut stats = RunStats::default();
        let mut tool_calls = 0;
        for call in calls {
            let usage = payload::get(call, "usage")?;
            stats.add_usage(
                payload::non_blank(call, "model")?,
                ModelUsage::with_total(
                    payload::uint(usage, "prompt_tokens")?,
                    payload::uint(usage, "completion_tokens")?,
                    payload::uint(usage, "total_tokens")?,
                ),
            );
            tool_calls += Self::tool_calls(call)?;
        }
        stats.llm_calls = Some(calls.len() as u64);
        stats.tool_calls = Some(tool_calls);
        Ok(stats.with_response(Self::response(calls)))
    }
}

#[async_trait]
impl AgentAdapter for CopilotAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Copilot
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: false,
            media: MEDIA,
            reasoning_efforts: &[],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.pass_through(&ctx.snapshot, &["GH_TOKEN", "GITHUB_TOKEN"]);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let log_dir = ctx.scratch_path(LOG_DIR);
        std::fs::create_dir_all(&log_dir)?;
        let (prompt, staged) = media_prompt(ctx, MEDIA)?;
        let mut spec = ctx
            .command()
            .arg("--prompt")
            .arg(prompt)
            .args(["--yolo", "--no-ask-user", "--log-level", "debug", "--log-dir"])
            .arg(log_dir.display().to_string());
        if let Some(model) = resolve_model(ctx.model_override(), &ctx.snapshot, "COPILOT_MODEL", None) {
            spec = spec.arg("--model").arg(model);
        }
        Ok(Invocation::new(spec).with_staged_media(staged))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let stdout = stdout_only(&outcome.stdout).trim();
        let stdout_response = (!stdout.is_empty()).then(|| stdout.to_string());
        let log_dir = ctx.scratch_path(LOG_DIR);
        let (calls, files) = match Self::load(&log_dir) {
            Ok(loaded) => loaded,
            Err(reason) => {
                let stats = RunStats::default().with_response(stdout_response);
                return Extraction::partial(stats, Some(fail(reason)));
            }
        };
        debug!("Copilot logs: {} files, {} model calls", files.len(), calls.len());

        let mut artifacts = RunArtifactSet::new();
        for file in &files {
            artifacts.push(ArtifactKind::Log, file, ctx.run_id.to_string());
        }
        let (mut stats, failure) = match Self::decode(&calls) {
            Ok(stats) => (stats, None),
            Err(reason) => (RunStats::default(), Some(fail(reason))),
        };
        if stats.response.is_none() {
            stats = stats.with_response(stdout_response);
        }
        stats.telemetry_log = Some(log_dir.display().to_string());
        let trajectory = (!calls.is_empty())
            .then(|| TrajectorySource::from_file(&log_dir, json!({ "model_calls": calls })));

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(trajectory)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@github/copilot",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use crate::runner::validator::{Tentative, EXIT_FAILURE};
    use std::fs;
    use tempfile::TempDir;

    const CALL_WITH_USAGE: &str = "\
2025-01-10T10:00:00.000Z [DEBUG] Sending request
2025-01-10T10:00:01.000Z [DEBUG] data:
2025-01-10T10:00:01.000Z [DEBUG] {
2025-01-10T10:00:01.000Z [DEBUG]   \"model\": \"gpt-5\",
2025-01-10T10:00:01.000Z [DEBUG]   \"choices\": [{\"message\": {\"role\": \"assistant\", \"content\": \"Fixed it.\"}}],
2025-01-10T10:00:01.000Z [DEBUG]   \"usage\": {\"prompt_tokens\": 120, \"completion_tokens\": 30, \"total_tokens\": 150}
2025-01-10T10:00:01.000Z [DEBUG] }
2025-01-10T10:00:02.000Z [INFO] done
";

    const CALL_WITHOUT_USAGE: &str = "\
2025-01-10T10:00:01.000Z [DEBUG] data:
2025-01-10T10:00:01.000Z [DEBUG] {\"model\": \"gpt-5\", \"choices\": [{\"message\": {\"content\": \"Fixed it.\"}}]}
";

    fn run_ctx(scratch: &Path, work: &Path, log: &str) -> RunContext {
        let logs = scratch.join(LOG_DIR);
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("process-1234.log"), log).unwrap();
        context(AgentKind::Copilot, work, scratch, &[])
    }

    #[test]
    fn test_build_command() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = context(AgentKind::Copilot, work.path(), scratch.path(), &[("COPILOT_MODEL", "gpt-5")]);
        let env = CopilotAdapter.compose_environment(&ctx).unwrap();
        let args = CopilotAdapter.build_command(&ctx, &env).unwrap().spec.args;
        assert_eq!(&args[..2], &["--prompt".to_string(), "fix the tests".to_string()]);
        assert!(args.contains(&scratch.path().join("logs").display().to_string()));
        assert!(args.ends_with(&["--model".to_string(), "gpt-5".to_string()]));
    }

    #[tokio::test]
    async fn test_usage_without_tool_fields() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = run_ctx(scratch.path(), work.path(), CALL_WITH_USAGE);
        let env = CopilotAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts("Fixed it.\n", "", 0);

        let extraction = CopilotAdapter.extract_stats(&ctx, &env, &outcome).await;
        let stats = extraction.result().unwrap();
        assert_eq!(stats.models_usage["gpt-5"], ModelUsage::with_total(120, 30, 150));
        assert_eq!(stats.llm_calls, Some(1));
        assert_eq!(stats.tool_calls, Some(0));
        assert_eq!(stats.response.as_deref(), Some("Fixed it."));
        assert_eq!(extraction.artifacts.len(), 1);
        assert_eq!(Tentative::new(0, false).finalize(&stats, true, false).code, 0);
    }

    #[tokio::test]
    async fn test_missing_usage_fails_closed() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = run_ctx(scratch.path(), work.path(), CALL_WITHOUT_USAGE);
        let env = CopilotAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts("Fixed it.\n", "", 0);

        let extraction = CopilotAdapter.extract_stats(&ctx, &env, &outcome).await;
        assert!(extraction.failure.is_some());
        assert!(extraction.stats.models_usage.is_empty());
        assert_eq!(extraction.stats.response.as_deref(), Some("Fixed it."));
        let verdict = Tentative::new(0, false)
            .with_extraction_failure(extraction.failure.as_ref())
            .finalize(&extraction.stats, false, false);
        assert_eq!(verdict.code, EXIT_FAILURE);
    }

    #[test]
    fn test_tool_calls_summed_across_choices() {
        let calls = vec![
            json!({"model": "gpt-5", "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
                   "choices": [{"message": {"tool_calls": [{"id": "a"}, {"id": "b"}]}}]}),
            json!({"model": "gpt-5-mini", "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
                   "choices": [{"message": {"content": "", "tool_calls": [{"id": "c"}]}}, {"finish_reason": "stop"}]}),
        ];
        let stats = CopilotAdapter::decode(&calls).unwrap();
        assert_eq!(stats.tool_calls, Some(3));
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.models_usage.len(), 2);
        assert_eq!(stats.response, None);
    }

    #[test]
    fn test_non_json_data_line_is_skipped() {
        let log = "data:\nnot json\ndata:\n{\"model\":\"m\",\"choices\":[],\"usage\":{}}\n";
        assert_eq!(CopilotAdapter::model_calls(log).len(), 1);
    }
}
