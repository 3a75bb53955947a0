//! Gemini CLI adapter.
//!
//! The headless JSON result carries per-model token and request counts
//! under `stats.models`. Qwen Code forked the same output shape, so the
//! decoder here is shared with [`super::qwen`].

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use super::payload;
use super::{
    media_prompt, AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy,
    RunContext,
};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{resolve_model, ComposedEnvironment};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::{ProcessOutcome, ProcessSpec};
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const PASS_THROUGH: &[&str] = &[
    "GEMINI_API_KEY",
    "GOOGLE_API_KEY",
    "GOOGLE_GEMINI_BASE_URL",
    "GOOGLE_CLOUD_PROJECT",
    "GOOGLE_GENAI_USE_VERTEXAI",
];

/// Local telemetry outfile, inside the run's scratch directory.
pub(crate) const TELEMETRY_FILE: &str = "telemetry.log";

pub(crate) const SYMBOLIC_MEDIA: Capabilities = Capabilities {
    images: true,
    videos: true,
    media: MediaStrategy::Symbolic,
    reasoning_efforts: &[],
};

pub struct GeminiAdapter;

/// Appends the headless flags shared by Gemini and Qwen.
pub(crate) fn headless_args(spec: ProcessSpec, prompt: &str, telemetry: &std::path::Path) -> ProcessSpec {
    spec.arg("-p")
        .arg(prompt)
        .args(["--output-format", "json", "--approval-mode", "yolo"])
        .args(["--telemetry", "--telemetry-target", "local", "--telemetry-otlp-endpoint", ""])
        .arg("--telemetry-outfile")
        .arg(telemetry.display().to_string())
        .arg("--telemetry-log-prompts")
}

/// Decodes the `stats` block of a headless JSON result.
pub(crate) fn decode_stats(result: &Value) -> Result<RunStats, String> {
    let mut stats = RunStats::default();
    let mut requests = 0u64;
    for (model, entry) in payload::object(payload::get(result, "stats")?, "models")? {
        let tokens = payload::get(entry, "tokens")?;
        let usage = ModelUsage::with_total(
            payload::uint(tokens, "prompt")?,
            payload::uint(tokens, "candidates")?,
            payload::uint(tokens, "total")?,
        );
        requests += payload::uint(payload::get(entry, "api")?, "totalRequests")?;
        stats.add_usage(model.clone(), usage);
    }
    stats.llm_calls = Some(requests);
    stats.tool_calls = Some(payload::uint(payload::at(result, &["stats", "tools"])?, "totalCalls")?);
    Ok(stats.with_response(payload::opt_string(result, "response")?.map(str::to_string)))
}

/// Extraction for a Gemini-shaped run.
pub(crate) fn extract(kind: AgentKind, ctx: &RunContext, outcome: &ProcessOutcome) -> Extraction {
    let fail = |reason: String| ExtractionFailed::new(kind.as_str(), reason);
    let result = match payload::terminal_object(&outcome.stdout) {
        Ok(result) => result,
        Err(reason) => return Extraction::new(Err(fail(reason))),
    };
    let error_event = result.get("error").is_some_and(Value::is_object);

    let telemetry = ctx.scratch_path(TELEMETRY_FILE);
    let mut artifacts = RunArtifactSet::new();
    if telemetry.is_file() {
        artifacts.push(ArtifactKind::Telemetry, &telemetry, ctx.run_id.to_string());
    }
    // the response and telemetry outfile survive a usage decode failure
    let (mut stats, failure) = match decode_stats(&result) {
        Ok(stats) => (stats, None),
        Err(reason) => {
            let response = payload::opt_string(&result, "response").ok().flatten();
            (RunStats::default().with_response(response.map(str::to_string)), Some(fail(reason)))
        }
    };
    if telemetry.is_file() {
        stats.telemetry_log = Some(telemetry.display().to_string());
    }

    Extraction::partial(stats, failure)
        .with_artifacts(artifacts)
        .with_trajectory(Some(TrajectorySource::labelled("stdout result", result)))
        .with_error_event(error_event)
}

#[async_trait]
impl AgentAdapter for GeminiAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Gemini
    }

    fn capabilities(&self) -> Capabilities {
        SYMBOLIC_MEDIA
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.pass_through(&ctx.snapshot, PASS_THROUGH);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let (prompt, staged) = media_prompt(ctx, MediaStrategy::Symbolic)?;
        let telemetry: PathBuf = ctx.scratch_path(TELEMETRY_FILE);
        let mut spec = headless_args(ctx.command(), &prompt, &telemetry);
        if let Some(model) = resolve_model(ctx.model_override(), &ctx.snapshot, "GEMINI_MODEL", None) {
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
        extract(self.kind(), ctx, outcome)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@google/gemini-cli",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use std::fs;
    use tempfile::TempDir;

    const RESULT: &str = r#"{
  "response": "Fixed the failing test.",
  "stats": {
    "models": {
      "gemini-2.5-pro": {"api": {"totalRequests": 3, "totalErrors": 0}, "tokens": {"prompt": 900, "candidates": 120, "total": 1100, "cached": 0}},
      "gemini-2.5-flash": {"api": {"totalRequests": 1}, "tokens": {"prompt": 50, "candidates": 5, "total": 55}}
    },
    "tools": {"totalCalls": 4, "totalSuccess": 4}
  }
}"#;

    #[test]
    fn test_decode_stats() {
        let result: Value = serde_json::from_str(RESULT).unwrap();
        let stats = decode_stats(&result).unwrap();
        assert_eq!(stats.models_usage.len(), 2);
        assert_eq!(stats.models_usage["gemini-2.5-pro"].total_tokens, 1100);
        assert_eq!(stats.llm_calls, Some(4));
        assert_eq!(stats.tool_calls, Some(4));
        assert_eq!(stats.response.as_deref(), Some("Fixed the failing test."));
    }

    #[test]
    fn test_missing_tools_block_fails() {
        let result: Value = serde_json::from_str(r#"{"response":"x","stats":{"models":{}}}"#).unwrap();
        assert_eq!(decode_stats(&result).unwrap_err(), "missing field 'stats.tools'");
    }

    #[test]
    fn test_build_command_stages_media() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let image = work.path().join("diagram.png");
        fs::write(&image, "png").unwrap();
        let mut ctx = context(AgentKind::Gemini, work.path(), scratch.path(), &[("GEMINI_MODEL", "gemini-2.5-pro")]);
        ctx.media.images.push(image);

        let env = GeminiAdapter.compose_environment(&ctx).unwrap();
        let invocation = GeminiAdapter.build_command(&ctx, &env).unwrap();
        assert_eq!(invocation.spec.args[0], "-p");
        assert!(invocation.spec.args[1].starts_with("@{.cakit-media/00-diagram.png}"));
        assert!(invocation.spec.args.ends_with(&["--model".to_string(), "gemini-2.5-pro".to_string()]));
        assert_eq!(invocation.staged_media.len(), 1);
    }

    #[tokio::test]
    async fn test_error_object_is_error_event() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Gemini, work.path(), work.path(), &[]);
        let env = GeminiAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(r#"{"error":{"type":"ApiError","message":"quota"}}"#, "", 0);
        let extraction = GeminiAdapter.extract_stats(&ctx, &env, &outcome).await;
        assert!(extraction.error_event);
        assert!(extraction.failure.is_some());
    }

    #[tokio::test]
    async fn test_response_kept_when_stats_missing() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        fs::write(scratch.path().join(TELEMETRY_FILE), "{}").unwrap();
        let ctx = context(AgentKind::Gemini, work.path(), scratch.path(), &[]);
        let env = GeminiAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(r#"{"response":"Done."}"#, "", 0);
        let extraction = GeminiAdapter.extract_stats(&ctx, &env, &outcome).await;

        assert_eq!(extraction.failure.unwrap().reason, "missing field 'stats'");
        assert_eq!(extraction.stats.response.as_deref(), Some("Done."));
        assert!(extraction.stats.telemetry_log.is_some());
        assert!(extraction.stats.models_usage.is_empty());
        assert_eq!(extraction.stats.llm_calls, None);
    }

    #[tokio::test]
    async fn test_telemetry_outfile_reported() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        fs::write(scratch.path().join(TELEMETRY_FILE), "{}").unwrap();
        let ctx = context(AgentKind::Gemini, work.path(), scratch.path(), &[]);
        let env = GeminiAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(RESULT, "", 0);
        let extraction = GeminiAdapter.extract_stats(&ctx, &env, &outcome).await;
        let stats = extraction.result().unwrap();
        assert_eq!(
            stats.telemetry_log,
            Some(scratch.path().join(TELEMETRY_FILE).display().to_string())
        );
        assert!(extraction.artifacts.first(ArtifactKind::Telemetry).is_some());
    }
}
