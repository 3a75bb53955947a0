//! Auggie (Augment Code) adapter.
//!
//! `--output-format json` prints events ending in a `type == "result"`
//! object whose `stats` block has the Gemini headless shape, so the usage
//! decoder is shared with [`super::gemini`].

use async_trait::async_trait;
use serde_json::Value;

use super::gemini::decode_stats;
use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{resolve_model, ComposedEnvironment};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::RunStats;
use crate::trajectory::TrajectorySource;

const PASS_THROUGH: &[&str] = &[
    "AUGMENT_API_TOKEN",
    "AUGMENT_API_URL",
    "AUGMENT_SESSION_AUTH",
    "GITHUB_API_TOKEN",
];

const LOG_FILE: &str = "auggie.log";

pub struct AuggieAdapter;

impl AuggieAdapter {
    /// The last `type == "result"` event on stdout.
    fn result_event(stdout: &str) -> Result<Value, String> {
        payload::json_objects(stdout)
            .into_iter()
            .filter(|event| payload::event_type(event) == Some("result"))
            .last()
            .ok_or_else(|| "stdout has no result event".to_string())
    }

    /// `result` holds the final answer; blank means absent.
    fn response(result: &Value) -> Option<String> {
        result
            .get("result")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl AgentAdapter for AuggieAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Auggie
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: false,
            media: MediaStrategy::Native,
            reasoning_efforts: &[],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.pass_through(&ctx.snapshot, PASS_THROUGH)
            .set("AUGMENT_DISABLE_AUTO_UPDATE", "1");
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let mut spec = ctx
            .command()
            .args(["--print", "--quiet", "--output-format", "json"])
            .arg("--workspace-root")
            .arg(ctx.workdir().display().to_string())
            .arg("--instruction")
            .arg(ctx.prompt())
            .arg("--log-file")
            .arg(ctx.scratch_path(LOG_FILE).display().to_string())
            .args(["--log-level", "debug"]);
        if let Some(model) = resolve_model(ctx.model_override(), &ctx.snapshot, "CAKIT_AUGGIE_MODEL", None) {
            spec = spec.arg("--model").arg(model);
        }
        for image in &ctx.media.images {
            spec = spec.arg("--image").arg(image.display().to_string());
        }
        Ok(Invocation::new(spec))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let result = match Self::result_event(&outcome.stdout) {
            Ok(result) => result,
            Err(reason) => return Extraction::new(Err(fail(reason))),
        };
        let error_event = result.get("is_error").and_then(Value::as_bool) == Some(true);

        let response = Self::response(&result);
        let (mut stats, failure) = match decode_stats(&result) {
            Ok(stats) => (stats, None),
            Err(reason) => (RunStats::default(), Some(fail(reason))),
        };
        stats.response = response;

        let log = ctx.scratch_path(LOG_FILE);
        let mut artifacts = RunArtifactSet::new();
        if log.is_file() {
            stats.telemetry_log = Some(log.display().to_string());
            artifacts.push(ArtifactKind::Telemetry, &log, ctx.run_id.to_string());
        }

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::labelled("stdout result", result)))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@augmentcode/auggie",
        }
    }
}
