//! Trae Agent (open-source `trae-cli`) adapter.
//!
//! The run writes a trajectory recording: every LLM interaction with the
//! model, token usage and requested tool calls, plus the final result.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::payload;
use super::{write_config, AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext};
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::runner::env::{resolve_model, ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const DEFAULT_MODEL: &str = "gpt-4.1";
const MODEL_KEY: &str = "trae_agent_model";

pub struct TraeOssAdapter;

impl TraeOssAdapter {
    fn model(snapshot: &EnvSnapshot, model_override: Option<&str>) -> String {
        resolve_model(model_override, snapshot, "TRAE_AGENT_MODEL", None).unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    fn trajectory_path(ctx: &RunContext) -> PathBuf {
        match ctx.snapshot.get("CAKIT_TRAE_TRAJECTORY") {
            Some(path) => ctx.snapshot.expand(path),
            None => ctx.scratch_path("trae_trajectory.json"),
        }
    }

    /// The `trae_config.yaml` document with one custom OpenAI-compatible model.
    fn config_yaml(api_key: &str, base_url: Option<&str>, model: &str) -> Result<String, String> {
        let config = serde_json::json!({
            "agents": {
                "trae_agent": {
                    "enable_lakeview": false,
                    "model": MODEL_KEY,
                    "max_steps": 200,
                    "tools": ["bash", "str_replace_based_edit_tool", "sequentialthinking", "task_done"],
                }
            },
            "model_providers": {
                "custom": {"api_key": api_key, "provider": "openai", "base_url": base_url.unwrap_or_default()}
            },
            "models": {
                MODEL_KEY: {
                    "model_provider": "custom",
                    "model": model,
                    "max_tokens": 4096,
                    "temperature": 0.2,
                    "top_p": 1.0,
                    "top_k": 0,
                    "parallel_tool_calls": false,
                    "max_retries": 3,
                }
            },
        });
        serde_yaml::to_string(&config).map_err(|e| e.to_string())
    }

    fn decode(recording: &Value) -> Result<RunStats, String> {
        let interactions = payload::array(recording, "llm_interactions")?;
        if interactions.is_empty() {
            return Err("recording has no LLM interactions".to_string());
        }
        let mut stats = RunStats::default();
        let mut tool_calls = 0;
        for interaction in interactions {
            let response = payload::get(interaction, "response")?;
            let usage = payload::get(response, "usage")?;
            stats.add_usage(
                payload::non_blank(interaction, "model")?,
                ModelUsage::summed(payload::uint(usage, "input_tokens")?, payload::uint(usage, "output_tokens")?),
            );
            match response.get("tool_calls") {
                None | Some(Value::Null) => {}
                Some(_) => tool_calls += payload::array(response, "tool_calls")?.len() as u64,
            }
        }
        stats.llm_calls = Some(interactions.len() as u64);
        stats.tool_calls = Some(tool_calls);
        Ok(stats)
    }

    fn final_result(recording: &Value) -> Option<String> {
        recording
            .get("final_result")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl AgentAdapter for TraeOssAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::TraeOss
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let snap = &ctx.snapshot;
        let mut req = Requirements::new();
        let api_key = req.require(snap.get("TRAE_AGENT_API_KEY"), "TRAE_AGENT_API_KEY");
        req.finish()?;
        let base_url = snap.get("TRAE_AGENT_API_BASE");

        let mut env = ComposedEnvironment::base(snap);
        env.set_opt("TRAE_AGENT_API_KEY", api_key)
            .set_opt("OPENAI_API_KEY", api_key)
            .set_opt("TRAE_AGENT_API_BASE", base_url)
            .set_opt("OPENAI_API_BASE", base_url)
            .set_opt("OPENAI_BASE_URL", base_url);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let api_key = env
            .get("TRAE_AGENT_API_KEY")
            .ok_or_else(|| EnvError::Missing(vec!["TRAE_AGENT_API_KEY".to_string()]))?;
        let model = Self::model(&ctx.snapshot, ctx.model_override());
        let text = Self::config_yaml(api_key, env.get("TRAE_AGENT_API_BASE"), &model).map_err(|reason| {
            EnvError::Invalid {
                name: "trae_config.yaml".to_string(),
                reason,
            }
        })?;
        let config = ctx.scratch_path("trae_config.yaml");
        std::fs::write(&config, text)?;

        let trajectory = Self::trajectory_path(ctx);
        if let Some(parent) = trajectory.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let spec = ctx
            .command()
            .arg("run")
            .arg(ctx.prompt())
            .arg("--working-dir")
            .arg(ctx.workdir().display().to_string())
            .arg("--config-file")
            .arg(config.display().to_string())
            .arg("--trajectory-file")
            .arg(trajectory.display().to_string());
        Ok(Invocation::new(spec))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        _outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let path = Self::trajectory_path(ctx);
        let recording = match payload::read_json(&path) {
            Ok(recording) => recording,
            Err(reason) => {
                warn!("trae-oss: {}", reason);
                return Extraction::new(Err(fail(reason)));
            }
        };
        let mut artifacts = RunArtifactSet::new();
        artifacts.push(ArtifactKind::Trajectory, &path, ctx.run_id.to_string());

        let response = Self::final_result(&recording);
        let (stats, failure) = match Self::decode(&recording) {
            Ok(stats) => (stats.with_response(response), None),
            Err(reason) => (RunStats::default().with_response(response), Some(fail(reason))),
        };
        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::from_file(&path, recording)))
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Pip {
            url_template: "git+https://github.com/bytedance/trae-agent.git@{version}",
            default_version: "main",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let (Some(api_key), Some(home)) = (snapshot.get("TRAE_AGENT_API_KEY"), snapshot.home()) else {
            return Ok(None);
        };
        let text = Self::config_yaml(api_key, snapshot.get("TRAE_AGENT_API_BASE"), &Self::model(snapshot, None))
            .map_err(InstallError::Serialize)?;
        write_config(&home.join(".config/trae/config.yaml"), &text).map(Some)
    }

    fn requires_trajectory(&self) -> bool {
        true
    }
}
