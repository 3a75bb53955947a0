//! SWE-agent adapter.
//!
//! Every run gets its own problem-statement id, so the trajectory lands at
//! a path known before the process starts: `<out>/<id>/<id>.traj`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::payload;
use super::{write_config, AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext};
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::runner::env::{resolve_model, ComposedEnvironment, EnvSnapshot};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const OUTPUT_DIR: &str = "out";

/// Runtime asset locations the CLI reads when set.
const ASSET_VARS: &[&str] = &["SWE_AGENT_CONFIG_DIR", "SWE_AGENT_TOOLS_DIR", "SWE_AGENT_TRAJECTORY_DIR"];

pub struct SweAgentAdapter;

impl SweAgentAdapter {
    fn problem_id(ctx: &RunContext) -> String {
        format!("cakit-{}", ctx.run_id)
    }

    fn trajectory_path(ctx: &RunContext) -> PathBuf {
        let id = Self::problem_id(ctx);
        ctx.scratch_path(OUTPUT_DIR).join(&id).join(format!("{}.traj", id))
    }

    fn config_path(snapshot: &EnvSnapshot) -> Option<PathBuf> {
        snapshot
            .home()
            .map(|home| home.join(".config").join("sweagent").join("config.yaml"))
    }

    /// Token counters of one `model_stats` block.
    fn model_stats(info: &Value) -> Result<(ModelUsage, u64), String> {
        let stats = payload::get(info, "model_stats")?;
        let usage = ModelUsage::summed(
            payload::uint(stats, "tokens_sent")?,
            payload::uint(stats, "tokens_received")?,
        );
        Ok((usage, payload::uint(stats, "api_calls")?))
    }

    /// Usage from `info.model_stats`, or summed over every attempt.
    fn usage(traj: &Value) -> Result<(ModelUsage, u64), String> {
        if let Some(info) = traj.get("info").filter(|info| info.get("model_stats").is_some()) {
            return Self::model_stats(info);
        }
        let attempts = payload::array(traj, "attempts").map_err(|_| "missing field 'info.model_stats'".to_string())?;
        let mut usage = ModelUsage::default();
        let mut calls = 0;
        for attempt in attempts {
            let (attempt_usage, attempt_calls) = Self::model_stats(payload::get(attempt, "info")?)?;
            usage.accumulate(attempt_usage);
            calls += attempt_calls;
        }
        Ok((usage, calls))
    }

    fn replay_model(replay_config: &Value) -> Option<String> {
        let parsed = match replay_config {
            Value::String(text) => serde_json::from_str::<Value>(text).ok()?,
            other => other.clone(),
        };
        payload::at(&parsed, &["agent", "model"])
            .and_then(|model| payload::non_blank(model, "name"))
            .ok()
    }

    fn model(traj: &Value) -> Result<String, String> {
        if let Some(model) = traj.get("replay_config").and_then(Self::replay_model) {
            return Ok(model);
        }
        traj.get("attempts")
            .and_then(Value::as_array)
            .and_then(|attempts| {
                attempts
                    .iter()
                    .rev()
                    .find_map(|attempt| attempt.get("replay_config").and_then(Self::replay_model))
            })
            .ok_or_else(|| "replay_config does not name a model".to_string())
    }

    fn steps(traj: &Value) -> Result<Vec<&Value>, String> {
        match traj.get("attempts").and_then(Value::as_array) {
            Some(attempts) if !attempts.is_empty() => {
                let mut steps = Vec::new();
                for attempt in attempts {
                    steps.extend(payload::array(attempt, "trajectory")?);
                }
                Ok(steps)
            }
            _ => Ok(payload::array(traj, "trajectory")?.iter().collect()),
        }
    }

    fn count_actions(steps: &[&Value]) -> Result<u64, String> {
        let mut count = 0;
        for step in steps {
            match step.get("action") {
                None | Some(Value::Null) => {}
                Some(Value::String(action)) if action.trim().is_empty() => {}
                Some(Value::String(_)) => count += 1,
                Some(_) => return Err("step 'action' is not a string".to_string()),
            }
        }
        Ok(count)
    }

    fn response(traj: &Value, steps: &[&Value]) -> Option<String> {
        steps
            .iter()
            .rev()
            .find_map(|step| step.get("response").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()))
            .or_else(|| {
                traj.get("info")
                    .and_then(|info| info.get("submission"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
            })
            .map(str::to_string)
    }

    fn decode(traj: &Value) -> Result<RunStats, String> {
        let (usage, api_calls) = Self::usage(traj)?;
        let model = Self::model(traj)?;
        let steps = Self::steps(traj)?;

        let mut stats = RunStats::default();
        stats.add_usage(model, usage);
        stats.llm_calls = Some(api_calls);
        stats.tool_calls = Some(Self::count_actions(&steps)?);
        let response = Self::response(traj, &steps);
        Ok(stats.with_response(response))
    }

    fn config_document(tools_dir: Option<&Path>) -> Value {
        let mut tools = json!({
            "enable_bash_tool": true,
            "parse_function": {"type": "thought_action"},
        });
        if let Some(dir) = tools_dir {
            tools["bundles"] = json!([
                {"path": dir.join("registry").display().to_string()},
                {"path": dir.join("submit").display().to_string()},
            ]);
        }
        json!({
            "agent": {
                "templates": {
                    "system_template": "You are a helpful assistant that can interact with a computer to solve tasks.",
                    "instance_template": "{{problem_statement}}",
                },
                "tools": tools,
                "history_processors": [{"type": "cache_control", "last_n_messages": 2}],
            }
        })
    }
}

#[async_trait]
impl AgentAdapter for SweAgentAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::SweAgent
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let api_key = ctx.snapshot.get("SWE_AGENT_API_KEY");
        let api_base = ctx.snapshot.get("SWE_AGENT_API_BASE");
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set_opt("SWE_AGENT_API_KEY", api_key)
            .set_opt("SWE_AGENT_API_BASE", api_base)
            .set_opt("OPENAI_API_KEY", api_key)
            .set_opt("OPENAI_API_BASE", api_base)
            .set_opt("OPENAI_BASE_URL", api_base)
            .pass_through(&ctx.snapshot, ASSET_VARS);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let output_dir = ctx.scratch_path(OUTPUT_DIR);
        std::fs::create_dir_all(&output_dir)?;
        let mut spec = ctx
            .command()
            .args(["run", "--env.deployment.type=local", "--env.repo.type=local"])
            .arg(format!("--env.repo.path={}", ctx.workdir().display()))
            .arg("--problem_statement.text")
            .arg(ctx.prompt())
            .arg("--problem_statement.id")
            .arg(Self::problem_id(ctx))
            .arg(format!("--output_dir={}", output_dir.display()));
        if let Some(config) = Self::config_path(&ctx.snapshot).filter(|path| path.is_file()) {
            spec = spec.arg("--config").arg(config.display().to_string());
        }
        if let Some(model) = resolve_model(ctx.model_override(), &ctx.snapshot, "SWE_AGENT_MODEL", None) {
            spec = spec.arg("--agent.model.name").arg(model);
        }
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
        debug!("SWE-agent trajectory expected at {}", path.display());
        let traj = match payload::read_json(&path) {
            Ok(traj) => traj,
            Err(reason) => return Extraction::new(Err(fail(reason))),
        };

        let mut artifacts = RunArtifactSet::new();
        artifacts.push(ArtifactKind::Trajectory, &path, Self::problem_id(ctx));
        let stats = Self::decode(&traj);
        Extraction::new(stats.map_err(fail))
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::from_file(&path, traj)))
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Pip {
            url_template: "https://github.com/SWE-agent/SWE-agent/archive/refs/tags/{version}.tar.gz",
            default_version: "v1.1.0",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let Some(path) = Self::config_path(snapshot) else {
            return Ok(None);
        };
        let tools_dir = snapshot.get("SWE_AGENT_TOOLS_DIR").map(|dir| snapshot.expand(dir));
        let document = Self::config_document(tools_dir.as_deref());
        let text = serde_yaml::to_string(&document).map_err(|e| InstallError::Serialize(e.to_string()))?;
        write_config(&path, &text).map(Some)
    }

    fn requires_trajectory(&self) -> bool {
        true
    }
}
