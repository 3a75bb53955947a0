//! Continue CLI (`cn`) adapter.
//!
//! Each run gets its own global directory inside scratch, holding the
//! generated `config.yaml`, the `sessions/` store and `logs/cn.log`. The
//! session named last in `sessions/sessions.json` carries per-message usage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::payload;
use super::{write_config, AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext};
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const GLOBAL_DIR: &str = "continue";

pub struct ContinueAdapter;

/// OpenAI-compatible credentials for the generated config.
struct Auth<'a> {
    api_key: &'a str,
    model: String,
    base_url: Option<&'a str>,
}

impl ContinueAdapter {
    fn auth<'a>(snapshot: &'a EnvSnapshot, model_override: Option<&str>) -> Result<Auth<'a>, EnvError> {
        let model = model_override
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .or_else(|| snapshot.get("CAKIT_CONTINUE_OPENAI_MODEL"))
            .map(str::to_string);
        let mut req = Requirements::new();
        let api_key = req.require(snapshot.get("CAKIT_CONTINUE_OPENAI_API_KEY"), "CAKIT_CONTINUE_OPENAI_API_KEY");
        req.require(model.as_deref(), "CAKIT_CONTINUE_OPENAI_MODEL");
        req.finish()?;
        match (api_key, model) {
            (Some(api_key), Some(model)) => Ok(Auth {
                api_key,
                model,
                base_url: snapshot.get("CAKIT_CONTINUE_OPENAI_BASE_URL"),
            }),
            _ => Err(EnvError::Missing(vec!["CAKIT_CONTINUE_OPENAI_API_KEY".to_string()])),
        }
    }

    fn global_dir(ctx: &RunContext) -> PathBuf {
        ctx.scratch_path(GLOBAL_DIR)
    }

    fn config_yaml(auth: &Auth<'_>) -> Result<String, String> {
        let mut model = serde_yaml::Mapping::new();
        model.insert("name".into(), "cakit-openai".into());
        model.insert("provider".into(), "openai".into());
        model.insert("model".into(), auth.model.as_str().into());
        model.insert("apiKey".into(), auth.api_key.into());
        if let Some(base_url) = auth.base_url {
            model.insert("apiBase".into(), base_url.into());
        }
        model.insert("roles".into(), serde_yaml::Value::Sequence(vec!["chat".into()]));

        let mut document = serde_yaml::Mapping::new();
        document.insert("name".into(), "CAKIT Continue Config".into());
        document.insert("version".into(), "1.0.0".into());
        document.insert("schema".into(), "v1".into());
        document.insert(
            "models".into(),
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::Mapping(model)]),
        );
        serde_yaml::to_string(&document).map_err(|e| e.to_string())
    }

    /// The session named by the last manifest entry, or the only session
    /// file when there is no manifest.
    fn session_path(sessions: &Path) -> Result<PathBuf, String> {
        let manifest = sessions.join("sessions.json");
        let session_id = if manifest.is_file() {
            let entries = payload::read_json(&manifest)?;
            let last = entries
                .as_array()
                .and_then(|entries| entries.last())
                .ok_or_else(|| "session manifest is empty".to_string())?;
            payload::non_blank(last, "sessionId")?
        } else {
            let mut candidates: Vec<PathBuf> = std::fs::read_dir(sessions)
                .map_err(|e| format!("cannot list {}: {}", sessions.display(), e))?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect();
            if candidates.len() != 1 {
                return Err(format!("expected one session in {}, found {}", sessions.display(), candidates.len()));
            }
            return Ok(candidates.remove(0));
        };
        Ok(sessions.join(format!("{}.json", session_id)))
    }

    fn decode_history(session: &Value) -> Result<RunStats, String> {
        let mut stats = RunStats::default();
        let mut llm_calls = 0u64;
        let mut tool_calls = 0u64;
        for item in payload::array(session, "history")? {
            let message = payload::get(item, "message")?;
            if message.get("role").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            match message.get("toolCalls") {
                None | Some(Value::Null) => {}
                Some(_) => tool_calls += payload::array(message, "toolCalls")?.len() as u64,
            }
            let usage = match message.get("usage") {
                None | Some(Value::Null) => continue,
                Some(usage) => usage,
            };
            let model = payload::non_blank(usage, "model")?;
            let prompt = payload::uint(usage, "prompt_tokens")?;
            let completion = payload::uint(usage, "completion_tokens")?;
            let usage = match usage.get("total_tokens") {
                None | Some(Value::Null) => ModelUsage::summed(prompt, completion),
                Some(_) => ModelUsage::with_total(prompt, completion, payload::uint(usage, "total_tokens")?),
            };
            stats.add_usage(model, usage);
            llm_calls += 1;
        }
        if llm_calls == 0 {
            return Err("session has no assistant usage".to_string());
        }
        stats.llm_calls = Some(llm_calls);
        stats.tool_calls = Some(tool_calls);
        Ok(stats)
    }

    /// Text of the last assistant message with any.
    fn last_assistant_text(session: &Value) -> Option<String> {
        session
            .get("history")?
            .as_array()?
            .iter()
            .rev()
            .filter_map(|item| item.get("message"))
            .filter(|message| message.get("role").and_then(Value::as_str) == Some("assistant"))
            .find_map(|message| match message.get("content")? {
                Value::String(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
                Value::Array(blocks) => {
                    let parts: Vec<&str> = blocks
                        .iter()
                        .filter_map(|block| block.get("text").and_then(Value::as_str))
                        .map(str::trim)
                        .filter(|text| !text.is_empty())
                        .collect();
                    (!parts.is_empty()).then(|| parts.join("\n"))
                }
                _ => None,
            })
    }
}

#[async_trait]
impl AgentAdapter for ContinueAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Continue
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let auth = Self::auth(&ctx.snapshot, ctx.model_override())?;
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set("CONTINUE_GLOBAL_DIR", Self::global_dir(ctx).display().to_string())
            .set("FORCE_NO_TTY", "true")
            .set("OPENAI_API_KEY", auth.api_key)
            .set("OPENAI_MODEL", auth.model.as_str())
            .set_opt("OPENAI_BASE_URL", auth.base_url);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let auth = Self::auth(&ctx.snapshot, ctx.model_override())?;
        let config = Self::global_dir(ctx).join("config.yaml");
        let text = Self::config_yaml(&auth).map_err(|reason| EnvError::Invalid {
            name: "config.yaml".to_string(),
            reason,
        })?;
        if let Some(parent) = config.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config, text)?;
        let spec = ctx
            .command()
            .args(["-p", "--auto", "--config"])
            .arg(config.display().to_string())
            .arg(ctx.prompt());
        Ok(Invocation::new(spec))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let global = Self::global_dir(ctx);
        let stdout = outcome.stdout.trim();
        let stdout_response = (!stdout.is_empty()).then(|| stdout.to_string());

        let mut artifacts = RunArtifactSet::new();
        let log = global.join("logs").join("cn.log");
        let telemetry_log = log.is_file().then(|| log.display().to_string());
        if log.is_file() {
            artifacts.push(ArtifactKind::Telemetry, &log, ctx.run_id.to_string());
        }

        let session = Self::session_path(&global.join("sessions"))
            .and_then(|path| payload::read_json(&path).map(|session| (path, session)));
        let (path, session) = match session {
            Ok(found) => found,
            Err(reason) => {
                warn!("continue: {}", reason);
                let mut stats = RunStats::default().with_response(stdout_response);
                stats.telemetry_log = telemetry_log;
                return Extraction::partial(stats, Some(fail(reason))).with_artifacts(artifacts);
            }
        };

        let response = stdout_response.or_else(|| Self::last_assistant_text(&session));
        let (mut stats, failure) = match Self::decode_history(&session) {
            Ok(stats) => (stats, None),
            Err(reason) => (RunStats::default(), Some(fail(reason))),
        };
        stats.response = response;
        stats.telemetry_log = telemetry_log;
        artifacts.push(ArtifactKind::Session, &path, ctx.run_id.to_string());

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::from_file(&path, session)))
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@continuedev/cli",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let Ok(auth) = Self::auth(snapshot, None) else {
            return Ok(None);
        };
        let Some(dir) = snapshot.dir_or_home("CONTINUE_GLOBAL_DIR", ".continue") else {
            return Ok(None);
        };
        let text = Self::config_yaml(&auth).map_err(InstallError::Serialize)?;
        write_config(&dir.join("config.yaml"), &text).map(Some)
    }
}
