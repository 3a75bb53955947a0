//! Factory Droid CLI adapter.
//!
//! `droid exec --output-format json` prints one terminal `type == "result"`
//! object with usage, turn count and session id. Tool calls come from the
//! session transcript under `~/.factory/sessions`.
//!
//! Bring-your-own-key runs register a custom model in
//! `~/.factory/settings.json` and select it as `custom:CAKIT-BYOK-<index>`.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::payload;
use super::{
    media_prompt, AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy,
    RunContext,
};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::config::ReasoningEffort;
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::locator::{unique_named_file, ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const PASS_THROUGH: &[&str] = &[
    "FACTORY_API_KEY",
    "FACTORY_API_BASE_URL",
    "FACTORY_TOKEN",
    "FACTORY_LOG_FILE",
    "FACTORY_DISABLE_KEYRING",
];

const BYOK_DISPLAY_NAME: &str = "CAKIT BYOK";
const BYOK_PROVIDERS: &[&str] = &["openai", "anthropic", "generic-chat-completion-api"];

pub struct FactoryAdapter;

/// A custom model to register for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Byok {
    model: String,
    api_key: String,
    base_url: String,
    provider: String,
}

impl FactoryAdapter {
    fn factory_dir(snapshot: &EnvSnapshot) -> Option<PathBuf> {
        snapshot.home().map(|home| home.join(".factory"))
    }

    fn model(ctx: &RunContext) -> Option<String> {
        ctx.model_override()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .or_else(|| ctx.snapshot.get("CAKIT_FACTORY_MODEL"))
            .map(str::to_string)
    }

    /// Resolves the BYOK settings. `None` unless a `CAKIT_FACTORY_BYOK_*`
    /// variable is set.
    fn byok(ctx: &RunContext) -> Result<Option<Byok>, EnvError> {
        let snap = &ctx.snapshot;
        let provider = snap.get("CAKIT_FACTORY_BYOK_PROVIDER");
        let requested = provider.is_some()
            || snap.get("CAKIT_FACTORY_BYOK_API_KEY").is_some()
            || snap.get("CAKIT_FACTORY_BYOK_BASE_URL").is_some();
        if !requested {
            return Ok(None);
        }

        let model = Self::model(ctx).or_else(|| snap.get("OPENAI_DEFAULT_MODEL").map(str::to_string));
        let mut req = Requirements::new();
        let api_key = req.require(
            snap.first_of(&["CAKIT_FACTORY_BYOK_API_KEY", "OPENAI_API_KEY"]),
            "CAKIT_FACTORY_BYOK_API_KEY (or OPENAI_API_KEY)",
        );
        let base_url = req.require(
            snap.first_of(&["CAKIT_FACTORY_BYOK_BASE_URL", "OPENAI_BASE_URL"]),
            "CAKIT_FACTORY_BYOK_BASE_URL (or OPENAI_BASE_URL)",
        );
        req.require(model.as_deref(), "CAKIT_FACTORY_MODEL (or OPENAI_DEFAULT_MODEL)");
        req.finish()?;
        let (Some(api_key), Some(base_url), Some(model)) = (api_key, base_url, model) else {
            return Ok(None);
        };

        let provider = match provider {
            Some(name) if BYOK_PROVIDERS.contains(&name) => name.to_string(),
            Some(_) => {
                return Err(EnvError::Invalid {
                    name: "CAKIT_FACTORY_BYOK_PROVIDER".to_string(),
                    reason: format!("expected one of {}", BYOK_PROVIDERS.join(", ")),
                })
            }
            None => Self::provider_for(base_url).to_string(),
        };
        Ok(Some(Byok {
            model,
            api_key: api_key.to_string(),
            base_url: base_url.to_string(),
            provider,
        }))
    }

    fn provider_for(base_url: &str) -> &'static str {
        let lowered = base_url.to_lowercase();
        if lowered.contains("api.anthropic.com") {
            "anthropic"
        } else if lowered.contains("api.openai.com") {
            "openai"
        } else {
            "generic-chat-completion-api"
        }
    }

    /// Replaces any earlier BYOK entry in `customModels` and returns the
    /// model id that selects the new one.
    fn upsert_custom_model(settings_path: &Path, byok: &Byok) -> Result<String, EnvError> {
        let invalid = |reason: String| EnvError::Invalid {
            name: settings_path.display().to_string(),
            reason,
        };
        let mut settings = match std::fs::read_to_string(settings_path) {
            Ok(text) => serde_json::from_str::<Value>(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
            Err(e) => return Err(e.into()),
        };
        let root = settings
            .as_object_mut()
            .ok_or_else(|| invalid("settings are not a JSON object".to_string()))?;
        let mut models = match root.remove("customModels") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(models)) => models,
            Some(_) => return Err(invalid("customModels is not a list".to_string())),
        };
        models.retain(|entry| {
            entry.get("displayName").and_then(Value::as_str).map(str::trim) != Some(BYOK_DISPLAY_NAME)
        });
        models.push(json!({
            "model": byok.model,
            "displayName": BYOK_DISPLAY_NAME,
            "baseUrl": byok.base_url,
            "apiKey": byok.api_key,
            "provider": byok.provider,
        }));
        let index = models.len() - 1;
        root.insert("customModels".to_string(), Value::Array(models));

        let dir = settings_path
            .parent()
            .ok_or_else(|| invalid("settings path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)?;
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(staged, "{}", serde_json::to_string_pretty(&settings)?)?;
        staged.persist(settings_path).map_err(|e| EnvError::Scratch(e.error))?;
        debug!("Registered Factory custom model at {}", settings_path.display());
        Ok(format!("custom:{}-{}", BYOK_DISPLAY_NAME.replace(' ', "-"), index))
    }

    /// The terminal result object; anything else on the last line fails.
    fn result_object(stdout: &str) -> Result<Value, String> {
        let result = payload::terminal_object(stdout)?;
        match payload::event_type(&result) {
            Some("result") => Ok(result),
            _ => Err("last stdout object is not a result event".to_string()),
        }
    }

    fn decode_usage(result: &Value) -> Result<ModelUsage, String> {
        let usage = payload::get(result, "usage")?;
        let prompt = payload::uint(usage, "input_tokens")?
            + payload::uint(usage, "cache_read_input_tokens")?
            + payload::uint(usage, "cache_creation_input_tokens")?;
        Ok(ModelUsage::summed(prompt, payload::uint(usage, "output_tokens")?))
    }

    /// Model from the result, else from the session's settings file.
    fn model_name(result: &Value, settings: Option<&Path>) -> Result<String, String> {
        if let Some(model) = payload::opt_string(result, "model")?.map(str::trim) {
            if !model.is_empty() {
                return Ok(model.to_string());
            }
        }
        let settings = settings.ok_or_else(|| "no model in result and no session settings".to_string())?;
        payload::non_blank(&payload::read_json(settings)?, "model")
    }

    /// Counts `tool_call` items (distinct by id) and `PreToolUse` hook events.
    fn count_tool_calls(lines: &[Value]) -> Result<u64, String> {
        fn walk<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
            match value {
                Value::Object(map) => {
                    out.push(value);
                    map.values().for_each(|v| walk(v, out));
                }
                Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
                _ => {}
            }
        }
        let mut objects = Vec::new();
        lines.iter().for_each(|line| walk(line, &mut objects));

        let mut ids = BTreeSet::new();
        let mut anonymous = 0u64;
        for item in objects {
            if payload::event_type(item) == Some("tool_call") {
                match item.get("id").and_then(Value::as_str).map(str::trim) {
                    Some(id) if !id.is_empty() => {
                        ids.insert(id.to_string());
                    }
                    _ => anonymous += 1,
                }
            } else if item.get("hook_event_name").and_then(Value::as_str) == Some("PreToolUse") {
                payload::non_blank(item, "tool_name")?;
                anonymous += 1;
            }
        }
        Ok(anonymous + ids.len() as u64)
    }

    fn session_file(snapshot: &EnvSnapshot, session_id: &str, suffix: &str) -> Result<PathBuf, String> {
        let root = Self::factory_dir(snapshot)
            .ok_or_else(|| "home directory is not set".to_string())?
            .join("sessions");
        unique_named_file(&root, &format!("{}{}", session_id, suffix), 3).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl AgentAdapter for FactoryAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Factory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: false,
            media: MediaStrategy::Natural { tool: "Read" },
            reasoning_efforts: &[ReasoningEffort::Low, ReasoningEffort::Medium, ReasoningEffort::High],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        Self::byok(ctx)?;
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.pass_through(&ctx.snapshot, PASS_THROUGH);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let model = match Self::byok(ctx)? {
            Some(byok) => {
                let settings = Self::factory_dir(&ctx.snapshot)
                    .ok_or_else(|| EnvError::Missing(vec!["HOME".to_string()]))?
                    .join("settings.json");
                Some(Self::upsert_custom_model(&settings, &byok)?)
            }
            None => Self::model(ctx),
        };
        let (prompt, staged) = media_prompt(ctx, MediaStrategy::Natural { tool: "Read" })?;
        let mut spec = ctx
            .command()
            .args(["exec", "--output-format", "json", "--cwd"])
            .arg(ctx.workdir().display().to_string());
        if let Some(model) = model {
            spec = spec.arg("--model").arg(model);
        }
        if let Some(effort) = ctx.reasoning_effort {
            spec = spec.arg("--reasoning-effort").arg(effort.as_str());
        }
        Ok(Invocation::new(spec.arg(prompt)).with_staged_media(staged))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let result = match Self::result_object(&outcome.stdout) {
            Ok(result) => result,
            Err(reason) => return Extraction::new(Err(fail(reason))),
        };
        let error_event = result.get("is_error").and_then(Value::as_bool) == Some(true);

        let mut stats = RunStats::default().with_response(
            result
                .get("result")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string),
        );
        stats.total_cost = result.get("total_cost").filter(|v| v.is_number()).and_then(Value::as_f64);
        stats.telemetry_log = env.get("FACTORY_LOG_FILE").map(str::to_string);

        let mut failure = None;
        let session_id = payload::non_blank(&result, "session_id");
        let settings = session_id
            .as_ref()
            .ok()
            .and_then(|id| Self::session_file(&ctx.snapshot, id, ".settings.json").ok());
        match Self::decode_usage(&result).and_then(|usage| Ok((usage, Self::model_name(&result, settings.as_deref())?)))
        {
            Ok((usage, model)) => stats.add_usage(model, usage),
            Err(reason) => failure = Some(fail(reason)),
        }
        match payload::uint(&result, "num_turns") {
            Ok(turns) => stats.llm_calls = Some(turns),
            Err(reason) => {
                failure.get_or_insert_with(|| fail(reason));
            }
        }

        let mut artifacts = RunArtifactSet::new();
        let mut trajectory = Some(TrajectorySource::labelled("stdout result", result.clone()));
        let transcript = session_id.and_then(|id| {
            let path = Self::session_file(&ctx.snapshot, &id, ".jsonl")?;
            Ok((id, path))
        });
        match transcript {
            Ok((id, path)) => match payload::read_json_lines(&path).and_then(|lines| {
                let count = Self::count_tool_calls(&lines)?;
                Ok((lines, count))
            }) {
                Ok((lines, count)) => {
                    stats.tool_calls = Some(count);
                    artifacts.push(ArtifactKind::Session, &path, id);
                    trajectory = Some(TrajectorySource::from_file(&path, Value::Array(lines)));
                }
                Err(reason) => {
                    warn!("factory: {}", reason);
                    failure.get_or_insert_with(|| fail(reason));
                }
            },
            Err(reason) => warn!("factory: session transcript unavailable: {}", reason),
        }

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(trajectory)
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Script {
            url: "https://app.factory.ai/cli",
            version_env: None,
        }
    }
}
