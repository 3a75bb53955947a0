//! OpenCode adapter.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::process::{ProcessOutcome, ProcessRunner, ProcessSpec};
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const PROVIDER_ID: &str = "cakit-openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MODALITIES: [&str; 5] = ["text", "audio", "image", "video", "pdf"];
const EXPORT_TIMEOUT: Duration = Duration::from_secs(120);

/// Model and provider settings for one run.
#[derive(Debug, Clone, Default, PartialEq)]
struct Settings {
    /// `provider/model` passed to `--model`.
    model: Option<String>,
    api_key: Option<String>,
    /// Generated provider config, set when an API key is given.
    config_content: Option<Value>,
}

impl Settings {
    fn resolve(snapshot: &EnvSnapshot, model_override: Option<&str>) -> Result<Self, EnvError> {
        let explicit = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| snapshot.get("CAKIT_OPENCODE_MODEL"));
        let default_model = snapshot.get("OPENAI_DEFAULT_MODEL");
        let raw_model = explicit.or(default_model);
        let provider = snapshot
            .get("CAKIT_OPENCODE_PROVIDER")
            .or_else(|| (explicit.is_none() && default_model.is_some()).then_some("openai"));
        let api_key = snapshot.get("CAKIT_OPENCODE_OPENAI_API_KEY");
        let base_url = snapshot.get("CAKIT_OPENCODE_OPENAI_BASE_URL");
        let capabilities = parse_capabilities(snapshot.get("CAKIT_OPENCODE_MODEL_CAPABILITIES"))?;

        let mut req = Requirements::new();
        if base_url.is_some() {
            req.require(api_key, "CAKIT_OPENCODE_OPENAI_API_KEY");
        }
        if api_key.is_some() || base_url.is_some() {
            req.require(raw_model, "CAKIT_OPENCODE_MODEL");
        }
        req.finish()?;

        let model = match raw_model {
            Some(raw) => Some(qualify_model(raw, provider)?),
            None => None,
        };
        let Some(api_key) = api_key else {
            return Ok(Self {
                model,
                ..Self::default()
            });
        };

        let model_id = model
            .as_deref()
            .and_then(|m| m.split_once('/'))
            .map(|(_, id)| id.to_string())
            .unwrap_or_default();
        let mut entry = json!({
            "name": model_id,
            "attachment": true,
            "reasoning": true,
            "temperature": true,
            "tool_call": true,
            "limit": {"context": 262144, "output": 32768},
        });
        if let Some(input) = capabilities {
            entry["modalities"] = json!({"input": input, "output": ["text"]});
        }
        let config = json!({
            "$schema": "https://opencode.ai/config.json",
            "model": format!("{}/{}", PROVIDER_ID, model_id),
            "provider": {
                PROVIDER_ID: {
                    "name": "CAKIT OpenAI Compatible",
                    "npm": "@ai-sdk/openai-compatible",
                    "options": {"apiKey": api_key, "baseURL": base_url.unwrap_or(DEFAULT_BASE_URL)},
                    "models": { model_id.clone(): entry },
                }
            },
        });
        Ok(Self {
            model: Some(format!("{}/{}", PROVIDER_ID, model_id)),
            api_key: Some(api_key.to_string()),
            config_content: Some(config),
        })
    }
}

/// Normalizes `provider/model`, `provider:model` or a bare model with a provider.
fn qualify_model(raw: &str, provider: Option<&str>) -> Result<String, EnvError> {
    let (provider_id, model_id) = match raw.split_once('/').or_else(|| raw.split_once(':')) {
        Some(pair) => pair,
        None => match provider {
            Some(provider) => (provider, raw),
            None => return Err(EnvError::Missing(vec!["CAKIT_OPENCODE_PROVIDER".to_string()])),
        },
    };
    let (provider_id, model_id) = (provider_id.trim(), model_id.trim());
    if provider_id.is_empty() || model_id.is_empty() {
        return Err(EnvError::Invalid {
            name: "CAKIT_OPENCODE_MODEL".to_string(),
            reason: "expected provider/model or provider:model".to_string(),
        });
    }
    Ok(format!("{}/{}", provider_id, model_id))
}

/// Input modalities declared for a custom model. Text is always included.
fn parse_capabilities(raw: Option<&str>) -> Result<Option<Vec<&'static str>>, EnvError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let mut declared: BTreeSet<String> = BTreeSet::new();
    for token in raw.split(',').map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()) {
        if !MODALITIES.contains(&token.as_str()) {
            return Err(EnvError::Invalid {
                name: "CAKIT_OPENCODE_MODEL_CAPABILITIES".to_string(),
                reason: format!("unknown value '{}' (allowed: {})", token, MODALITIES.join(",")),
            });
        }
        declared.insert(token);
    }
    declared.insert("text".to_string());
    Ok(Some(
        MODALITIES.iter().copied().filter(|m| declared.contains(*m)).collect(),
    ))
}

pub struct OpencodeAdapter;

impl OpencodeAdapter {
    /// The one session id carried by stream events.
    pub(super) fn session_id(events: &[Value]) -> Result<String, String> {
        let mut ids = BTreeSet::new();
        for event in events.iter().filter(|e| e.get("sessionID").is_some()) {
            ids.insert(payload::non_blank(event, "sessionID")?);
        }
        match ids.len() {
            1 => ids.pop_first().ok_or_else(|| "no sessionID in output".to_string()),
            0 => Err("no sessionID in output".to_string()),
            n => Err(format!("output carries {} distinct sessionID values", n)),
        }
    }

    pub(super) fn stream_response(events: &[Value]) -> Option<String> {
        events
            .iter()
            .filter(|e| payload::event_type(e) == Some("text"))
            .filter_map(|e| e.get("part"))
            .filter(|part| payload::event_type(part) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .last()
            .map(str::to_string)
    }

    fn decode_export(export: &Value) -> Result<RunStats, String> {
        let messages = payload::array(export, "messages")?;
        let mut stats = RunStats::default();
        let mut llm_calls = 0;
        let mut tool_calls = 0;
        let mut cost = 0.0;
        for message in messages {
            let info = payload::get(message, "info")?;
            let parts = payload::array(message, "parts")?;
            match payload::string(info, "role")? {
                "assistant" => {}
                "user" => continue,
                other => return Err(format!("unexpected message role '{}'", other)),
            }
            let model = format!(
                "{}/{}",
                payload::non_blank(info, "providerID")?,
                payload::non_blank(info, "modelID")?
            );
            cost += payload::number(info, "cost")?;
            let tokens = payload::get(info, "tokens")?;
            let cache = payload::get(tokens, "cache")?;
            let prompt = payload::uint(tokens, "input")? + payload::uint(cache, "read")? + payload::uint(cache, "write")?;
            let completion = payload::uint(tokens, "output")? + payload::uint(tokens, "reasoning")?;
            let usage = match tokens.get("total") {
                None | Some(Value::Null) => ModelUsage::summed(prompt, completion),
                Some(_) => ModelUsage::with_total(prompt, completion, payload::uint(tokens, "total")?),
            };
            stats.add_usage(model, usage);
            llm_calls += 1;
            for part in parts {
                if payload::string(part, "type")? == "tool" {
                    tool_calls += 1;
                }
            }
        }
        if llm_calls == 0 {
            return Err("export has no assistant messages".to_string());
        }
        stats.llm_calls = Some(llm_calls);
        stats.tool_calls = Some(tool_calls);
        stats.total_cost = Some(cost);
        Ok(stats)
    }

    pub(super) async fn export(ctx: &RunContext, env: &ComposedEnvironment, session_id: &str) -> Result<Value, String> {
        let spec = ProcessSpec::new(&ctx.binary, ctx.workdir()).arg("export").arg(session_id);
        let outcome = ProcessRunner::new()
            .run(&spec, env, Some(EXPORT_TIMEOUT))
            .await
            .map_err(|e| e.to_string())?;
        if !outcome.is_success() {
            return Err(format!("export exited with code {}", outcome.exit_code));
        }
        payload::terminal_object(&outcome.stdout)
    }
}

#[async_trait]
impl AgentAdapter for OpencodeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Opencode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: true,
            media: MediaStrategy::Native,
            reasoning_efforts: &[],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let settings = Settings::resolve(&ctx.snapshot, ctx.model_override())?;
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set("OPENCODE_DISABLE_AUTOUPDATE", "1");
        if let Some(api_key) = &settings.api_key {
            env.set("OPENAI_API_KEY", api_key.as_str());
            for (var, dir) in [
                ("XDG_DATA_HOME", "data"),
                ("XDG_CACHE_HOME", "cache"),
                ("XDG_CONFIG_HOME", "config"),
                ("XDG_STATE_HOME", "state"),
            ] {
                env.set(var, ctx.scratch_path(dir).display().to_string());
            }
        }
        if let Some(config) = &settings.config_content {
            env.set("OPENCODE_CONFIG_CONTENT", serde_json::to_string(config)?);
        }
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let settings = Settings::resolve(&ctx.snapshot, ctx.model_override())?;
        let mut spec = ctx.command().args(["run", "--format", "json"]);
        if let Some(model) = settings.model {
            spec = spec.arg("--model").arg(model);
        }
        for path in ctx.media.all() {
            spec = spec.arg("--file").arg(path.display().to_string());
        }
        Ok(Invocation::new(spec.arg("--").arg(ctx.prompt())))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let events = payload::json_objects(&outcome.stdout);
        let error_event = events.iter().any(|e| payload::event_type(e) == Some("error"));
        let response = Self::stream_response(&events);

        let session_id = match Self::session_id(&events) {
            Ok(id) => id,
            Err(reason) => return Extraction::new(Err(fail(reason))).with_error_event(error_event),
        };
        debug!("OpenCode session {}", session_id);
        let export = match Self::export(ctx, env, &session_id).await {
            Ok(export) => export,
            Err(reason) => {
                warn!("opencode: export of {} failed: {}", session_id, reason);
                return Extraction::new(Err(fail(reason))).with_error_event(error_event);
            }
        };

        let stats = Self::decode_export(&export).map(|stats| stats.with_response(response));
        Extraction::new(stats.map_err(fail))
            .with_trajectory(Some(TrajectorySource::labelled(format!("opencode session {}", session_id), export)))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm { package: "opencode-ai" }
    }
}
