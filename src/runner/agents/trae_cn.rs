//! Trae CLI (China release, `traecli`) adapter.
//!
//! `traecli --print --json` prints one document holding `token_usage`, the
//! model and every agent state with its messages. Model settings live in
//! `$XDG_CONFIG_HOME/trae_cli/trae_cli.yaml`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::payload;
use super::{write_config, AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext};
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::runner::env::{ComposedEnvironment, EnvSnapshot};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

/// Config root used outside of runs, relative to home.
const CONFIG_ROOT: &str = ".config/cakit/trae-cn";
const DEFAULT_MODEL_NAME: &str = "cakit-openai";

/// OpenAI-compatible model entry for `trae_cli.yaml`.
struct ModelConfig<'a> {
    api_key: &'a str,
    base_url: &'a str,
    model: String,
    name: &'a str,
    by_azure: bool,
}

impl<'a> ModelConfig<'a> {
    /// `None` unless key, base URL and model are all set.
    fn resolve(snapshot: &'a EnvSnapshot, model_override: Option<&str>) -> Option<Self> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| snapshot.get("CAKIT_TRAE_CN_MODEL"))?;
        Some(Self {
            api_key: snapshot.get("CAKIT_TRAE_CN_API_KEY")?,
            base_url: snapshot.get("CAKIT_TRAE_CN_BASE_URL")?,
            model: model.to_string(),
            name: snapshot.get("CAKIT_TRAE_CN_MODEL_NAME").unwrap_or(DEFAULT_MODEL_NAME),
            by_azure: snapshot.flag("CAKIT_TRAE_CN_BY_AZURE"),
        })
    }

    fn yaml(&self) -> Result<String, String> {
        let mut open_ai = serde_yaml::Mapping::new();
        open_ai.insert("base_url".into(), self.base_url.into());
        open_ai.insert("api_key".into(), self.api_key.into());
        open_ai.insert("model".into(), self.model.as_str().into());
        open_ai.insert("by_azure".into(), self.by_azure.into());

        let mut entry = serde_yaml::Mapping::new();
        entry.insert("name".into(), self.name.into());
        entry.insert("open_ai".into(), serde_yaml::Value::Mapping(open_ai));

        let mut selected = serde_yaml::Mapping::new();
        selected.insert("name".into(), self.name.into());

        let mut document = serde_yaml::Mapping::new();
        document.insert("model".into(), serde_yaml::Value::Mapping(selected));
        document.insert(
            "models".into(),
            serde_yaml::Value::Sequence(vec![serde_yaml::Value::Mapping(entry)]),
        );
        serde_yaml::to_string(&document).map_err(|e| e.to_string())
    }
}

fn config_file(root: &Path) -> PathBuf {
    root.join("trae_cli").join("trae_cli.yaml")
}

pub struct TraeCnAdapter;

impl TraeCnAdapter {
    /// Scratch when the run carries its own model settings, else the configured root.
    fn config_root(ctx: &RunContext) -> Option<PathBuf> {
        match ModelConfig::resolve(&ctx.snapshot, ctx.model_override()) {
            Some(_) => Some(ctx.scratch_path("config")),
            None => ctx.snapshot.home().map(|home| home.join(CONFIG_ROOT)),
        }
    }

    fn messages(result: &Value) -> Result<Vec<&Value>, String> {
        let mut messages = Vec::new();
        for state in payload::array(result, "agent_states")? {
            messages.extend(payload::array(state, "messages")?);
        }
        Ok(messages)
    }

    fn decode(result: &Value, configured_model: Option<&str>) -> Result<RunStats, String> {
        let model = match payload::opt_string(result, "model")?.map(str::trim).filter(|m| !m.is_empty()) {
            Some(model) => model.to_string(),
            None => configured_model
                .map(str::to_string)
                .ok_or_else(|| "missing field 'model'".to_string())?,
        };
        let usage = payload::get(result, "token_usage")?;
        let usage = ModelUsage::with_total(
            payload::uint(usage, "prompt_tokens")?,
            payload::uint(usage, "completion_tokens")?,
            payload::uint(usage, "total_tokens")?,
        );

        let mut llm_calls = 0;
        let mut tool_calls = 0;
        for message in Self::messages(result)? {
            if message.get("role").and_then(Value::as_str) == Some("assistant") {
                llm_calls += 1;
            }
            match message.get("tool_calls") {
                None | Some(Value::Null) => {}
                Some(_) => tool_calls += payload::array(message, "tool_calls")?.len() as u64,
            }
        }

        let mut stats = RunStats::default();
        stats.add_usage(model, usage);
        stats.llm_calls = Some(llm_calls);
        stats.tool_calls = Some(tool_calls);
        Ok(stats)
    }

    /// Last non-blank assistant text, else the document's `error`.
    fn response(result: &Value) -> Option<String> {
        let from_messages = Self::messages(result).ok().and_then(|messages| {
            messages
                .into_iter()
                .rev()
                .filter(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
                .filter_map(|m| m.get("content").and_then(Value::as_str))
                .map(str::trim)
                .find(|text| !text.is_empty())
                .map(str::to_string)
        });
        from_messages.or_else(|| Self::error_text(result))
    }

    fn error_text(result: &Value) -> Option<String> {
        result
            .get("error")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl AgentAdapter for TraeCnAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::TraeCn
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let root = Self::config_root(ctx).ok_or_else(|| EnvError::Missing(vec!["HOME".to_string()]))?;
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set("XDG_CONFIG_HOME", root.display().to_string());
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        if let Some(config) = ModelConfig::resolve(&ctx.snapshot, ctx.model_override()) {
            let text = config.yaml().map_err(|reason| EnvError::Invalid {
                name: "trae_cli.yaml".to_string(),
                reason,
            })?;
            let path = config_file(&ctx.scratch_path("config"));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, text)?;
        }
        let spec = ctx.command().args(["--print", "--json", "--yolo"]).arg(ctx.prompt());
        Ok(Invocation::new(spec))
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
        let error_event = Self::error_text(&result).is_some();
        let response = Self::response(&result);
        let configured_model = ModelConfig::resolve(&ctx.snapshot, ctx.model_override()).map(|c| c.model);

        let (stats, failure) = match Self::decode(&result, configured_model.as_deref()) {
            Ok(stats) => (stats.with_response(response), None),
            Err(reason) => (RunStats::default().with_response(response), Some(fail(reason))),
        };
        Extraction::partial(stats, failure)
            .with_trajectory(Some(TrajectorySource::labelled("stdout result", result)))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Archive {
            latest_url: "https://lf-cdn.trae.com.cn/obj/trae-com-cn/trae-cli/trae-cli_latest_version.txt",
            url_template: "https://lf-cdn.trae.com.cn/obj/trae-com-cn/trae-cli/trae-cli_{version}_{os}_{arch}.tar.gz",
            entry: "trae-cli",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let (Some(config), Some(home)) = (ModelConfig::resolve(snapshot, None), snapshot.home()) else {
            return Ok(None);
        };
        let text = config.yaml().map_err(InstallError::Serialize)?;
        write_config(&config_file(&home.join(CONFIG_ROOT)), &text).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use std::fs;
    use tempfile::TempDir;

    const VARS: [(&str, &str); 3] = [
        ("CAKIT_TRAE_CN_API_KEY", "sk-t"),
        ("CAKIT_TRAE_CN_BASE_URL", "https://ark.example/v3"),
        ("CAKIT_TRAE_CN_MODEL", "doubao-seed-1.6"),
    ];

    const RESULT: &str = r#"{"model":"doubao-seed-1.6","token_usage":{"prompt_tokens":5000,"completion_tokens":400,"total_tokens":5400},
"agent_states":[{"messages":[
 {"role":"user","content":"fix the tests"},
 {"role":"assistant","content":"","tool_calls":[{"id":"1"},{"id":"2"}]},
 {"role":"tool","content":"ok","tool_calls":null},
 {"role":"assistant","content":"All green."}
]}]}"#;

    #[test]
    fn test_decode_result() {
        let result: Value = serde_json::from_str(RESULT).unwrap();
        let stats = TraeCnAdapter::decode(&result, None).unwrap();
        assert_eq!(stats.models_usage["doubao-seed-1.6"].total_tokens, 5400);
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.tool_calls, Some(2));
        assert_eq!(TraeCnAdapter::response(&result).as_deref(), Some("All green."));
    }

    #[test]
    fn test_model_falls_back_to_configured() {
        let mut result: Value = serde_json::from_str(RESULT).unwrap();
        result.as_object_mut().unwrap().remove("model");
        assert_eq!(TraeCnAdapter::decode(&result, None).unwrap_err(), "missing field 'model'");
        let stats = TraeCnAdapter::decode(&result, Some("glm-4.6")).unwrap();
        assert!(stats.models_usage.contains_key("glm-4.6"));
    }

    #[test]
    fn test_token_usage_is_required() {
        let mut result: Value = serde_json::from_str(RESULT).unwrap();
        result.as_object_mut().unwrap().remove("token_usage");
        assert_eq!(
            TraeCnAdapter::decode(&result, None).unwrap_err(),
            "missing field 'token_usage'"
        );
    }

    #[test]
    fn test_run_config_written_to_scratch() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let ctx = context(AgentKind::TraeCn, work.path(), scratch.path(), &VARS);
        let env = TraeCnAdapter.compose_environment(&ctx).unwrap();
        let root = scratch.path().join("config");
        assert_eq!(env.get("XDG_CONFIG_HOME"), Some(root.to_str().unwrap()));

        let spec = TraeCnAdapter.build_command(&ctx, &env).unwrap().spec;
        assert_eq!(spec.args, vec!["--print", "--json", "--yolo", "fix the tests"]);
        let yaml: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(config_file(&root)).unwrap()).unwrap();
        assert_eq!(yaml["model"]["name"].as_str(), Some(DEFAULT_MODEL_NAME));
        assert_eq!(yaml["models"][0]["open_ai"]["model"].as_str(), Some("doubao-seed-1.6"));
        assert_eq!(yaml["models"][0]["open_ai"]["by_azure"].as_bool(), Some(false));
    }

    #[test]
    fn test_without_settings_uses_configured_root() {
        let work = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let ctx = context(
            AgentKind::TraeCn,
            work.path(),
            work.path(),
            &[("HOME", home.path().to_str().unwrap())],
        );
        let env = TraeCnAdapter.compose_environment(&ctx).unwrap();
        assert_eq!(
            env.get("XDG_CONFIG_HOME"),
            Some(home.path().join(CONFIG_ROOT).to_str().unwrap())
        );
        TraeCnAdapter.build_command(&ctx, &env).unwrap();
        assert!(!work.path().join("config").exists());
    }

    #[tokio::test]
    async fn test_error_document_is_error_event() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::TraeCn, work.path(), work.path(), &VARS);
        let env = TraeCnAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(r#"{"error":"model not found","agent_states":[]}"#, "", 0);
        let extraction = TraeCnAdapter.extract_stats(&ctx, &env, &outcome).await;
        assert!(extraction.error_event);
        assert!(extraction.failure.is_some());
        assert_eq!(extraction.stats.response.as_deref(), Some("model not found"));
    }
}
