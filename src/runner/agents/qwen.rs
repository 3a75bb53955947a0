//! Qwen Code adapter. Output shape matches the Gemini CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::gemini::{extract, headless_args, SYMBOLIC_MEDIA, TELEMETRY_FILE};
use super::{
    media_prompt, write_json_config, AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation,
    MediaStrategy, RunContext,
};
use crate::error::{EnvError, InstallError};
use crate::runner::env::{resolve_model, ComposedEnvironment, EnvSnapshot};
use crate::runner::process::ProcessOutcome;

pub struct QwenAdapter;

impl QwenAdapter {
    fn model(ctx: &RunContext) -> Option<String> {
        resolve_model(ctx.model_override(), &ctx.snapshot, "QWEN_OPENAI_MODEL", None)
    }

    /// Web search providers, with the default chosen by priority.
    fn web_search(snapshot: &EnvSnapshot) -> Value {
        let mut providers = vec![json!({"type": "dashscope"})];
        let mut default = "dashscope";
        if let Some(key) = snapshot.get("TAVILY_API_KEY") {
            providers.push(json!({"type": "tavily", "apiKey": key}));
            default = "tavily";
        }
        let google = (
            snapshot.get("CAKIT_QWEN_GOOGLE_API_KEY"),
            snapshot.get("GOOGLE_SEARCH_ENGINE_ID"),
        );
        if let (Some(key), Some(engine)) = google {
            providers.push(json!({"type": "google", "apiKey": key, "searchEngineId": engine}));
            if default == "dashscope" {
                default = "google";
            }
        }
        json!({"provider": providers, "default": default})
    }
}

#[async_trait]
impl AgentAdapter for QwenAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Qwen
    }

    fn capabilities(&self) -> Capabilities {
        SYMBOLIC_MEDIA
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let snap = &ctx.snapshot;
        let mut env = ComposedEnvironment::base(snap);
        let base_url = snap.get("QWEN_OPENAI_BASE_URL");
        env.set_opt("OPENAI_API_KEY", snap.get("QWEN_OPENAI_API_KEY"))
            .set_opt("OPENAI_BASE_URL", base_url)
            .set_opt("OPENAI_API_BASE", base_url)
            .set_opt("OPENAI_MODEL", Self::model(ctx).as_deref())
            .set_opt("GOOGLE_API_KEY", snap.get("CAKIT_QWEN_GOOGLE_API_KEY"))
            .pass_through(snap, &["TAVILY_API_KEY", "GOOGLE_SEARCH_ENGINE_ID"]);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let (prompt, staged) = media_prompt(ctx, MediaStrategy::Symbolic)?;
        let mut spec = headless_args(ctx.command(), &prompt, &ctx.scratch_path(TELEMETRY_FILE));
        if let Some(model) = Self::model(ctx) {
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
            package: "@qwen-code/qwen-code",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let Some(dir) = snapshot.home().map(|home| home.join(".qwen")) else {
            return Ok(None);
        };
        let settings = json!({
            "webSearch": Self::web_search(snapshot),
            "permissions": {
                "defaultMode": "yolo",
                "confirmShellCommands": false,
                "confirmFileEdits": false,
            },
            "telemetry": {
                "enabled": true,
                "target": "local",
                "otlpEndpoint": "",
                "logPrompts": true,
                "outfile": dir.join(TELEMETRY_FILE).display().to_string(),
            },
        });
        write_json_config(&dir.join("settings.json"), &settings).map(Some)
    }
}
