//! Charm Crush adapter.
//!
//! Crush keeps its sessions in a SQLite database. Each run gets its own
//! data directory under the scratch dir, so the database holds exactly
//! this run's sessions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{write_json_config, AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext};
use crate::error::{EnvError, ExtractionFailed, InstallError, StoreError};
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::{stdout_only, ProcessOutcome};
use crate::runner::result::{ModelUsage, RunStats};
use crate::storage::crush_store::DB_FILE;
use crate::storage::CrushStore;
use crate::trajectory::TrajectorySource;

/// Provider id used in generated configuration.
pub const PROVIDER_ID: &str = "cakit-openai";

const DATA_DIR: &str = "data";
const CONFIG_DIR: &str = "config";
const CONFIG_FILE: &str = "crush.json";

/// Explicit OpenAI-compatible provider settings.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProviderSettings {
    api_key: String,
    base_url: String,
    model: String,
}

impl ProviderSettings {
    /// `None` when none of the trio is set. Setting any requires all three.
    fn resolve(snapshot: &EnvSnapshot, model_override: Option<&str>) -> Result<Option<Self>, EnvError> {
        let api_key = snapshot.get("CRUSH_OPENAI_API_KEY");
        let base_url = snapshot.get("CRUSH_OPENAI_BASE_URL");
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| snapshot.get("CAKIT_CRUSH_MODEL"));
        if api_key.is_none() && base_url.is_none() && model.is_none() {
            return Ok(None);
        }

        let mut req = Requirements::new();
        let api_key = req.require(api_key, "CRUSH_OPENAI_API_KEY");
        let base_url = req.require(base_url, "CRUSH_OPENAI_BASE_URL");
        let model = req.require(model, "CAKIT_CRUSH_MODEL");
        req.finish()?;
        match (api_key, base_url, model) {
            (Some(api_key), Some(base_url), Some(model)) => Ok(Some(Self {
                api_key: api_key.to_string(),
                base_url: base_url.to_string(),
                model: model.to_string(),
            })),
            _ => Ok(None),
        }
    }

    /// `provider/model`, qualifying bare names with the generated provider.
    fn provider_model(&self) -> String {
        if self.model.contains('/') {
            self.model.clone()
        } else {
            format!("{}/{}", PROVIDER_ID, self.model)
        }
    }

    fn config(&self) -> Value {
        let model = json!({"provider": PROVIDER_ID, "model": self.model});
        json!({
            "$schema": "https://charm.land/crush.json",
            "options": {
                "disable_provider_auto_update": true,
                "disable_default_providers": true,
            },
            "providers": {
                PROVIDER_ID: {
                    "name": "CAKIT OpenAI Compatible",
                    "type": "openai-compat",
                    "base_url": "$CRUSH_OPENAI_BASE_URL",
                    "api_key": "$CRUSH_OPENAI_API_KEY",
                    "models": [{"id": self.model, "name": self.model}],
                }
            },
            "models": {"large": model.clone(), "small": model},
        })
    }
}

pub struct CrushAdapter;

impl CrushAdapter {
    fn data_dir(ctx: &RunContext) -> PathBuf {
        ctx.scratch_path(DATA_DIR)
    }

    async fn read_store(data_dir: &Path) -> Result<(RunStats, Value), StoreError> {
        let store = CrushStore::open(data_dir).await?;
        let totals = store.totals().await;
        let messages = match &totals {
            Ok(totals) => store.messages(&totals.root.id).await,
            Err(_) => Ok(Vec::new()),
        };
        store.close().await;
        let totals = totals?;
        let messages = messages?;

        let mut stats = RunStats::default();
        stats.add_usage(
            totals.model.clone(),
            ModelUsage::summed(totals.prompt_tokens, totals.completion_tokens),
        );
        stats.llm_calls = Some(totals.llm_calls);
        stats.tool_calls = Some(totals.tool_calls);
        stats.total_cost = Some(totals.cost);
        let trace = json!({"session": totals.root, "messages": messages});
        Ok((stats, trace))
    }
}

#[async_trait]
impl AgentAdapter for CrushAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Crush
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set("CRUSH_DISABLE_PROVIDER_AUTO_UPDATE", "1");
        if let Some(settings) = ProviderSettings::resolve(&ctx.snapshot, ctx.model_override())? {
            env.set("CRUSH_OPENAI_API_KEY", settings.api_key.as_str())
                .set("CRUSH_OPENAI_BASE_URL", settings.base_url.as_str())
                .set("CRUSH_GLOBAL_CONFIG", ctx.scratch_path(CONFIG_DIR).display().to_string())
                .set("CRUSH_GLOBAL_DATA", Self::data_dir(ctx).display().to_string());
        }
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let data_dir = Self::data_dir(ctx);
        std::fs::create_dir_all(&data_dir)?;

        let mut spec = ctx
            .command()
            .arg("--cwd")
            .arg(ctx.workdir().display().to_string())
            .arg("--data-dir")
            .arg(data_dir.display().to_string())
            .args(["run", "--quiet"]);
        if let Some(settings) = ProviderSettings::resolve(&ctx.snapshot, ctx.model_override())? {
            let config_dir = ctx.scratch_path(CONFIG_DIR);
            std::fs::create_dir_all(&config_dir)?;
            let text = serde_json::to_string_pretty(&settings.config())?;
            std::fs::write(config_dir.join(CONFIG_FILE), format!("{}\n", text))?;
            let model = settings.provider_model();
            spec = spec.arg("--model").arg(model.as_str()).arg("--small-model").arg(model);
        }
        Ok(Invocation::new(spec.arg(ctx.prompt())))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let data_dir = Self::data_dir(ctx);
        let db_path = data_dir.join(DB_FILE);
        let mut artifacts = RunArtifactSet::new();
        let log_path = data_dir.join("logs").join("crush.log");
        if log_path.is_file() {
            artifacts.push(ArtifactKind::Log, &log_path, ctx.run_id.to_string());
        }

        match Self::read_store(&data_dir).await {
            Ok((stats, trace)) => {
                debug!("Crush store {} decoded", db_path.display());
                artifacts.push(ArtifactKind::Store, &db_path, ctx.run_id.to_string());
                let stats = stats.with_response(Some(stdout_only(&outcome.stdout).to_string()));
                Extraction::new(Ok(stats))
                    .with_artifacts(artifacts)
                    .with_trajectory(Some(TrajectorySource::from_file(&db_path, trace)))
            }
            Err(e) => {
                warn!("crush: {}", e);
                Extraction::new(Err(ExtractionFailed::new(self.kind().as_str(), e.to_string())))
                    .with_artifacts(artifacts)
            }
        }
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@charmland/crush",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let Some(settings) = ProviderSettings::resolve(snapshot, None)? else {
            return Ok(None);
        };
        let Some(home) = snapshot.home() else {
            return Ok(None);
        };
        let path = home.join(".config").join("crush").join(CONFIG_FILE);
        write_json_config(&path, &settings.config()).map(Some)
    }
}
