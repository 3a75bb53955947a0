//! OpenAI Codex CLI adapter.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::payload;
use super::{
    write_config, AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy,
    RunContext,
};
use crate::error::{EnvError, ExtractionFailed, InstallError};
use crate::runner::config::ReasoningEffort;
use crate::runner::env::{resolve_model, ComposedEnvironment, EnvSnapshot};
use crate::runner::locator::{date_partition, unique_glob, ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const LAST_MESSAGE_FILE: &str = "last-message.txt";

/// Item types that represent a tool invocation.
const TOOL_ITEM_TYPES: &[&str] = &["command_execution", "mcp_tool_call", "collab_tool_call", "web_search"];

const USAGE_FIELDS: [&str; 5] = [
    "input_tokens",
    "cached_input_tokens",
    "output_tokens",
    "reasoning_output_tokens",
    "total_tokens",
];

pub struct CodexAdapter;

impl CodexAdapter {
    fn home(snapshot: &EnvSnapshot) -> Option<PathBuf> {
        snapshot.dir_or_home("CODEX_HOME", ".codex")
    }

    fn use_oauth(snapshot: &EnvSnapshot) -> bool {
        snapshot.flag("CAKIT_CODEX_USE_OAUTH")
    }

    fn auth_path(snapshot: &EnvSnapshot) -> Option<PathBuf> {
        Self::home(snapshot).map(|home| home.join("auth.json"))
    }

    fn telemetry_endpoint(snapshot: &EnvSnapshot) -> Option<String> {
        snapshot
            .first_of(&["CODEX_OTEL_ENDPOINT", "OTEL_EXPORTER_OTLP_ENDPOINT"])
            .map(str::to_string)
    }

    fn thread_id(events: &[Value]) -> Option<String> {
        events
            .iter()
            .find(|event| payload::event_type(event) == Some("thread.started"))
            .and_then(|event| payload::non_blank(event, "thread_id").ok())
    }

    /// Unique rollout file for the thread in its date partition.
    fn rollout_path(root: &Path, thread_id: &str) -> Result<PathBuf, String> {
        let day = date_partition(&root.join("sessions"), thread_id).map_err(|e| e.to_string())?;
        let pattern = format!(
            "{}/rollout-*-{}.jsonl",
            glob::Pattern::escape(&day.to_string_lossy()),
            thread_id
        );
        unique_glob(&pattern).map_err(|e| e.to_string())
    }

    /// Decodes model and usage from rollout records.
    fn decode_rollout(records: &[Value]) -> Result<RunStats, String> {
        let mut model = None;
        let mut usage = None;
        let mut llm_calls = 0u64;
        let mut last_signature = None;

        for record in records {
            match payload::event_type(record) {
                Some("turn_context") => {
                    if let Ok(name) = payload::get(record, "payload").and_then(|p| payload::non_blank(p, "model")) {
                        model = Some(name);
                    }
                }
                Some("event_msg") => {
                    let Ok(body) = payload::get(record, "payload") else {
                        continue;
                    };
                    if payload::event_type(body) != Some("token_count") {
                        continue;
                    }
                    let total = payload::at(body, &["info", "total_token_usage"])?;
                    let mut fields = [0u64; 5];
                    for (slot, key) in fields.iter_mut().zip(USAGE_FIELDS) {
                        *slot = payload::uint(total, key)?;
                    }
                    let [input, cached, output, reasoning, total_tokens] = fields;
                    let current = ModelUsage::with_total(input + cached, output + reasoning, total_tokens);
                    if last_signature != Some(current) {
                        llm_calls += 1;
                        last_signature = Some(current);
                    }
                    usage = Some(current);
                }
                _ => {}
            }
        }

        let usage = usage.ok_or_else(|| "rollout has no token_count event".to_string())?;
        let model = model.ok_or_else(|| "rollout has no turn_context model".to_string())?;
        let mut stats = RunStats::default();
        stats.add_usage(model, usage);
        stats.llm_calls = Some(llm_calls);
        Ok(stats)
    }

    /// Unique tool item ids. A tool item without an id makes the count unknown.
    fn count_tool_calls(events: &[Value]) -> Option<u64> {
        let mut ids = BTreeSet::new();
        for event in events {
            if !matches!(payload::event_type(event), Some("item.started" | "item.completed")) {
                continue;
            }
            let Some(item) = event.get("item") else {
                continue;
            };
            let is_tool = payload::event_type(item).is_some_and(|t| TOOL_ITEM_TYPES.contains(&t));
            if !is_tool {
                continue;
            }
            ids.insert(payload::non_blank(item, "id").ok()?);
        }
        Some(ids.len() as u64)
    }

    fn has_error_event(events: &[Value]) -> bool {
        events
            .iter()
            .any(|event| matches!(payload::event_type(event), Some("turn.failed" | "error")))
    }

    fn config_toml(snapshot: &EnvSnapshot) -> Result<String, InstallError> {
        use toml::{Table, Value as Toml};

        let mut root = Table::new();
        root.insert("project_root_markers".into(), Toml::Array(Vec::new()));
        if let Some(model) = snapshot.get("CODEX_MODEL") {
            root.insert("model".into(), Toml::String(model.to_string()));
        }
        if !Self::use_oauth(snapshot) && snapshot.get("CODEX_API_KEY").is_some() {
            let mut provider = Table::new();
            provider.insert("name".into(), Toml::String("custom".into()));
            if let Some(base) = snapshot.get("CODEX_API_BASE") {
                provider.insert("base_url".into(), Toml::String(base.to_string()));
            }
            provider.insert("env_key".into(), Toml::String("CODEX_API_KEY".into()));
            provider.insert("wire_api".into(), Toml::String("responses".into()));
            let mut providers = Table::new();
            providers.insert("custom".into(), Toml::Table(provider));
            root.insert("model_provider".into(), Toml::String("custom".into()));
            root.insert("model_providers".into(), Toml::Table(providers));
        }
        if let Some(exporter) = snapshot.get("CODEX_OTEL_EXPORTER") {
            let mut otel = Table::new();
            otel.insert("exporter".into(), Toml::String(exporter.to_string()));
            if let Some(environment) = snapshot.get("CODEX_OTEL_ENVIRONMENT") {
                otel.insert("environment".into(), Toml::String(environment.to_string()));
            }
            if snapshot.get("CODEX_OTEL_LOG_USER_PROMPT").is_some() {
                otel.insert(
                    "log_user_prompt".into(),
                    Toml::Boolean(snapshot.flag("CODEX_OTEL_LOG_USER_PROMPT")),
                );
            }
            if let Some(endpoint) = Self::telemetry_endpoint(snapshot) {
                let mut target = Table::new();
                target.insert("endpoint".into(), Toml::String(endpoint));
                if let Some(protocol) = snapshot.get("CODEX_OTEL_PROTOCOL") {
                    target.insert("protocol".into(), Toml::String(protocol.to_string()));
                }
                let mut exporters = Table::new();
                exporters.insert(exporter.to_string(), Toml::Table(target));
                otel.insert("exporter".into(), Toml::Table(exporters));
            }
            root.insert("otel".into(), Toml::Table(otel));
        }
        toml::to_string(&root).map_err(|e| InstallError::Serialize(e.to_string()))
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: false,
            media: MediaStrategy::Native,
            reasoning_efforts: &ReasoningEffort::ALL,
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let snap = &ctx.snapshot;
        if Self::use_oauth(snap) {
            if let Some(auth) = Self::auth_path(snap).filter(|path| !path.is_file()) {
                return Err(EnvError::AuthMissing {
                    agent: self.kind().to_string(),
                    path: auth,
                });
            }
        }
        let mut env = ComposedEnvironment::base(snap);
        env.pass_through(snap, &["CODEX_HOME"]);
        env.set_opt("OPENAI_BASE_URL", snap.get("CODEX_API_BASE"));
        if !Self::use_oauth(snap) {
            let key = snap.get("CODEX_API_KEY");
            env.set_opt("CODEX_API_KEY", key);
            env.set_opt("OPENAI_API_KEY", key);
        }
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let last_message = ctx.scratch_path(LAST_MESSAGE_FILE);
        let mut spec = ctx.command().args([
            "exec",
            "--json",
            "--dangerously-bypass-approvals-and-sandbox",
            "--skip-git-repo-check",
            "--output-last-message",
        ]);
        spec = spec.arg(last_message.display().to_string());
        if let Some(model) = resolve_model(ctx.model_override(), &ctx.snapshot, "CODEX_MODEL", None) {
            spec = spec.arg("--model").arg(model);
        }
        if let Some(effort) = ctx.reasoning_effort {
            spec = spec.arg("-c").arg(format!("model_reasoning_effort={}", effort));
        }
        if !ctx.media.images.is_empty() {
            let joined: Vec<String> = ctx.media.images.iter().map(|p| p.display().to_string()).collect();
            spec = spec.arg("--image").arg(joined.join(","));
        }
        Ok(Invocation::new(spec.arg("-").with_stdin(ctx.prompt())))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let events = payload::json_objects(&outcome.stdout);
        let error_event = Self::has_error_event(&events);

        let Some(thread_id) = Self::thread_id(&events) else {
            return Extraction::new(Err(fail("no thread.started event in output".to_string())))
                .with_error_event(error_event);
        };
        let Some(root) = Self::home(&ctx.snapshot) else {
            return Extraction::new(Err(fail("home directory is not set".to_string()))).with_error_event(error_event);
        };
        let rollout = match Self::rollout_path(&root, &thread_id) {
            Ok(path) => path,
            Err(reason) => {
                warn!("codex: rollout for thread {} not located: {}", thread_id, reason);
                return Extraction::new(Err(fail(reason))).with_error_event(error_event);
            }
        };
        debug!("Codex thread {} rollout {}", thread_id, rollout.display());

        let mut artifacts = RunArtifactSet::new();
        artifacts.push(ArtifactKind::Session, &rollout, thread_id.as_str());
        let records = match payload::read_json_lines(&rollout) {
            Ok(records) => records,
            Err(reason) => {
                return Extraction::new(Err(fail(reason)))
                    .with_artifacts(artifacts)
                    .with_error_event(error_event)
            }
        };

        let stats = Self::decode_rollout(&records).map(|mut stats| {
            stats.tool_calls = Self::count_tool_calls(&events);
            stats.telemetry_log = Self::telemetry_endpoint(&ctx.snapshot);
            let response = std::fs::read_to_string(ctx.scratch_path(LAST_MESSAGE_FILE)).ok();
            stats.with_response(response)
        });

        Extraction::new(stats.map_err(fail))
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::from_file(&rollout, Value::Array(records))))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@openai/codex",
        }
    }

    fn configure(&self, snapshot: &EnvSnapshot) -> Result<Option<PathBuf>, InstallError> {
        let Some(home) = Self::home(snapshot) else {
            return Ok(None);
        };
        let text = Self::config_toml(snapshot)?;
        write_config(&home.join("config.toml"), &text).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use std::fs;
    use tempfile::TempDir;

    const THREAD_A: &str = "01946967-d500-7000-8000-0000000000aa";
    const THREAD_B: &str = "01946967-d500-7000-8000-0000000000bb";

    const STDOUT: &str = r#"{"type":"thread.started","thread_id":"01946967-d500-7000-8000-0000000000aa"}
{"type":"turn.started"}
{"type":"item.started","item":{"id":"item_1","type":"command_execution","command":"ls"}}
{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"ls"}}
{"type":"item.completed","item":{"id":"item_2","type":"agent_message","text":"done"}}
{"type":"item.completed","item":{"id":"item_3","type":"web_search","query":"rust"}}
{"type":"turn.completed","usage":{"input_tokens":1}}"#;

    fn rollout(model: &str, totals: &[(u64, u64)]) -> String {
        let mut lines = vec![format!(
            r#"{{"type":"turn_context","payload":{{"model":"{}","cwd":"/w"}}}}"#,
            model
        )];
        for (input, output) in totals {
            lines.push(format!(
                r#"{{"type":"event_msg","payload":{{"type":"token_count","info":{{"total_token_usage":{{"input_tokens":{},"cached_input_tokens":10,"output_tokens":{},"reasoning_output_tokens":5,"total_tokens":{}}}}}}}}}"#,
                input,
                output,
                input + output + 15
            ));
        }
        lines.join("\n")
    }

    fn write_rollout(home: &Path, thread: &str, body: &str) {
        let day = home.join("sessions/2025/01/15");
        fs::create_dir_all(&day).unwrap();
        fs::write(day.join(format!("rollout-2025-01-15T10-00-00-{}.jsonl", thread)), body).unwrap();
    }

    #[test]
    fn test_build_command_puts_prompt_on_stdin() {
        let work = TempDir::new().unwrap();
        let mut ctx = context(AgentKind::Codex, work.path(), work.path(), &[("CODEX_MODEL", "gpt-5")]);
        ctx.reasoning_effort = Some(ReasoningEffort::High);
        ctx.media.images = vec![PathBuf::from("/a.png"), PathBuf::from("/b.png")];
        let env = CodexAdapter.compose_environment(&ctx).unwrap();
        let spec = CodexAdapter.build_command(&ctx, &env).unwrap().spec;
        assert_eq!(spec.stdin.as_deref(), Some("fix the tests"));
        assert_eq!(spec.args.last().map(String::as_str), Some("-"));
        let line = spec.args.join(" ");
        assert!(line.contains("--model gpt-5"));
        assert!(line.contains("-c model_reasoning_effort=high"));
        assert!(line.contains("--image /a.png,/b.png"));
    }

    #[test]
    fn test_oauth_suppresses_api_key() {
        let work = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        fs::write(home.path().join("auth.json"), "{}").unwrap();
        let vars = [
            ("CODEX_HOME", home.path().to_str().unwrap()),
            ("CODEX_API_KEY", "sk-1"),
            ("CODEX_API_BASE", "https://proxy"),
            ("CAKIT_CODEX_USE_OAUTH", "true"),
        ];
        let ctx = context(AgentKind::Codex, work.path(), work.path(), &vars);
        let env = CodexAdapter.compose_environment(&ctx).unwrap();
        assert!(!env.contains("OPENAI_API_KEY"));
        assert!(!env.contains("CODEX_API_KEY"));
        assert_eq!(env.get("OPENAI_BASE_URL"), Some("https://proxy"));
    }

    #[test]
    fn test_oauth_without_auth_file_is_refused() {
        let work = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let vars = [
            ("CODEX_HOME", home.path().to_str().unwrap()),
            ("CAKIT_CODEX_USE_OAUTH", "1"),
        ];
        let ctx = context(AgentKind::Codex, work.path(), work.path(), &vars);
        let err = CodexAdapter.compose_environment(&ctx).unwrap_err();
        assert!(matches!(&err, EnvError::AuthMissing { path, .. } if path == &home.path().join("auth.json")));
        assert!(err.to_string().contains("run `codex login`"));
    }

    #[tokio::test]
    async fn test_extract_resolves_own_rollout_only() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        write_rollout(home.path(), THREAD_A, &rollout("gpt-5", &[(100, 20), (100, 20), (300, 40)]));
        write_rollout(home.path(), THREAD_B, &rollout("o3", &[(999, 999)]));
        fs::write(scratch.path().join(LAST_MESSAGE_FILE), "  All done.\n").unwrap();

        let ctx = context(
            AgentKind::Codex,
            work.path(),
            scratch.path(),
            &[("CODEX_HOME", home.path().to_str().unwrap())],
        );
        let env = CodexAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(STDOUT, "", 0);
        let extraction = CodexAdapter.extract_stats(&ctx, &env, &outcome).await;

        let stats = extraction.result().unwrap();
        assert_eq!(stats.models_usage.len(), 1);
        let usage = stats.models_usage["gpt-5"];
        assert_eq!(usage.prompt_tokens, 310);
        assert_eq!(usage.completion_tokens, 45);
        assert_eq!(usage.total_tokens, 355);
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.tool_calls, Some(2));
        assert_eq!(stats.response.as_deref(), Some("All done."));
        assert!(!extraction.error_event);
        let session = extraction.artifacts.first(ArtifactKind::Session).unwrap();
        assert!(session.path.to_string_lossy().ends_with(&format!("{}.jsonl", THREAD_A)));
    }

    #[tokio::test]
    async fn test_non_v7_thread_has_no_artifacts() {
        let work = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        let ctx = context(
            AgentKind::Codex,
            work.path(),
            work.path(),
            &[("CODEX_HOME", home.path().to_str().unwrap())],
        );
        let env = CodexAdapter.compose_environment(&ctx).unwrap();
        let stdout = r#"{"type":"thread.started","thread_id":"9b2f7e0e-3a7c-4b7e-8d5e-6c1f2a3b4c5d"}
{"type":"turn.failed","error":{"message":"quota"}}"#;
        let outcome = ProcessOutcome::from_parts(stdout, "", 0);
        let extraction = CodexAdapter.extract_stats(&ctx, &env, &outcome).await;
        assert!(extraction.failure.is_some());
        assert!(extraction.artifacts.is_empty());
        assert!(extraction.error_event);
    }

    #[test]
    fn test_tool_item_without_id_is_unknown() {
        let events = payload::json_objects(r#"{"type":"item.completed","item":{"type":"command_execution"}}"#);
        assert_eq!(CodexAdapter::count_tool_calls(&events), None);
        assert_eq!(CodexAdapter::count_tool_calls(&[]), Some(0));
    }

    #[test]
    fn test_incomplete_usage_fails() {
        let records = payload::json_objects(
            r#"{"type":"turn_context","payload":{"model":"gpt-5"}}
{"type":"event_msg","payload":{"type":"token_count","info":{"total_token_usage":{"input_tokens":1}}}}"#,
        );
        let err = CodexAdapter::decode_rollout(&records).unwrap_err();
        assert!(err.contains("cached_input_tokens"));
    }

    #[test]
    fn test_configure_writes_toml() {
        let home = TempDir::new().unwrap();
        let codex_home = home.path().join("codex");
        let snap = EnvSnapshot::from_pairs([
            ("CODEX_HOME", codex_home.to_str().unwrap()),
            ("CODEX_MODEL", "gpt-5"),
            ("CODEX_API_KEY", "sk-1"),
            ("CODEX_API_BASE", "https://proxy/v1"),
        ]);
        let path = CodexAdapter.configure(&snap).unwrap().unwrap();
        let parsed: toml::Table = fs::read_to_string(path).unwrap().parse().unwrap();
        assert_eq!(parsed["model"].as_str(), Some("gpt-5"));
        assert_eq!(parsed["model_provider"].as_str(), Some("custom"));
        assert_eq!(
            parsed["model_providers"]["custom"]["base_url"].as_str(),
            Some("https://proxy/v1")
        );
        assert_eq!(parsed["project_root_markers"].as_array().map(Vec::len), Some(0));
        assert!(parsed.get("otel").is_none());
    }

    #[test]
    fn test_configure_writes_otel_exporter_table() {
        let home = TempDir::new().unwrap();
        let snap = EnvSnapshot::from_pairs([
            ("CODEX_HOME", home.path().to_str().unwrap()),
            ("CODEX_OTEL_EXPORTER", "otlp-http"),
            ("CODEX_OTEL_ENDPOINT", "http://localhost:4318/v1/logs"),
            ("CODEX_OTEL_PROTOCOL", "binary"),
            ("CODEX_OTEL_ENVIRONMENT", "ci"),
        ]);
        let path = CodexAdapter.configure(&snap).unwrap().unwrap();
        let parsed: toml::Table = fs::read_to_string(path).unwrap().parse().unwrap();
        let otel = &parsed["otel"];
        assert_eq!(otel["environment"].as_str(), Some("ci"));
        let target = &otel["exporter"]["otlp-http"];
        assert_eq!(target["endpoint"].as_str(), Some("http://localhost:4318/v1/logs"));
        assert_eq!(target["protocol"].as_str(), Some("binary"));
    }

    #[test]
    fn test_exporter_without_endpoint_stays_a_name() {
        let snap = EnvSnapshot::from_pairs([("CODEX_OTEL_EXPORTER", "none")]);
        let parsed: toml::Table = CodexAdapter::config_toml(&snap).unwrap().parse().unwrap();
        assert_eq!(parsed["otel"]["exporter"].as_str(), Some("none"));
    }
}
