//! Block Goose adapter.
//!
//! `goose run` streams JSON events; usage and the conversation come from
//! `goose session export` for the session this run created.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::payload;
use super::{
    media_prompt, AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy,
    RunContext,
};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::process::{ProcessOutcome, ProcessRunner, ProcessSpec};
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const IMAGE_TOOL: &str = "developer__image_processor";

const EXPORT_TIMEOUT: Duration = Duration::from_secs(120);

const TOOL_REQUEST_TYPES: &[&str] = &["toolRequest", "frontendToolRequest"];

static SESSION_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();

pub struct GooseAdapter;

impl GooseAdapter {
    /// Session name generated for this run.
    pub fn session_name(ctx: &RunContext) -> String {
        format!("cakit-goose-{}", ctx.run_id.simple())
    }

    fn session_id(stdout: &str) -> Option<String> {
        payload::cached_regex(&SESSION_ID_RE, r"(?i)session id:\s*(\S+)")?
            .captures(stdout)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Splits an OpenAI base URL into goose's host and base path.
    fn openai_endpoint(base_url: &str) -> Result<(String, String), EnvError> {
        let invalid = || EnvError::Invalid {
            name: "CAKIT_GOOSE_OPENAI_BASE_URL".to_string(),
            reason: format!("'{}' is not an absolute URL", base_url),
        };
        let (scheme, rest) = base_url.split_once("://").ok_or_else(invalid)?;
        let (netloc, path) = rest.split_once('/').unwrap_or((rest, ""));
        if scheme.is_empty() || netloc.is_empty() {
            return Err(invalid());
        }
        let path = path.trim_matches('/');
        let path = if path.is_empty() || path == "v1" {
            "v1/chat/completions"
        } else {
            path
        };
        Ok((format!("{}://{}", scheme, netloc), path.to_string()))
    }

    /// Messages of an exported session: a list, or an object with `messages`.
    fn messages(session: &Value) -> Result<&Vec<Value>, String> {
        let conversation = payload::get(session, "conversation")?;
        match conversation {
            Value::Array(messages) => Ok(messages),
            Value::Object(_) => payload::array(conversation, "messages"),
            _ => Err("field 'conversation' is neither a list nor an object".to_string()),
        }
    }

    fn is_assistant(message: &Value) -> bool {
        message.get("role").and_then(Value::as_str) == Some("assistant")
    }

    /// Joined non-blank `text` items of a message.
    fn message_text(message: &Value) -> Option<String> {
        let chunks: Vec<&str> = message
            .get("content")?
            .as_array()?
            .iter()
            .filter(|item| payload::event_type(item) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect();
        (!chunks.is_empty()).then(|| chunks.join("\n"))
    }

    fn count_tool_requests(messages: &[Value]) -> Result<u64, String> {
        let mut count = 0;
        for message in messages.iter().filter(|m| Self::is_assistant(m)) {
            for item in payload::array(message, "content")? {
                let kind = payload::string(item, "type")?;
                if TOOL_REQUEST_TYPES.contains(&kind) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Text chunks of the most recent assistant message in the stream.
    fn stream_response(events: &[Value]) -> Option<String> {
        let mut chunks: BTreeMap<String, String> = BTreeMap::new();
        let mut latest = None;
        for event in events.iter().filter(|e| payload::event_type(e) == Some("message")) {
            let Some(message) = event.get("message").filter(|m| Self::is_assistant(m)) else {
                continue;
            };
            let (Ok(id), Some(text)) = (payload::non_blank(message, "id"), Self::message_text(message)) else {
                continue;
            };
            chunks.entry(id.clone()).or_default().push_str(&text);
            latest = Some(id);
        }
        latest.and_then(|id| chunks.remove(&id))
    }

    fn stream_model(events: &[Value]) -> Option<String> {
        events
            .iter()
            .filter(|e| payload::event_type(e) == Some("model_change"))
            .filter_map(|e| payload::non_blank(e, "model").ok())
            .last()
    }

    fn decode(events: &[Value], session: &Value) -> Result<RunStats, String> {
        let model = match Self::stream_model(events) {
            Some(model) => model,
            None => payload::non_blank(payload::get(session, "model_config")?, "model_name")?,
        };
        let usage = ModelUsage::with_total(
            payload::uint(session, "accumulated_input_tokens")?,
            payload::uint(session, "accumulated_output_tokens")?,
            payload::uint(session, "accumulated_total_tokens")?,
        );
        let messages = Self::messages(session)?;

        let mut stats = RunStats::default();
        stats.add_usage(model, usage);
        stats.llm_calls = Some(messages.iter().filter(|m| Self::is_assistant(m)).count() as u64);
        stats.tool_calls = Some(Self::count_tool_requests(messages)?);
        let response = messages
            .iter()
            .rev()
            .filter(|m| Self::is_assistant(m))
            .find_map(Self::message_text)
            .or_else(|| Self::stream_response(events));
        Ok(stats.with_response(response))
    }

    async fn export_session(
        ctx: &RunContext,
        env: &ComposedEnvironment,
        session_id: Option<&str>,
    ) -> Result<Value, String> {
        let mut spec = ProcessSpec::new(&ctx.binary, ctx.workdir()).args(["session", "export", "--format", "json"]);
        spec = match session_id {
            Some(id) => spec.arg("--session-id").arg(id),
            None => spec.arg("--name").arg(Self::session_name(ctx)),
        };
        let outcome = ProcessRunner::new()
            .run(&spec, env, Some(EXPORT_TIMEOUT))
            .await
            .map_err(|e| e.to_string())?;
        if !outcome.is_success() {
            return Err(format!("session export exited with code {}", outcome.exit_code));
        }
        payload::terminal_object(&outcome.stdout)
    }

    fn provider(snapshot: &EnvSnapshot) -> Option<&str> {
        snapshot.first_of(&["CAKIT_GOOSE_PROVIDER", "GOOSE_PROVIDER"])
    }

    fn model(ctx: &RunContext) -> Option<String> {
        ctx.model_override()
            .map(str::to_string)
            .or_else(|| {
                ctx.snapshot
                    .first_of(&["CAKIT_GOOSE_MODEL", "GOOSE_MODEL", "OPENAI_DEFAULT_MODEL"])
                    .map(str::to_string)
            })
    }
}

#[async_trait]
impl AgentAdapter for GooseAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Goose
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: true,
            media: MediaStrategy::Natural { tool: IMAGE_TOOL },
            reasoning_efforts: &[],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let snap = &ctx.snapshot;
        let configured = snap
            .first_of(&[
                "CAKIT_GOOSE_PROVIDER",
                "CAKIT_GOOSE_MODEL",
                "CAKIT_GOOSE_OPENAI_API_KEY",
                "CAKIT_GOOSE_OPENAI_BASE_URL",
                "CAKIT_GOOSE_OPENAI_BASE_PATH",
                "OPENAI_API_KEY",
                "OPENAI_BASE_URL",
                "OPENAI_DEFAULT_MODEL",
            ])
            .is_some();
        let mut provider = Self::provider(snap).map(str::to_string);
        if provider.is_none() && configured {
            provider = Some("openai".to_string());
        }
        let model = Self::model(ctx);
        let api_key = snap.first_of(&["CAKIT_GOOSE_OPENAI_API_KEY", "OPENAI_API_KEY"]);
        let mut host = snap.get("OPENAI_HOST").map(str::to_string);
        let mut base_path = snap
            .first_of(&["CAKIT_GOOSE_OPENAI_BASE_PATH", "OPENAI_BASE_PATH"])
            .map(str::to_string);
        if let Some(base_url) = snap.first_of(&["CAKIT_GOOSE_OPENAI_BASE_URL", "OPENAI_BASE_URL"]) {
            let (derived_host, derived_path) = Self::openai_endpoint(base_url)?;
            host.get_or_insert(derived_host);
            base_path.get_or_insert(derived_path);
        }

        if configured {
            let mut req = Requirements::new();
            req.require(provider.as_deref(), "CAKIT_GOOSE_PROVIDER");
            req.require(model.as_deref(), "CAKIT_GOOSE_MODEL");
            if provider.as_deref() == Some("openai") {
                req.require(api_key, "CAKIT_GOOSE_OPENAI_API_KEY");
            }
            req.finish()?;
        }

        let mut env = ComposedEnvironment::base(snap);
        env.set("GOOSE_MODE", "auto")
            .set_opt("GOOSE_PROVIDER", provider.as_deref())
            .set_opt("GOOSE_MODEL", model.as_deref())
            .set_opt("OPENAI_API_KEY", api_key)
            .set_opt("OPENAI_HOST", host.as_deref())
            .set_opt("OPENAI_BASE_PATH", base_path.as_deref());
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let (prompt, _) = media_prompt(ctx, self.capabilities().media)?;
        let mut spec = ctx
            .command()
            .args(["run", "-t"])
            .arg(prompt)
            .arg("--name")
            .arg(Self::session_name(ctx))
            .args(["--with-builtin", "developer", "--output-format", "stream-json"]);
        if let Some(provider) = env.get("GOOSE_PROVIDER") {
            spec = spec.arg("--provider").arg(provider);
        }
        if let Some(model) = env.get("GOOSE_MODEL") {
            spec = spec.arg("--model").arg(model);
        }
        Ok(Invocation::new(spec))
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
        let session_id = Self::session_id(&outcome.stdout);
        debug!("Goose session id {:?}, name {}", session_id, Self::session_name(ctx));

        let session = match Self::export_session(ctx, env, session_id.as_deref()).await {
            Ok(session) => session,
            Err(reason) => {
                warn!("goose: session export failed: {}", reason);
                return Extraction::new(Err(fail(reason))).with_error_event(error_event);
            }
        };
        let label = format!(
            "goose session {}",
            session_id.unwrap_or_else(|| Self::session_name(ctx))
        );
        let stats = Self::decode(&events, &session);
        Extraction::new(stats.map_err(fail))
            .with_trajectory(Some(TrajectorySource::labelled(label, session)))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Script {
            url: "https://github.com/block/goose/releases/download/stable/download_cli.sh",
            version_env: Some("GOOSE_VERSION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::{context, script};
    use serde_json::json;
    use tempfile::TempDir;

    fn session() -> Value {
        json!({
            "accumulated_input_tokens": 1200,
            "accumulated_output_tokens": 300,
            "accumulated_total_tokens": 1500,
            "conversation": [
                {"content": [{"text": "fix the tests", "type": "text"}], "role": "user"},
                {"content": [{"text": "Looking.", "type": "text"}, {"type": "toolRequest"}], "role": "assistant"},
                {"content": [{"type": "toolResponse"}], "role": "user"},
                {"content": [{"text": "Fixed.", "type": "text"}], "role": "assistant"}
            ],
            "model_config": {"model_name": "gpt-4.1"}
        })
    }

    #[test]
    fn test_decode_session() {
        let stats = GooseAdapter::decode(&[], &session()).unwrap();
        assert_eq!(stats.models_usage["gpt-4.1"].total_tokens, 1500);
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.tool_calls, Some(1));
        assert_eq!(stats.response.as_deref(), Some("Fixed."));
    }

    #[test]
    fn test_stream_model_wins_and_messages_object() {
        let events = payload::json_objects(r#"{"type":"model_change","model":"claude-sonnet-4"}"#);
        let mut session = session();
        let conversation = session["conversation"].take();
        session["conversation"] = json!({ "messages": conversation });
        let stats = GooseAdapter::decode(&events, &session).unwrap();
        assert!(stats.models_usage.contains_key("claude-sonnet-4"));
        assert_eq!(stats.llm_calls, Some(2));
    }

    #[test]
    fn test_stream_response_concatenates_latest_message() {
        let events = payload::json_objects(
            r#"{"type":"message","message":{"id":"a","role":"assistant","content":[{"type":"text","text":"old"}]}}
{"type":"message","message":{"id":"b","role":"assistant","content":[{"type":"text","text":"Hel"}]}}
{"type":"message","message":{"id":"b","role":"assistant","content":[{"type":"text","text":"lo"}]}}"#,
        );
        assert_eq!(GooseAdapter::stream_response(&events).as_deref(), Some("Hello"));
    }

    #[test]
    fn test_openai_settings_require_key() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Goose, work.path(), work.path(), &[("CAKIT_GOOSE_MODEL", "gpt-4.1")]);
        match GooseAdapter.compose_environment(&ctx) {
            Err(EnvError::Missing(names)) => assert_eq!(names, vec!["CAKIT_GOOSE_OPENAI_API_KEY"]),
            other => panic!("unexpected {:?}", other),
        }

        let ctx = context(
            AgentKind::Goose,
            work.path(),
            work.path(),
            &[
                ("CAKIT_GOOSE_MODEL", "gpt-4.1"),
                ("CAKIT_GOOSE_OPENAI_API_KEY", "sk-g"),
                ("CAKIT_GOOSE_OPENAI_BASE_URL", "https://llm.internal/v1"),
            ],
        );
        let env = GooseAdapter.compose_environment(&ctx).unwrap();
        assert_eq!(env.get("GOOSE_MODE"), Some("auto"));
        assert_eq!(env.get("GOOSE_PROVIDER"), Some("openai"));
        assert_eq!(env.get("OPENAI_HOST"), Some("https://llm.internal"));
        assert_eq!(env.get("OPENAI_BASE_PATH"), Some("v1/chat/completions"));

        let spec = GooseAdapter.build_command(&ctx, &env).unwrap().spec;
        assert!(spec.args.contains(&"cakit-goose-0f8fad5bd9cb469fa16570867728950e".to_string()));
        assert!(spec.args.ends_with(&[
            "--provider".to_string(),
            "openai".to_string(),
            "--model".to_string(),
            "gpt-4.1".to_string()
        ]));
    }

    #[tokio::test]
    async fn test_extract_exports_printed_session() {
        let work = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let exported = session().to_string();
        let body = format!(
            "if [ \"$4\" = \"json\" ] && [ \"$5\" = \"--session-id\" ] && [ \"$6\" = \"20250115_1\" ]; then\n  echo '{}'\nelse\n  exit 3\nfi",
            exported
        );
        let mut ctx = context(AgentKind::Goose, work.path(), work.path(), &[]);
        ctx.binary = script(bin.path(), "goose", &body);
        let env = GooseAdapter.compose_environment(&ctx).unwrap();
        let stdout = "starting session | provider: openai model: gpt-4.1\n    session id: 20250115_1\n{\"type\":\"complete\"}\n";
        let outcome = ProcessOutcome::from_parts(stdout, "", 0);

        let extraction = GooseAdapter.extract_stats(&ctx, &env, &outcome).await;
        let stats = extraction.result().unwrap();
        assert_eq!(stats.tool_calls, Some(1));
        assert!(!extraction.error_event);
        assert_eq!(extraction.trajectory.unwrap().label, "goose session 20250115_1");
    }
}
