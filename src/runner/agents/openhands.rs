//! OpenHands CLI adapter.
//!
//! A headless run prints its conversation id; the conversation directory
//! holds `base_state.json` with accumulated metrics and one JSON file per event.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::payload;
use super::{AgentAdapter, AgentKind, Extraction, InstallPlan, Invocation, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{resolve_model, ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::locator::{sorted_files, ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

static CONVERSATION_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();

const ERROR_EVENT_KINDS: &[&str] = &["ConversationErrorEvent", "AgentErrorEvent"];

pub struct OpenhandsAdapter;

impl OpenhandsAdapter {
    /// Normalized 32-character conversation id printed by the CLI.
    fn conversation_id(output: &str) -> Option<String> {
        let raw = payload::cached_regex(&CONVERSATION_ID_RE, r"Conversation ID:\s*([0-9a-fA-F-]{32,36})")?
            .captures(output)?
            .get(1)?
            .as_str()
            .to_lowercase()
            .replace('-', "");
        (raw.len() == 32).then_some(raw)
    }

    fn conversations_root(snapshot: &EnvSnapshot) -> Option<PathBuf> {
        if let Some(dir) = snapshot.get("OPENHANDS_CONVERSATIONS_DIR") {
            return Some(snapshot.expand(dir));
        }
        if let Some(dir) = snapshot.get("OPENHANDS_PERSISTENCE_DIR") {
            return Some(snapshot.expand(dir).join("conversations"));
        }
        snapshot.home().map(|home| home.join(".openhands").join("conversations"))
    }

    /// Base state and events of one conversation directory.
    fn load(dir: &Path) -> Result<(Value, Vec<Value>), String> {
        let base_state = payload::read_json(&dir.join("base_state.json"))?;
        let events_dir = dir.join("events");
        if !events_dir.is_dir() {
            return Err(format!("{} has no events directory", dir.display()));
        }
        let events = sorted_files(&events_dir, "event-*.json")
            .iter()
            .map(|path| payload::read_json(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((base_state, events))
    }

    fn text_items(content: &Value) -> Option<String> {
        let parts: Vec<&str> = content
            .as_array()?
            .iter()
            .filter(|item| payload::event_type(item) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }

    fn kind_of(value: &Value) -> Option<&str> {
        value.get("kind").and_then(Value::as_str)
    }

    /// Last finish observation text, else the last agent message.
    fn response(events: &[Value]) -> Option<String> {
        let mut finish = None;
        let mut message = None;
        for event in events {
            match Self::kind_of(event) {
                Some("ObservationEvent") => {
                    let Some(observation) = event.get("observation") else {
                        continue;
                    };
                    if Self::kind_of(observation) == Some("FinishObservation") {
                        if let Some(text) = observation.get("content").and_then(Self::text_items) {
                            finish = Some(text);
                        }
                    }
                }
                Some("MessageEvent") if event.get("source").and_then(Value::as_str) == Some("agent") => {
                    let Some(llm_message) = event.get("llm_message") else {
                        continue;
                    };
                    if llm_message.get("role").and_then(Value::as_str) != Some("assistant") {
                        continue;
                    }
                    if let Some(text) = llm_message.get("content").and_then(Self::text_items) {
                        message = Some(text);
                    }
                }
                _ => {}
            }
        }
        finish.or(message)
    }

    fn decode(base_state: &Value, events: &[Value]) -> Result<RunStats, String> {
        let agent = payload::at(base_state, &["stats", "usage_to_metrics", "agent"])?;
        let model = payload::non_blank(agent, "model_name")?;
        let accumulated = payload::get(agent, "accumulated_token_usage")?;
        let usage = ModelUsage::summed(
            payload::uint(accumulated, "prompt_tokens")?,
            payload::uint(accumulated, "completion_tokens")?,
        );

        let mut tool_calls = 0;
        for event in events.iter().filter(|e| Self::kind_of(e) == Some("ActionEvent")) {
            payload::non_blank(event, "tool_name")?;
            tool_calls += 1;
        }

        let mut stats = RunStats::default();
        stats.add_usage(model, usage);
        stats.llm_calls = Some(payload::array(agent, "token_usages")?.len() as u64);
        stats.tool_calls = Some(tool_calls);
        stats.total_cost = Some(payload::number(agent, "accumulated_cost")?);
        Ok(stats.with_response(Self::response(events)))
    }

    fn model(ctx: &RunContext) -> Option<String> {
        let model = resolve_model(ctx.model_override(), &ctx.snapshot, "LLM_MODEL", None)?;
        if !model.contains('/') && ctx.snapshot.get("LLM_BASE_URL").is_some() {
            return Some(format!("openai/{}", model));
        }
        Some(model)
    }
}

#[async_trait]
impl AgentAdapter for OpenhandsAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Openhands
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let model = Self::model(ctx);
        let mut req = Requirements::new();
        let api_key = req.require(ctx.snapshot.get("LLM_API_KEY"), "LLM_API_KEY");
        req.require(model.as_deref(), "LLM_MODEL");
        req.finish()?;

        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.set_opt("LLM_API_KEY", api_key)
            .set_opt("LLM_MODEL", model.as_deref())
            .pass_through(
                &ctx.snapshot,
                &["LLM_BASE_URL", "OPENHANDS_CONVERSATIONS_DIR", "OPENHANDS_PERSISTENCE_DIR"],
            );
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let spec = ctx
            .command()
            .args(["--headless", "--json", "--override-with-envs", "-t"])
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
        let Some(conversation_id) = Self::conversation_id(&outcome.combined_output()) else {
            return Extraction::new(Err(fail("no conversation id in output".to_string())));
        };
        let Some(root) = Self::conversations_root(&ctx.snapshot) else {
            return Extraction::new(Err(fail("home directory is not set".to_string())));
        };
        let dir = root.join(&conversation_id);
        debug!("OpenHands conversation {} at {}", conversation_id, dir.display());

        let (base_state, events) = match Self::load(&dir) {
            Ok(loaded) => loaded,
            Err(reason) => {
                warn!("openhands: {}", reason);
                return Extraction::new(Err(fail(reason)));
            }
        };
        let error_event = events
            .iter()
            .any(|e| Self::kind_of(e).is_some_and(|kind| ERROR_EVENT_KINDS.contains(&kind)));

        let mut artifacts = RunArtifactSet::new();
        artifacts.push(ArtifactKind::Session, &dir, conversation_id.as_str());
        let stats = Self::decode(&base_state, &events);
        let trace = json!({"base_state": base_state, "events": events});
        Extraction::new(stats.map_err(fail))
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::from_file(&dir, trace)))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::UvTool { package: "openhands" }
    }

    fn requires_trajectory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use std::fs;
    use tempfile::TempDir;

    const ID: &str = "5f0c2a9e1b7d4c3a8e6f0a1b2c3d4e5f";

    fn write_conversation(root: &Path, id: &str) {
        let dir = root.join(id);
        fs::create_dir_all(dir.join("events")).unwrap();
        let base_state = json!({
            "stats": {"usage_to_metrics": {"agent": {
                "accumulated_cost": 0.12,
                "accumulated_token_usage": {"completion_tokens": 80, "prompt_tokens": 900},
                "model_name": "openai/gpt-4.1",
                "token_usages": [{}, {}, {}]
            }}}
        });
        fs::write(dir.join("base_state.json"), base_state.to_string()).unwrap();
        let events = [
            json!({"kind": "MessageEvent", "source": "user", "llm_message": {"role": "user", "content": [{"type": "text", "text": "fix"}]}}),
            json!({"kind": "ActionEvent", "tool_name": "execute_bash"}),
            json!({"kind": "MessageEvent", "source": "agent", "llm_message": {"role": "assistant", "content": [{"type": "text", "text": "Working on it"}]}}),
            json!({"kind": "ActionEvent", "tool_name": "finish"}),
            json!({"kind": "ObservationEvent", "observation": {"kind": "FinishObservation", "content": [{"type": "text", "text": "Tests fixed."}]}}),
        ];
        for (index, event) in events.iter().enumerate() {
            fs::write(dir.join("events").join(format!("event-{:05}.json", index)), event.to_string()).unwrap();
        }
    }

    #[test]
    fn test_conversation_id_normalized() {
        let output = "Initializing...\nConversation ID: 5F0C2A9E-1B7D-4C3A-8E6F-0A1B2C3D4E5F\n";
        assert_eq!(OpenhandsAdapter::conversation_id(output).as_deref(), Some(ID));
        assert_eq!(OpenhandsAdapter::conversation_id("no id here"), None);
    }

    #[test]
    fn test_requires_key_and_model() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Openhands, work.path(), work.path(), &[]);
        match OpenhandsAdapter.compose_environment(&ctx) {
            Err(EnvError::Missing(names)) => assert_eq!(names, vec!["LLM_API_KEY", "LLM_MODEL"]),
            other => panic!("unexpected {:?}", other),
        }

        let vars = [("LLM_API_KEY", "k"), ("LLM_MODEL", "gpt-4.1"), ("LLM_BASE_URL", "https://proxy/v1")];
        let ctx = context(AgentKind::Openhands, work.path(), work.path(), &vars);
        let env = OpenhandsAdapter.compose_environment(&ctx).unwrap();
        assert_eq!(env.get("LLM_MODEL"), Some("openai/gpt-4.1"));
    }

    #[tokio::test]
    async fn test_extract_conversation() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        write_conversation(root.path(), ID);
        write_conversation(root.path(), "ffffffffffffffffffffffffffffffff");
        let vars = [
            ("LLM_API_KEY", "k"),
            ("LLM_MODEL", "gpt-4.1"),
            ("OPENHANDS_CONVERSATIONS_DIR", root.path().to_str().unwrap()),
        ];
        let ctx = context(AgentKind::Openhands, work.path(), work.path(), &vars);
        let env = OpenhandsAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(format!("Conversation ID: {}\n{{}}", ID), "", 0);

        let extraction = OpenhandsAdapter.extract_stats(&ctx, &env, &outcome).await;
        let stats = extraction.result().unwrap();
        assert_eq!(stats.models_usage["openai/gpt-4.1"].total_tokens, 980);
        assert_eq!(stats.llm_calls, Some(3));
        assert_eq!(stats.tool_calls, Some(2));
        assert_eq!(stats.total_cost, Some(0.12));
        assert_eq!(stats.response.as_deref(), Some("Tests fixed."));
        assert!(!extraction.error_event);
        assert!(extraction.artifacts.first(ArtifactKind::Session).unwrap().path.ends_with(ID));
    }

    #[test]
    fn test_action_without_tool_name_fails() {
        let base_state = json!({"stats": {"usage_to_metrics": {"agent": {
            "accumulated_cost": 0.0,
            "accumulated_token_usage": {"completion_tokens": 1, "prompt_tokens": 1},
            "model_name": "m",
            "token_usages": []
        }}}});
        let events = vec![json!({"kind": "ActionEvent"})];
        assert!(OpenhandsAdapter::decode(&base_state, &events).is_err());
    }

    #[test]
    fn test_message_fallback_response() {
        let events = vec![json!({"kind": "MessageEvent", "source": "agent", "llm_message": {"role": "assistant", "content": [{"type": "text", "text": "Only message"}]}})];
        assert_eq!(OpenhandsAdapter::response(&events).as_deref(), Some("Only message"));
    }
}
