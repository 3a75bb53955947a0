//! Kilo Code CLI adapter.
//!
//! Targets the 1.x CLI (`kilocode run --format json`). Each run gets a
//! private `HOME` under scratch; stats come from `kilocode export <session>`.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::opencode::OpencodeAdapter;
use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{ComposedEnvironment, EnvSnapshot, Requirements};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

static ANSI_RE: OnceLock<Option<Regex>> = OnceLock::new();

pub struct KilocodeAdapter;

impl KilocodeAdapter {
    /// `openai/<model id>`, dropping any provider prefix the caller gave.
    fn model(snapshot: &EnvSnapshot, model_override: Option<&str>) -> Option<String> {
        let raw = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| snapshot.get("KILO_OPENAI_MODEL_ID"))?;
        let id = match raw.split_once('/') {
            Some((_, id)) if !id.trim().is_empty() => id.trim(),
            _ => raw,
        };
        Some(format!("openai/{}", id))
    }

    /// Stdout with terminal escapes removed and each line cut to its first `{`.
    fn events(stdout: &str) -> Vec<Value> {
        let cleaned = match payload::cached_regex(&ANSI_RE, r"\x1b\][^\x07]*\x07|\x1b\[[0-9;?]*[ -/]*[@-~]") {
            Some(re) => re.replace_all(stdout, "").replace('\r', ""),
            None => stdout.replace('\r', ""),
        };
        let lines: Vec<&str> = cleaned
            .lines()
            .filter_map(|line| line.find('{').map(|start| &line[start..]))
            .collect();
        payload::json_objects(&lines.join("\n"))
    }

    fn decode_export(export: &Value) -> Result<RunStats, String> {
        let mut stats = RunStats::default();
        let mut llm_calls = 0;
        let mut tool_calls = 0;
        let mut cost: Option<f64> = None;
        for message in payload::array(export, "messages")? {
            let info = payload::get(message, "info")?;
            if payload::string(info, "role")? != "assistant" {
                continue;
            }
            for part in payload::array(message, "parts")? {
                if payload::string(part, "type")? != "tool" {
                    continue;
                }
                let status = payload::string(payload::get(part, "state")?, "status")?;
                if matches!(status, "completed" | "error") {
                    tool_calls += 1;
                }
            }
            if info.get("summary").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let model = format!(
                "{}/{}",
                payload::non_blank(info, "providerID")?,
                payload::non_blank(info, "modelID")?
            );
            let tokens = payload::get(info, "tokens")?;
            stats.add_usage(
                model,
                ModelUsage::summed(payload::uint(tokens, "input")?, payload::uint(tokens, "output")?),
            );
            if !matches!(info.get("cost"), None | Some(Value::Null)) {
                *cost.get_or_insert(0.0) += payload::number(info, "cost")?;
            }
            llm_calls += 1;
        }
        if llm_calls == 0 {
            return Err("export has no assistant messages".to_string());
        }
        stats.llm_calls = Some(llm_calls);
        stats.tool_calls = Some(tool_calls);
        stats.total_cost = cost;
        Ok(stats)
    }

    /// Last text part of the last assistant message that has one.
    fn export_response(export: &Value) -> Option<String> {
        export
            .get("messages")?
            .as_array()?
            .iter()
            .rev()
            .filter(|m| m.pointer("/info/role").and_then(Value::as_str) == Some("assistant"))
            .find_map(|m| {
                m.get("parts")?
                    .as_array()?
                    .iter()
                    .rev()
                    .filter(|part| payload::event_type(part) == Some("text"))
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .map(str::trim)
                    .find(|text| !text.is_empty())
                    .map(str::to_string)
            })
    }
}

#[async_trait]
impl AgentAdapter for KilocodeAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Kilocode
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            videos: false,
            media: MediaStrategy::Native,
            reasoning_efforts: &[],
        }
    }

    fn compose_environment(&self, ctx: &RunContext) -> Result<ComposedEnvironment, EnvError> {
        let snap = &ctx.snapshot;
        let model = Self::model(snap, ctx.model_override());
        let mut req = Requirements::new();
        let api_key = req.require(snap.get("KILO_OPENAI_API_KEY"), "KILO_OPENAI_API_KEY");
        req.require(model.as_deref(), "KILO_OPENAI_MODEL_ID");
        req.finish()?;

        let mut env = ComposedEnvironment::base(snap);
        env.set("HOME", ctx.scratch_path("home").display().to_string())
            .set("KILO_DISABLE_AUTOUPDATE", "true")
            .set("KILO_TELEMETRY", "false")
            .set_opt("OPENAI_API_KEY", api_key)
            .set_opt("OPENAI_BASE_URL", snap.get("KILO_OPENAI_BASE_URL"));
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        std::fs::create_dir_all(ctx.scratch_path("home"))?;
        let mut spec = ctx.command().args(["run", "--auto", "--format", "json"]);
        if let Some(model) = Self::model(&ctx.snapshot, ctx.model_override()) {
            spec = spec.arg("--model").arg(model);
        }
        for path in &ctx.media.images {
            spec = spec.arg("--file").arg(path.display().to_string());
        }
        // `--file` takes many values; `--` ends them
        Ok(Invocation::new(spec.arg("--").arg(ctx.prompt())))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let events = Self::events(&outcome.stdout);
        let error_event = events.iter().any(|e| payload::event_type(e) == Some("error"));
        let stream_response = OpencodeAdapter::stream_response(&events);
        let partial = |response: Option<String>, reason: String| {
            Extraction::partial(RunStats::default().with_response(response), Some(fail(reason)))
                .with_error_event(error_event)
        };

        let session_id = match OpencodeAdapter::session_id(&events) {
            Ok(id) => id,
            Err(reason) => return partial(stream_response, reason),
        };
        debug!("Kilo Code session {}", session_id);
        let export = match OpencodeAdapter::export(ctx, env, &session_id).await {
            Ok(export) => export,
            Err(reason) => {
                warn!("kilocode: export of {} failed: {}", session_id, reason);
                return partial(stream_response, reason);
            }
        };

        let response = stream_response.or_else(|| Self::export_response(&export));
        let (stats, failure) = match Self::decode_export(&export) {
            Ok(stats) => (stats.with_response(response), None),
            Err(reason) => (RunStats::default().with_response(response), Some(fail(reason))),
        };
        Extraction::partial(stats, failure)
            .with_trajectory(Some(TrajectorySource::labelled(format!("kilocode session {}", session_id), export)))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@kilocode/cli",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::{context, script};
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const VARS: [(&str, &str); 2] = [("KILO_OPENAI_API_KEY", "sk-k"), ("KILO_OPENAI_MODEL_ID", "gpt-5")];

    fn export() -> Value {
        json!({
            "info": {"id": "ses_k"},
            "messages": [
                {"info": {"role": "user"}, "parts": [{"type": "text", "text": "fix"}]},
                {
                    "info": {"role": "assistant", "providerID": "openai", "modelID": "gpt-5", "cost": 0.5,
                             "tokens": {"input": 300, "output": 40}},
                    "parts": [
                        {"type": "tool", "state": {"status": "completed"}},
                        {"type": "tool", "state": {"status": "error"}},
                        {"type": "tool", "state": {"status": "running"}}
                    ]
                },
                {
                    "info": {"role": "assistant", "summary": true, "providerID": "openai", "modelID": "gpt-5"},
                    "parts": []
                },
                {
                    "info": {"role": "assistant", "providerID": "openai", "modelID": "gpt-5",
                             "tokens": {"input": 100, "output": 10}},
                    "parts": [{"type": "text", "text": "Fixed both tests."}]
                }
            ]
        })
    }

    #[test]
    fn test_decode_export_skips_summaries() {
        let stats = KilocodeAdapter::decode_export(&export()).unwrap();
        let usage = stats.models_usage["openai/gpt-5"];
        assert_eq!(usage.prompt_tokens, 400);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total_tokens, 450);
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.tool_calls, Some(2));
        assert_eq!(stats.total_cost, Some(0.5));
        assert_eq!(
            KilocodeAdapter::export_response(&export()).as_deref(),
            Some("Fixed both tests.")
        );
    }

    #[test]
    fn test_tokens_are_required() {
        let mut export = export();
        export["messages"][3]["info"]["tokens"]
            .as_object_mut()
            .unwrap()
            .remove("output");
        assert_eq!(KilocodeAdapter::decode_export(&export).unwrap_err(), "missing field 'output'");
    }

    #[test]
    fn test_events_strip_terminal_escapes() {
        let stdout = "\x1b[2K\x1b[1G{\"type\":\"step_start\",\"sessionID\":\"ses_k\"}\r\nbanner\n\x1b]0;title\x07{\"type\":\"text\",\"sessionID\":\"ses_k\"}";
        let events = KilocodeAdapter::events(stdout);
        assert_eq!(events.len(), 2);
        assert_eq!(OpencodeAdapter::session_id(&events).unwrap(), "ses_k");
    }

    #[test]
    fn test_environment_and_command() {
        let work = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let mut ctx = context(AgentKind::Kilocode, work.path(), scratch.path(), &VARS);
        ctx.request.model = Some("anthropic/claude-sonnet-4".to_string());
        ctx.media.images.push(PathBuf::from("/tmp/a.png"));
        let env = KilocodeAdapter.compose_environment(&ctx).unwrap();
        assert_eq!(env.get("OPENAI_API_KEY"), Some("sk-k"));
        assert_eq!(env.get("HOME"), Some(scratch.path().join("home").to_str().unwrap()));
        assert!(!env.contains("OPENAI_BASE_URL"));

        let spec = KilocodeAdapter.build_command(&ctx, &env).unwrap().spec;
        assert_eq!(
            spec.args,
            vec![
                "run", "--auto", "--format", "json", "--model", "openai/claude-sonnet-4", "--file", "/tmp/a.png", "--",
                "fix the tests"
            ]
        );
        assert!(scratch.path().join("home").is_dir());
    }

    #[test]
    fn test_missing_credentials() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Kilocode, work.path(), work.path(), &[]);
        match KilocodeAdapter.compose_environment(&ctx) {
            Err(EnvError::Missing(names)) => assert_eq!(names, vec!["KILO_OPENAI_API_KEY", "KILO_OPENAI_MODEL_ID"]),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_via_export() {
        let work = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let body = format!(
            "if [ \"$1\" = \"export\" ] && [ \"$2\" = \"ses_k\" ]; then\n  echo '{}'\nelse\n  exit 3\nfi",
            export()
        );
        let mut ctx = context(AgentKind::Kilocode, work.path(), work.path(), &VARS);
        ctx.binary = script(bin.path(), "kilocode", &body);
        let env = KilocodeAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts("{\"type\":\"step_start\",\"sessionID\":\"ses_k\"}", "", 0);
        let extraction = KilocodeAdapter.extract_stats(&ctx, &env, &outcome).await;
        let stats = extraction.result().unwrap();
        assert_eq!(stats.response.as_deref(), Some("Fixed both tests."));
        assert_eq!(stats.llm_calls, Some(2));
        assert!(extraction.trajectory.is_some());
    }

    #[tokio::test]
    async fn test_failed_export_keeps_stream_response() {
        let work = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let mut ctx = context(AgentKind::Kilocode, work.path(), work.path(), &VARS);
        ctx.binary = script(bin.path(), "kilocode", "exit 3");
        let env = KilocodeAdapter.compose_environment(&ctx).unwrap();
        let stdout = r#"{"type":"text","sessionID":"ses_k","part":{"type":"text","text":"Partly done."}}"#;
        let extraction = KilocodeAdapter
            .extract_stats(&ctx, &env, &ProcessOutcome::from_parts(stdout, "", 0))
            .await;
        assert_eq!(extraction.failure.unwrap().reason, "export exited with code 3");
        assert_eq!(extraction.stats.response.as_deref(), Some("Partly done."));
    }
}
