//! Qoder CLI adapter.
//!
//! `--output-format stream-json` comes in two shapes. Current releases emit
//! `qoder_message` events whose assistant messages carry their own usage
//! and a `response_meta.request_id`. Older releases emit
//! Anthropic-style `message_start` .. `message_stop` streams. LLM calls are
//! the distinct request ids in either case.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{resolve_model, ComposedEnvironment};
use crate::runner::locator::{ArtifactKind, RunArtifactSet};
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const PASS_THROUGH: &[&str] = &["QODER_PERSONAL_ACCESS_TOKEN"];

/// Log file under the home directory.
const LOG_FILE: &str = ".qoder/logs/qodercli.log";

pub struct QoderAdapter;

/// Totals shared by both stream shapes.
#[derive(Debug, Default)]
struct Tally {
    stats: RunStats,
    requests: BTreeSet<String>,
    tool_calls: u64,
    response: Option<String>,
}

impl Tally {
    fn record(&mut self, model: String, request_id: String, usage: ModelUsage, text: &str) {
        self.stats.add_usage(model, usage);
        self.requests.insert(request_id);
        let text = text.trim();
        if !text.is_empty() {
            self.response = Some(text.to_string());
        }
    }

    fn finish(self) -> Result<RunStats, String> {
        if self.requests.is_empty() {
            return Err("no assistant messages".to_string());
        }
        let mut stats = self.stats;
        stats.llm_calls = Some(self.requests.len() as u64);
        stats.tool_calls = Some(self.tool_calls);
        Ok(stats.with_response(self.response))
    }
}

/// The assistant message currently streaming.
struct OpenMessage {
    model: String,
    request_id: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    text: String,
}

impl QoderAdapter {
    fn decode(events: &[Value]) -> Result<RunStats, String> {
        let mut types = BTreeSet::new();
        for event in events {
            match payload::event_type(event).filter(|t| !t.is_empty()) {
                Some(kind) => types.insert(kind),
                None => return Err("event without a type".to_string()),
            };
        }
        if types.contains("qoder_message") {
            Self::decode_qoder_messages(events)
        } else if types.contains("message_start") && types.contains("message_stop") {
            Self::decode_message_stream(events)
        } else {
            Err("no qoder_message or message_start/message_stop events".to_string())
        }
    }

    fn decode_qoder_messages(events: &[Value]) -> Result<RunStats, String> {
        let mut tally = Tally::default();
        for event in events.iter().filter(|e| payload::event_type(e) == Some("qoder_message")) {
            let message = payload::get(event, "message")?;
            if payload::string(message, "role")? != "assistant" {
                continue;
            }
            let meta = payload::get(message, "response_meta")?;
            let model = payload::non_blank(meta, "model_name")?;
            let request_id = payload::non_blank(meta, "request_id")?;
            let usage = payload::get(message, "usage")?;
            let usage = ModelUsage::with_total(
                payload::uint(usage, "total_prompt_tokens")?,
                payload::uint(usage, "total_completed_tokens")?,
                payload::uint(usage, "total_tokens")?,
            );
            match message.get("tool_calls") {
                None | Some(Value::Null) => {}
                Some(_) => tally.tool_calls += payload::array(message, "tool_calls")?.len() as u64,
            }
            let text = payload::string(message, "content")?;
            tally.record(model, request_id, usage, text);
        }
        tally.finish()
    }

    fn decode_message_stream(events: &[Value]) -> Result<RunStats, String> {
        let mut tally = Tally::default();
        let mut open: Option<OpenMessage> = None;
        for event in events {
            match payload::event_type(event) {
                Some("message_start") => {
                    let message = payload::get(event, "message")?;
                    if payload::string(message, "role")? != "assistant" {
                        open = None;
                        continue;
                    }
                    let usage = payload::get(message, "usage")?;
                    let cache_read = match usage.get("cache_read_tokens") {
                        None | Some(Value::Null) => 0,
                        Some(_) => payload::uint(usage, "cache_read_tokens")?,
                    };
                    open = Some(OpenMessage {
                        model: payload::non_blank(message, "model")?,
                        request_id: payload::non_blank(message, "id")?,
                        prompt_tokens: payload::uint(usage, "input_tokens")? + cache_read,
                        completion_tokens: payload::uint(usage, "output_tokens")?,
                        text: String::new(),
                    });
                }
                Some("content_block_start") => {
                    let Some(current) = open.as_mut() else { continue };
                    let block = payload::get(event, "content_block")?;
                    match payload::string(block, "type")? {
                        "tool_use" => tally.tool_calls += 1,
                        "text" => {
                            if let Some(text) = payload::opt_string(block, "text")? {
                                current.text.push_str(text);
                            }
                        }
                        _ => {}
                    }
                }
                Some("content_block_delta") => {
                    let Some(current) = open.as_mut() else { continue };
                    let delta = payload::get(event, "delta")?;
                    if payload::string(delta, "type")? == "text_delta" {
                        current.text.push_str(payload::string(delta, "text")?);
                    }
                }
                Some("message_delta") => {
                    let Some(current) = open.as_mut() else { continue };
                    current.completion_tokens = payload::uint(payload::get(event, "usage")?, "output_tokens")?;
                }
                Some("message_stop") => {
                    if let Some(done) = open.take() {
                        let usage = ModelUsage::summed(done.prompt_tokens, done.completion_tokens);
                        tally.record(done.model, done.request_id, usage, &done.text);
                    }
                }
                _ => {}
            }
        }
        if open.is_some() {
            return Err("assistant message was not stopped".to_string());
        }
        tally.finish()
    }
}

#[async_trait]
impl AgentAdapter for QoderAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Qoder
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
        let mut env = ComposedEnvironment::base(&ctx.snapshot);
        env.pass_through(&ctx.snapshot, PASS_THROUGH);
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let mut spec = ctx
            .command()
            .args(["-q", "-p"])
            .arg(ctx.prompt())
            .args(["--output-format", "stream-json", "--dangerously-skip-permissions"]);
        if let Some(model) = resolve_model(ctx.model_override(), &ctx.snapshot, "CAKIT_QODER_MODEL", None) {
            spec = spec.arg("--model").arg(model);
        }
        for image in &ctx.media.images {
            spec = spec.arg("--attachment").arg(image.display().to_string());
        }
        Ok(Invocation::new(spec))
    }

    async fn extract_stats(
        &self,
        ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let events = payload::json_objects(&outcome.stdout);
        if events.is_empty() {
            return Extraction::new(Err(ExtractionFailed::new(self.kind().as_str(), "stdout has no events")));
        }
        let (mut stats, failure) = match Self::decode(&events) {
            Ok(stats) => (stats, None),
            Err(reason) => (RunStats::default(), Some(ExtractionFailed::new(self.kind().as_str(), reason))),
        };

        let mut artifacts = RunArtifactSet::new();
        if let Some(log) = ctx.snapshot.home().map(|home| home.join(LOG_FILE)).filter(|p| p.is_file()) {
            stats.telemetry_log = Some(log.display().to_string());
            artifacts.push(ArtifactKind::Telemetry, &log, ctx.run_id.to_string());
        }

        Extraction::partial(stats, failure)
            .with_artifacts(artifacts)
            .with_trajectory(Some(TrajectorySource::labelled("stdout events", Value::Array(events))))
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@qoder-ai/qodercli",
        }
    }
}
