//! CodeBuddy Code adapter.
//!
//! `--output-format stream-json` emits one event per line: a `system/init`
//! event naming the session model, one `assistant` event per model call
//! with its `message.usage`, and a terminal `result` event. Images are sent
//! as base64 content blocks of a stream-json user message on stdin.

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};

use super::payload;
use super::{AgentAdapter, AgentKind, Capabilities, Extraction, InstallPlan, Invocation, MediaStrategy, RunContext};
use crate::error::{EnvError, ExtractionFailed};
use crate::runner::env::{resolve_model, ComposedEnvironment};
use crate::runner::media::image_media_type;
use crate::runner::process::ProcessOutcome;
use crate::runner::result::{ModelUsage, RunStats};
use crate::trajectory::TrajectorySource;

const PASS_THROUGH: &[&str] = &["CODEBUDDY_AUTH_TOKEN", "CODEBUDDY_INTERNET_ENVIRONMENT"];

pub struct CodebuddyAdapter;

/// What the terminal `result` event reports.
#[derive(Debug, Clone, PartialEq)]
struct ResultMeta {
    response: Option<String>,
    total_cost: Option<f64>,
    is_error: bool,
}

impl CodebuddyAdapter {
    fn model(ctx: &RunContext) -> Option<String> {
        resolve_model(ctx.model_override(), &ctx.snapshot, "CODEBUDDY_MODEL", Some("OPENAI_DEFAULT_MODEL"))
    }

    /// Prompt tokens include cache reads and cache writes when reported.
    fn decode_usage(usage: &Value) -> Result<ModelUsage, String> {
        let input = payload::uint(usage, "input_tokens")?;
        let output = payload::uint(usage, "output_tokens")?;
        let mut prompt = input;
        for key in ["cache_read_input_tokens", "cache_creation_input_tokens"] {
            match usage.get(key) {
                None | Some(Value::Null) => {}
                Some(_) => prompt += payload::uint(usage, key)?,
            }
        }
        Ok(ModelUsage::summed(prompt, output))
    }

    fn init_model(events: &[Value]) -> Option<&str> {
        events
            .iter()
            .filter(|event| payload::event_type(event) == Some("system"))
            .filter(|event| event.get("subtype").and_then(Value::as_str) == Some("init"))
            .find_map(|event| event.get("model").and_then(Value::as_str).map(str::trim))
            .filter(|model| !model.is_empty())
    }

    /// Sums usage over assistant events. Returns the stats and the text of
    /// the last assistant message that had any.
    fn decode_assistants(events: &[Value]) -> Result<(RunStats, Option<String>), String> {
        let init_model = Self::init_model(events);
        let mut stats = RunStats::default();
        let mut llm_calls = 0u64;
        let mut tool_calls = 0u64;
        let mut last_text = None;
        for event in events.iter().filter(|e| payload::event_type(e) == Some("assistant")) {
            let message = payload::get(event, "message")?;
            let usage = Self::decode_usage(payload::get(message, "usage")?)?;
            let model = match payload::opt_string(message, "model")?.map(str::trim) {
                Some(model) if !model.is_empty() => model,
                _ => init_model.ok_or_else(|| "assistant message has no model".to_string())?,
            };
            let mut texts = Vec::new();
            for block in payload::array(message, "content")? {
                match payload::event_type(block) {
                    Some("tool_use") => {
                        payload::non_blank(block, "id")?;
                        payload::non_blank(block, "name")?;
                        tool_calls += 1;
                    }
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str).map(str::trim) {
                            if !text.is_empty() {
                                texts.push(text);
                            }
                        }
                    }
                    _ => {}
                }
            }
            if !texts.is_empty() {
                last_text = Some(texts.join("\n"));
            }
            stats.add_usage(model, usage);
            llm_calls += 1;
        }
        if llm_calls == 0 {
            return Err("no assistant messages".to_string());
        }
        stats.llm_calls = Some(llm_calls);
        stats.tool_calls = Some(tool_calls);
        Ok((stats, last_text))
    }

    /// A successful result must carry its text; other subtypes fall back to
    /// the last assistant text, then to the joined `errors`.
    fn decode_result(result: &Value, fallback: Option<String>) -> Result<ResultMeta, String> {
        let subtype = payload::non_blank(result, "subtype")?;
        let is_error = result
            .get("is_error")
            .and_then(Value::as_bool)
            .ok_or_else(|| "missing field 'is_error'".to_string())?;
        Self::decode_usage(payload::get(result, "usage")?)?;
        let total_cost = result.get("total_cost_usd").filter(|v| v.is_number()).and_then(Value::as_f64);
        let response = if subtype == "success" {
            Some(payload::non_blank(result, "result")?)
        } else {
            fallback.or_else(|| Self::error_text(result))
        };
        Ok(ResultMeta {
            response,
            total_cost,
            is_error,
        })
    }

    fn error_text(result: &Value) -> Option<String> {
        let texts: Vec<&str> = result
            .get("errors")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .collect();
        (!texts.is_empty()).then(|| texts.join("\n"))
    }

    /// One stream-json user message holding the prompt and inline images.
    fn stream_input(prompt: &str, images: &[impl AsRef<Path>]) -> Result<String, EnvError> {
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        for image in images {
            let image = image.as_ref();
            let media_type = image_media_type(image).ok_or_else(|| EnvError::Invalid {
                name: "image".to_string(),
                reason: format!("unsupported image media type for stream-json: {}", image.display()),
            })?;
            let data = BASE64.encode(fs::read(image)?);
            content.push(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            }));
        }
        let message = json!({ "type": "user", "message": { "role": "user", "content": content } });
        Ok(format!("{}\n", serde_json::to_string(&message)?))
    }
}

#[async_trait]
impl AgentAdapter for CodebuddyAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Codebuddy
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
        let mut env = ComposedEnvironment::base(snap);
        env.pass_through(snap, PASS_THROUGH)
            .set_opt("CODEBUDDY_API_KEY", snap.first_of(&["CODEBUDDY_API_KEY", "OPENAI_API_KEY"]))
            .set_opt("CODEBUDDY_BASE_URL", snap.first_of(&["CODEBUDDY_BASE_URL", "OPENAI_BASE_URL"]))
            .set_opt("CODEBUDDY_MODEL", Self::model(ctx).as_deref());
        Ok(env)
    }

    fn build_command(&self, ctx: &RunContext, _env: &ComposedEnvironment) -> Result<Invocation, EnvError> {
        let mut spec = ctx.command().args(["-p", "--output-format", "stream-json", "-y"]);
        let images = &ctx.media.images;
        if !images.is_empty() {
            spec = spec
                .args(["--input-format", "stream-json"])
                .with_stdin(Self::stream_input(ctx.prompt(), images)?);
        }
        if let Some(model) = Self::model(ctx) {
            spec = spec.arg("--model").arg(model);
        }
        if images.is_empty() {
            spec = spec.arg(ctx.prompt());
        }
        Ok(Invocation::new(spec))
    }

    async fn extract_stats(
        &self,
        _ctx: &RunContext,
        _env: &ComposedEnvironment,
        outcome: &ProcessOutcome,
    ) -> Extraction {
        let fail = |reason: String| ExtractionFailed::new(self.kind().as_str(), reason);
        let events = payload::json_objects(&outcome.stdout);
        let Some(result) = events.iter().rev().find(|e| payload::event_type(e) == Some("result")) else {
            return Extraction::new(Err(fail("stdout has no result event".to_string())));
        };

        let (mut stats, last_text, mut failure) = match Self::decode_assistants(&events) {
            Ok((stats, last_text)) => (stats, last_text, None),
            Err(reason) => (RunStats::default(), None, Some(fail(reason))),
        };
        let mut error_event = false;
        match Self::decode_result(result, last_text) {
            Ok(meta) => {
                stats.response = meta.response;
                stats.total_cost = meta.total_cost;
                error_event = meta.is_error;
            }
            Err(reason) => {
                failure.get_or_insert_with(|| fail(reason));
            }
        }

        Extraction::partial(stats, failure)
            .with_trajectory(Some(TrajectorySource::labelled("stdout events", Value::Array(events.clone()))))
            .with_error_event(error_event)
    }

    fn install_plan(&self) -> InstallPlan {
        InstallPlan::Npm {
            package: "@tencent-ai/codebuddy-code",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::context;
    use tempfile::TempDir;

    const STREAM: &str = r#"{"type":"system","subtype":"init","model":"glm-4.6","session_id":"s1"}
{"type":"assistant","message":{"usage":{"input_tokens":100,"output_tokens":20,"cache_read_input_tokens":50},"content":[{"type":"text","text":"Looking."},{"type":"tool_use","id":"t1","name":"Read"}]}}
{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1"}]}}
{"type":"assistant","message":{"model":"glm-4.6","usage":{"input_tokens":200,"output_tokens":30,"cache_creation_input_tokens":null},"content":[{"type":"tool_use","id":"t2","name":"Edit"},{"type":"text","text":"Patched."}]}}
{"type":"result","subtype":"success","is_error":false,"result":" Patched the parser. ","usage":{"input_tokens":300,"output_tokens":50},"total_cost_usd":0.0125}"#;

    #[tokio::test]
    async fn test_extract_sums_assistant_usage() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Codebuddy, work.path(), work.path(), &[]);
        let env = CodebuddyAdapter.compose_environment(&ctx).unwrap();
        let outcome = ProcessOutcome::from_parts(STREAM, "", 0);
        let extraction = CodebuddyAdapter.extract_stats(&ctx, &env, &outcome).await;

        let stats = extraction.result().unwrap();
        let usage = stats.models_usage["glm-4.6"];
        assert_eq!(usage.prompt_tokens, 350);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total_tokens, 400);
        assert_eq!(stats.llm_calls, Some(2));
        assert_eq!(stats.tool_calls, Some(2));
        assert_eq!(stats.total_cost, Some(0.0125));
        assert_eq!(stats.response.as_deref(), Some("Patched the parser."));
        assert!(!extraction.error_event);
    }

    #[tokio::test]
    async fn test_error_result_falls_back_to_assistant_text() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Codebuddy, work.path(), work.path(), &[]);
        let env = CodebuddyAdapter.compose_environment(&ctx).unwrap();
        let stdout = r#"{"type":"assistant","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":1},"content":[{"type":"text","text":"Partial answer"}]}}
{"type":"result","subtype":"error_max_turns","is_error":true,"usage":{"input_tokens":1,"output_tokens":1},"errors":["max turns"]}"#;
        let outcome = ProcessOutcome::from_parts(stdout, "", 0);
        let extraction = CodebuddyAdapter.extract_stats(&ctx, &env, &outcome).await;
        assert!(extraction.error_event);
        assert_eq!(extraction.stats.response.as_deref(), Some("Partial answer"));
        assert_eq!(extraction.stats.total_cost, None);
    }

    #[tokio::test]
    async fn test_nameless_tool_use_fails_but_keeps_result() {
        let work = TempDir::new().unwrap();
        let ctx = context(AgentKind::Codebuddy, work.path(), work.path(), &[]);
        let env = CodebuddyAdapter.compose_environment(&ctx).unwrap();
        let stdout = r#"{"type":"assistant","message":{"model":"m","usage":{"input_tokens":1,"output_tokens":1},"content":[{"type":"tool_use","id":"t1"}]}}
{"type":"result","subtype":"success","is_error":false,"result":"ok","usage":{"input_tokens":1,"output_tokens":1},"total_cost_usd":0.5}"#;
        let outcome = ProcessOutcome::from_parts(stdout, "", 0);
        let extraction = CodebuddyAdapter.extract_stats(&ctx, &env, &outcome).await;
        assert!(extraction.failure.unwrap().reason.contains("name"));
        assert!(extraction.stats.models_usage.is_empty());
        assert_eq!(extraction.stats.response.as_deref(), Some("ok"));
        assert_eq!(extraction.stats.total_cost, Some(0.5));
    }

    #[test]
    fn test_error_text_joins_errors() {
        let result = json!({"errors": [" quota ", "", "retry later"]});
        assert_eq!(CodebuddyAdapter::error_text(&result).as_deref(), Some("quota\nretry later"));
        assert_eq!(CodebuddyAdapter::error_text(&json!({})), None);
    }

    #[test]
    fn test_images_go_through_stdin() {
        let work = TempDir::new().unwrap();
        let image = work.path().join("shot.png");
        std::fs::write(&image, [0x89u8, b'P', b'N', b'G']).unwrap();
        let mut ctx = context(
            AgentKind::Codebuddy,
            work.path(),
            work.path(),
            &[("OPENAI_API_KEY", "sk-o"), ("OPENAI_DEFAULT_MODEL", "gpt-4.1")],
        );
        ctx.media.images.push(image);
        let env = CodebuddyAdapter.compose_environment(&ctx).unwrap();
        assert_eq!(env.get("CODEBUDDY_API_KEY"), Some("sk-o"));
        assert_eq!(env.get("CODEBUDDY_MODEL"), Some("gpt-4.1"));

        let spec = CodebuddyAdapter.build_command(&ctx, &env).unwrap().spec;
        assert!(!spec.args.iter().any(|arg| arg == "fix the tests"));
        assert!(spec.args.join(" ").contains("--input-format stream-json"));
        let message: Value = serde_json::from_str(spec.stdin.as_deref().unwrap().trim()).unwrap();
        let content = message["message"]["content"].as_array().unwrap();
        assert_eq!(content[0]["text"], "fix the tests");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["source"]["data"], BASE64.encode([0x89u8, b'P', b'N', b'G']));
    }

    #[test]
    fn test_unknown_image_type_is_refused() {
        let work = TempDir::new().unwrap();
        let image = work.path().join("shot.tiff");
        std::fs::write(&image, "x").unwrap();
        let mut ctx = context(AgentKind::Codebuddy, work.path(), work.path(), &[]);
        ctx.media.images.push(image);
        let env = CodebuddyAdapter.compose_environment(&ctx).unwrap();
        assert!(matches!(
            CodebuddyAdapter.build_command(&ctx, &env),
            Err(EnvError::Invalid { .. })
        ));
    }
}
