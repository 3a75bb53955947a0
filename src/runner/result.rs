//! Normalized stats and the result document returned for each run.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::process::ProcessOutcome;

/// Token usage attributed to one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl ModelUsage {
    /// Usage whose total is the sum of prompt and completion.
    pub fn summed(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Usage with a total taken directly from the source schema.
    pub fn with_total(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    /// Adds another usage record into this one.
    pub fn accumulate(&mut self, other: ModelUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Per-model usage, keyed by the model name found in the run's artifacts.
pub type ModelsUsage = BTreeMap<String, ModelUsage>;

/// Normalized stats decoded from one run.
///
/// `None` means the value was not available from the documented source
/// fields. It is never replaced by zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub models_usage: ModelsUsage,
    pub llm_calls: Option<u64>,
    pub tool_calls: Option<u64>,
    pub total_cost: Option<f64>,
    pub response: Option<String>,
    pub telemetry_log: Option<String>,
}

impl RunStats {
    /// Adds usage for a model, merging with earlier records for the same name.
    pub fn add_usage(&mut self, model: impl Into<String>, usage: ModelUsage) {
        self.models_usage
            .entry(model.into())
            .or_default()
            .accumulate(usage);
    }

    /// Sets the response, keeping it absent when the text is blank.
    pub fn with_response(mut self, response: Option<String>) -> Self {
        self.response = response
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        self
    }
}

/// The JSON document printed for every `run`.
///
/// Fields are declared in key order so the serialized document is sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub agent: String,
    pub agent_version: Option<String>,
    pub cakit_exit_code: i32,
    pub command_exit_code: Option<i32>,
    pub llm_calls: Option<u64>,
    pub models_usage: ModelsUsage,
    pub output_path: Option<String>,
    pub raw_output: String,
    pub response: Option<String>,
    pub runtime_seconds: f64,
    pub telemetry_log: Option<String>,
    pub tool_calls: Option<u64>,
    pub total_cost: Option<f64>,
    pub trajectory_path: Option<String>,
}

impl RunResult {
    /// A result for a run that never reached the agent process.
    ///
    /// The message doubles as response and raw output so callers always see
    /// why nothing ran.
    pub fn rejected(agent: impl Into<String>, message: impl Into<String>, cakit_exit_code: i32) -> Self {
        let message = message.into();
        Self {
            agent: agent.into(),
            agent_version: None,
            cakit_exit_code,
            command_exit_code: None,
            llm_calls: None,
            models_usage: ModelsUsage::new(),
            output_path: None,
            raw_output: message.clone(),
            response: Some(message),
            runtime_seconds: 0.0,
            telemetry_log: None,
            tool_calls: None,
            total_cost: None,
            trajectory_path: None,
        }
    }

    /// A result for a run whose agent process was launched.
    ///
    /// `cakit_exit_code` starts as the raw child code until a verdict is applied.
    pub fn launched(agent: impl Into<String>, outcome: &ProcessOutcome) -> Self {
        Self {
            agent: agent.into(),
            agent_version: None,
            cakit_exit_code: outcome.exit_code,
            command_exit_code: Some(outcome.exit_code),
            llm_calls: None,
            models_usage: ModelsUsage::new(),
            output_path: None,
            raw_output: outcome.combined_output(),
            response: None,
            runtime_seconds: outcome.runtime_seconds(),
            telemetry_log: None,
            tool_calls: None,
            total_cost: None,
            trajectory_path: None,
        }
    }

    /// Copies the decoded stats into the document.
    pub fn with_stats(mut self, stats: &RunStats) -> Self {
        self.models_usage = stats.models_usage.clone();
        self.llm_calls = stats.llm_calls;
        self.tool_calls = stats.tool_calls;
        self.total_cost = stats.total_cost;
        self.response = stats.response.clone();
        self.telemetry_log = stats.telemetry_log.clone();
        self
    }

    /// Sets the raw output file path.
    pub fn with_output_path(mut self, path: Option<&Path>) -> Self {
        self.output_path = path.map(|p| p.display().to_string());
        self
    }

    /// Sets the trajectory file path.
    pub fn with_trajectory_path(mut self, path: Option<&Path>) -> Self {
        self.trajectory_path = path.map(|p| p.display().to_string());
        self
    }

    /// Checks if the run passed strict validation.
    pub fn is_success(&self) -> bool {
        self.cakit_exit_code == 0
    }
}

/// Result of installing one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub agent: String,
    pub config_path: Option<String>,
    pub details: Option<String>,
    pub ok: bool,
    pub version: Option<String>,
}

/// Result of configuring one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureResult {
    pub agent: String,
    pub config_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_usage_merges_models() {
        let mut stats = RunStats::default();
        stats.add_usage("gpt-5", ModelUsage::summed(100, 20));
        stats.add_usage("gpt-5", ModelUsage::summed(50, 5));
        stats.add_usage("gpt-5-mini", ModelUsage::with_total(10, 2, 12));

        assert_eq!(stats.models_usage.len(), 2);
        let usage = stats.models_usage["gpt-5"];
        assert_eq!(usage.prompt_tokens, 150);
        assert_eq!(usage.completion_tokens, 25);
        assert_eq!(usage.total_tokens, 175);
    }

    #[test]
    fn test_blank_response_is_absent() {
        let stats = RunStats::default().with_response(Some("   \n".to_string()));
        assert!(stats.response.is_none());

        let stats = RunStats::default().with_response(Some("  done \n".to_string()));
        assert_eq!(stats.response.as_deref(), Some("done"));
    }

    #[test]
    fn test_result_serializes_absent_as_null() {
        let result = RunResult::rejected("claude", "prompt is required", 2);
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["cakit_exit_code"], 2);
        assert!(value["command_exit_code"].is_null());
        assert!(value["tool_calls"].is_null());
        assert!(value["llm_calls"].is_null());
        assert_eq!(value["models_usage"], serde_json::json!({}));
        assert_eq!(value["response"], "prompt is required");
    }

    #[test]
    fn test_result_keys_are_sorted() {
        let result = RunResult::rejected("codex", "x", 1);
        let text = serde_json::to_string(&result).unwrap();
        let positions: Vec<usize> = [
            "\"agent\"",
            "\"agent_version\"",
            "\"cakit_exit_code\"",
            "\"command_exit_code\"",
            "\"models_usage\"",
            "\"raw_output\"",
            "\"runtime_seconds\"",
            "\"trajectory_path\"",
        ]
        .iter()
        .map(|key| text.find(key).unwrap())
        .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }
}
