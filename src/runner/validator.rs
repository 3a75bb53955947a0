//! Strict Validator.
//!
//! Decides the reported exit code from the raw process exit code and the
//! decoded stats. "The command ran" and "the command succeeded" are
//! separate: a zero exit code is downgraded when required stats are absent.

use serde::Serialize;

use super::result::RunStats;
use crate::error::ExtractionFailed;

/// Generic failure code used for strict-validation overrides.
pub const EXIT_FAILURE: i32 = 1;

/// Process outcome known, stats not yet judged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tentative {
    exit_code: i32,
    error_event: bool,
    extraction_failure: Option<String>,
}

/// Final decision for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub code: i32,
    pub reasons: Vec<String>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.code == 0
    }
}

impl Tentative {
    /// `error_event` is set when the output stream carried an explicit error.
    pub fn new(exit_code: i32, error_event: bool) -> Self {
        Self {
            exit_code,
            error_event,
            extraction_failure: None,
        }
    }

    /// Records why extraction failed; this alone fails a zero exit code.
    pub fn with_extraction_failure(mut self, failure: Option<&ExtractionFailed>) -> Self {
        self.extraction_failure = failure.map(ToString::to_string);
        self
    }

    /// Fixes the verdict.
    pub fn finalize(self, stats: &RunStats, trajectory_present: bool, requires_trajectory: bool) -> Verdict {
        if self.exit_code != 0 {
            return Verdict {
                code: self.exit_code,
                reasons: vec![format!("agent exited with code {}", self.exit_code)],
            };
        }

        let mut reasons = Vec::new();
        if self.error_event {
            reasons.push("agent output contains an error event".to_string());
        }
        if let Some(failure) = self.extraction_failure {
            reasons.push(failure);
        }
        if stats.models_usage.is_empty() {
            reasons.push("models_usage is empty".to_string());
        }
        match stats.llm_calls {
            None => reasons.push("llm_calls is unavailable".to_string()),
            Some(0) => reasons.push("llm_calls is 0".to_string()),
            Some(_) => {}
        }
        if stats.tool_calls.is_none() {
            reasons.push("tool_calls is unavailable".to_string());
        }
        if stats.response.as_deref().map_or(true, |r| r.trim().is_empty()) {
            reasons.push("response is empty".to_string());
        }
        if requires_trajectory && !trajectory_present {
            reasons.push("trajectory is missing".to_string());
        }

        Verdict {
            code: if reasons.is_empty() { 0 } else { EXIT_FAILURE },
            reasons,
        }
    }
}
