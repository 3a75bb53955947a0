//! Agent runner for coding-agent CLIs.
//!
//! This module runs an external agent CLI against one prompt and reduces
//! whatever the agent left behind to a uniform result document.
//!
//! # Architecture
//!
//! ```text
//! RunRequest → validate → compose env → Agent Process → extract → validator → RunResult
//! ```
//!
//! The runner:
//! 1. Rejects bad input before anything is spawned
//! 2. Builds the child environment from an explicit whitelist
//! 3. Locates the agent's own session, log or telemetry files for this run
//! 4. Fails closed when usage data is missing
//!
//! # Example
//!
//! ```ignore
//! use cakit::runner::{AgentKind, AgentRunner, RunRequest};
//! use cakit::runner::env::EnvSnapshot;
//!
//! let runner = AgentRunner::new(EnvSnapshot::capture());
//! let request = RunRequest::new(AgentKind::Codex, "fix the failing test", "./repo");
//! let result = runner.run(request).await;
//!
//! println!("{}", serde_json::to_string_pretty(&result)?);
//! std::process::exit(result.cakit_exit_code);
//! ```

pub mod agents;
pub mod config;
pub mod env;
pub mod executor;
pub mod locator;
pub mod media;
pub mod output;
pub mod process;
pub mod result;
pub mod validator;

pub use agents::{AgentAdapter, AgentKind};
pub use config::{EngineSettings, InstallScope, ReasoningEffort, RunRequest};
pub use executor::AgentRunner;
pub use result::{ConfigureResult, InstallResult, ModelUsage, RunResult, RunStats};
