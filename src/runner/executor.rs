//! Agent executor - the run pipeline plus install, configure and version.
//!
//! A run goes through a fixed sequence: validate input, compose the child
//! environment, resolve the binary, build the command, spawn, extract,
//! write output and trajectory files, query the version, validate strictly
//! and clean up. Every path ends in a complete [`RunResult`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::agents::{create_adapter, AgentAdapter, AgentKind, InstallPlan, RunContext};
use super::config::{EngineSettings, InstallScope, ReasoningEffort, RunRequest};
use super::env::{ComposedEnvironment, EnvSnapshot};
use super::locator::{resolve_binary, tool_dirs, DEFAULT_NPM_PREFIX};
use super::media::{resolve_media, MediaSet, STAGE_DIR};
use super::output::OutputWriter;
use super::process::{ProcessRunner, ProcessSpec, Termination};
use super::result::{ConfigureResult, InstallResult, RunResult};
use super::validator::{Tentative, EXIT_FAILURE};
use crate::error::{EnvError, InstallError, UsageError};
use crate::trajectory::format_trajectory;

/// Deadline for `<agent> --version`.
const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Python used for source-archive installs.
const PYTHON_VERSION: &str = "3.12";

/// Proxy and registry variables forwarded to installers.
const INSTALL_PASS_THROUGH: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "NPM_CONFIG_REGISTRY",
    "UV_INDEX_URL",
    "PIP_INDEX_URL",
];

/// The main agent runner.
pub struct AgentRunner {
    /// Parent environment, read once.
    snapshot: EnvSnapshot,
    /// Explicit settings; resolved from each run's environment when unset.
    settings: Option<EngineSettings>,
    process: ProcessRunner,
}

impl AgentRunner {
    /// Creates a runner over a snapshot of the parent environment.
    pub fn new(snapshot: EnvSnapshot) -> Self {
        Self {
            snapshot,
            settings: None,
            process: ProcessRunner::new(),
        }
    }

    /// Fixes the engine settings instead of reading them from the environment.
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    fn settings_for(&self, snapshot: &EnvSnapshot) -> EngineSettings {
        self.settings
            .clone()
            .unwrap_or_else(|| EngineSettings::from_env(snapshot))
    }

    /// Runs one agent against one prompt.
    pub async fn run(&self, request: RunRequest) -> RunResult {
        let kind = request.agent;
        let adapter = create_adapter(kind);

        let snapshot = match &request.env_file {
            Some(path) => match self.snapshot.clone().with_env_file(path) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let settings = self.settings_for(&self.snapshot);
                    return reject(kind, &settings, e.to_string(), EXIT_FAILURE);
                }
            },
            None => self.snapshot.clone(),
        };
        let settings = self.settings_for(&snapshot);

        let (media, reasoning_effort) = match validate(adapter.as_ref(), &request, &snapshot) {
            Ok(valid) => valid,
            Err(e) => {
                warn!("Rejected {} run: {}", kind, e);
                return reject(kind, &settings, e.to_string(), UsageError::EXIT_CODE);
            }
        };

        let run_id = Uuid::new_v4();
        let scratch = std::env::temp_dir().join(format!("cakit-{}-{}", kind, run_id));
        if let Err(e) = fs::create_dir_all(&scratch) {
            let message = format!("failed to prepare run directory {}: {}", scratch.display(), e);
            return reject(kind, &settings, message, EXIT_FAILURE);
        }

        let mut ctx = RunContext {
            request,
            run_id,
            scratch,
            binary: PathBuf::from(kind.binary()),
            media,
            reasoning_effort,
            snapshot,
        };
        let (result, staged) = self.execute(adapter.as_ref(), &mut ctx, &settings).await;
        cleanup(&ctx, &staged, &result, settings.keep_scratch);
        result
    }

    async fn execute(
        &self,
        adapter: &dyn AgentAdapter,
        ctx: &mut RunContext,
        settings: &EngineSettings,
    ) -> (RunResult, Vec<PathBuf>) {
        let kind = adapter.kind();
        let writer = OutputWriter::new(&settings.output_dir, kind.as_str(), &ctx.run_id, Local::now());

        let mut env = match adapter.compose_environment(ctx) {
            Ok(env) => env,
            Err(e) => {
                warn!("{}: {}", kind, e);
                return (rejected_with_output(kind, &writer, e.to_string(), EXIT_FAILURE), Vec::new());
            }
        };
        env.prepend_path(&tool_dirs(&ctx.snapshot));

        match resolve_binary(kind.binary(), &kind.bin_env_var(), &ctx.snapshot, env.get("PATH")) {
            Some(binary) => ctx.binary = binary,
            None => debug!("{} not resolved, spawning by name", kind.binary()),
        }

        let invocation = match adapter.build_command(ctx, &env) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("{}: {}", kind, e);
                return (rejected_with_output(kind, &writer, e.to_string(), EXIT_FAILURE), Vec::new());
            }
        };

        for step in &invocation.setup {
            // arguments may carry credentials
            debug!("{} setup: {} ({} args)", kind, step.program.display(), step.args.len());
            let message = match self.process.run(step, &env, ctx.request.timeout).await {
                Ok(done) if done.is_success() => continue,
                Ok(done) => format!(
                    "{} setup `{}` exited with code {}\n{}",
                    kind,
                    step.program.display(),
                    done.exit_code,
                    done.combined_output()
                ),
                Err(e) => e.to_string(),
            };
            warn!("{}", message.lines().next().unwrap_or_default());
            let result = rejected_with_output(kind, &writer, message, EXIT_FAILURE);
            return (result, invocation.staged_media);
        }

        info!("Starting {} run {} in {}", kind, ctx.run_id, ctx.workdir().display());
        let outcome = match self.process.run(&invocation.spec, &env, ctx.request.timeout).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{}: {}", kind, e);
                let result = rejected_with_output(kind, &writer, e.to_string(), EXIT_FAILURE);
                return (result, invocation.staged_media);
            }
        };
        info!(
            "{} exited with code {} after {:.1}s ({:?})",
            kind,
            outcome.exit_code,
            outcome.runtime_seconds(),
            outcome.termination
        );

        let extraction = adapter.extract_stats(ctx, &env, &outcome).await;
        info!("{}: resolved {} artifact(s)", kind, extraction.artifacts.len());
        if let Some(failure) = &extraction.failure {
            warn!("{}", failure);
        }
        let stats = &extraction.stats;

        let output_path = match writer.write_output(&outcome.combined_output()) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        let document = format_trajectory(kind.as_str(), extraction.trajectory.as_ref(), &outcome);
        let trajectory_path = match writer.write_trajectory(&document.text) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };

        let agent_version = if outcome.termination == Termination::NotFound {
            None
        } else {
            self.query_version(adapter, &ctx.binary, ctx.workdir(), &env).await
        };

        let verdict = Tentative::new(outcome.exit_code, extraction.error_event)
            .with_extraction_failure(extraction.failure.as_ref())
            .finalize(stats, extraction.trajectory.is_some(), adapter.requires_trajectory());
        for reason in &verdict.reasons {
            info!("{} verdict: {}", kind, reason);
        }

        let mut result = RunResult::launched(kind.as_str(), &outcome)
            .with_stats(stats)
            .with_output_path(output_path.as_deref())
            .with_trajectory_path(trajectory_path.as_deref());
        result.agent_version = agent_version;
        result.cakit_exit_code = verdict.code;
        (result, invocation.staged_media)
    }

    /// Runs the agent's version command and parses the first line.
    async fn query_version(
        &self,
        adapter: &dyn AgentAdapter,
        binary: &Path,
        cwd: &Path,
        env: &ComposedEnvironment,
    ) -> Option<String> {
        let spec = ProcessSpec::new(binary, cwd).args(adapter.version_args());
        let outcome = match self.process.run(&spec, env, Some(VERSION_TIMEOUT)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Version query failed: {}", e);
                return None;
            }
        };
        if !outcome.is_success() {
            return None;
        }
        let kind = adapter.kind();
        let text = if outcome.stdout.trim().is_empty() {
            &outcome.stderr
        } else {
            &outcome.stdout
        };
        parse_version(text, &[kind.binary(), kind.as_str()])
    }

    /// Returns the installed version of an agent, if it can be run.
    pub async fn version(&self, kind: AgentKind) -> Option<String> {
        let adapter = create_adapter(kind);
        let env = self.tool_environment();
        let binary = resolve_binary(kind.binary(), &kind.bin_env_var(), &self.snapshot, env.get("PATH"))
            .unwrap_or_else(|| PathBuf::from(kind.binary()));
        let cwd = self.snapshot.home().unwrap_or_else(std::env::temp_dir);
        self.query_version(adapter.as_ref(), &binary, &cwd, &env).await
    }

    /// Base environment plus user tool directories.
    fn tool_environment(&self) -> ComposedEnvironment {
        let mut env = ComposedEnvironment::base(&self.snapshot);
        env.prepend_path(&tool_dirs(&self.snapshot));
        env
    }

    /// Installs one agent and writes its configuration.
    pub async fn install(&self, kind: AgentKind, version: Option<&str>, scope: InstallScope) -> InstallResult {
        let adapter = create_adapter(kind);
        let version = version.map(str::trim).filter(|v| !v.is_empty());
        info!("Installing {} ({} scope)", kind, scope);

        let outcome = match self.install_spec(&adapter.install_plan(), kind, version, scope) {
            Ok((spec, env)) => self
                .process
                .run(&spec, &env, None)
                .await
                .map_err(InstallError::from),
            Err(e) => Err(e),
        };
        let (ok, details) = match outcome {
            Ok(outcome) => (outcome.is_success(), outcome.combined_output()),
            Err(e) => (false, e.to_string()),
        };
        if !ok {
            warn!("Install of {} failed", kind);
            return InstallResult {
                agent: kind.to_string(),
                config_path: None,
                details: Some(details),
                ok,
                version: None,
            };
        }

        let config_path = match adapter.configure(&self.snapshot) {
            Ok(path) => path.map(|p| p.display().to_string()),
            Err(e) => {
                warn!("Configure of {} failed: {}", kind, e);
                None
            }
        };
        InstallResult {
            agent: kind.to_string(),
            config_path,
            details: Some(details),
            ok,
            version: self.version(kind).await,
        }
    }

    /// Builds the installer command for a plan.
    fn install_spec(
        &self,
        plan: &InstallPlan,
        kind: AgentKind,
        version: Option<&str>,
        scope: InstallScope,
    ) -> Result<(ProcessSpec, ComposedEnvironment), InstallError> {
        if version.is_some() && !plan.supports_version() {
            return Err(InstallError::VersionUnsupported {
                agent: kind.to_string(),
            });
        }
        let mut env = self.tool_environment();
        env.pass_through(&self.snapshot, INSTALL_PASS_THROUGH);
        let cwd = self.snapshot.home().unwrap_or_else(std::env::temp_dir);

        let spec = match plan {
            InstallPlan::Npm { package } => {
                let package = match version {
                    Some(v) if v.starts_with('@') => format!("{}{}", package, v),
                    Some(v) => format!("{}@{}", package, v),
                    None => package.to_string(),
                };
                let mut spec = ProcessSpec::new("npm", &cwd).args(["install", "-g"]);
                if scope == InstallScope::User {
                    if let Some(prefix) = self.snapshot.dir_or_home("CAKIT_NPM_PREFIX", DEFAULT_NPM_PREFIX) {
                        fs::create_dir_all(&prefix).map_err(|source| InstallError::Config {
                            path: prefix.clone(),
                            source,
                        })?;
                        spec = spec.arg("--prefix").arg(prefix.display().to_string());
                    }
                }
                spec.arg(package)
            }
            InstallPlan::UvTool { package } => {
                let package = match version {
                    Some(v) => format!("{}=={}", package, v),
                    None => package.to_string(),
                };
                ProcessSpec::new("uv", &cwd)
                    .args(["tool", "install", "--force"])
                    .arg(package)
                    .args(["--python", PYTHON_VERSION])
            }
            InstallPlan::Pip {
                url_template,
                default_version,
            } => {
                let url = url_template.replace("{version}", version.unwrap_or(*default_version));
                ProcessSpec::new("python3", &cwd)
                    .args(["-m", "pip", "install", "--no-cache-dir"])
                    .arg(url)
            }
            InstallPlan::Script { url, version_env } => {
                if let (Some(name), Some(v)) = (version_env, version) {
                    let tag = if v.starts_with('v') {
                        v.to_string()
                    } else {
                        format!("v{}", v)
                    };
                    env.set(*name, tag);
                }
                env.set("CONFIGURE", "false");
                ProcessSpec::new("bash", &cwd)
                    .arg("-lc")
                    .arg(format!("curl -fsSL {} | bash", url))
            }
            InstallPlan::Archive {
                latest_url,
                url_template,
                entry,
            } => {
                let (os, arch) = archive_platform().ok_or_else(|| InstallError::UnsupportedPlatform {
                    agent: kind.to_string(),
                    platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
                })?;
                let home = self
                    .snapshot
                    .home()
                    .ok_or_else(|| EnvError::Missing(vec!["HOME".to_string()]))?;
                env.set(
                    "CAKIT_ARCHIVE_ROOT",
                    home.join(".local/share/cakit").join(kind.as_str()).display().to_string(),
                )
                .set("CAKIT_BIN_DIR", home.join(".local/bin").display().to_string());
                if let Some(v) = version {
                    env.set("CAKIT_ARCHIVE_VERSION", v.trim_start_matches('v'));
                }
                let url = url_template
                    .replace("{os}", os)
                    .replace("{arch}", arch)
                    .replace("{version}", "${version}");
                ProcessSpec::new("bash", &cwd).arg("-c").arg(archive_script(latest_url, &url, entry, kind.binary()))
            }
        };
        debug!("Install command: {}", spec.display());
        Ok((spec, env))
    }

    /// Writes agent-native configuration.
    pub fn configure(&self, kind: AgentKind) -> ConfigureResult {
        match create_adapter(kind).configure(&self.snapshot) {
            Ok(Some(path)) => {
                info!("Wrote {} config to {}", kind, path.display());
                ConfigureResult {
                    agent: kind.to_string(),
                    config_path: Some(path.display().to_string()),
                    details: None,
                    ok: true,
                }
            }
            Ok(None) => ConfigureResult {
                agent: kind.to_string(),
                config_path: None,
                details: Some("no config written".to_string()),
                ok: true,
            },
            Err(e) => ConfigureResult {
                agent: kind.to_string(),
                config_path: None,
                details: Some(e.to_string()),
                ok: false,
            },
        }
    }
}

/// Checks the request before anything is spawned.
fn validate(
    adapter: &dyn AgentAdapter,
    request: &RunRequest,
    snapshot: &EnvSnapshot,
) -> Result<(MediaSet, Option<ReasoningEffort>), UsageError> {
    if request.prompt.trim().is_empty() {
        return Err(UsageError::EmptyPrompt);
    }
    if !request.workdir.is_dir() {
        return Err(UsageError::MissingWorkdir(request.workdir.clone()));
    }

    let capabilities = adapter.capabilities();
    let display_name = request.agent.display_name();
    let media = resolve_media(&request.images, &request.videos, snapshot)?;
    media.check_supported(capabilities.images, capabilities.videos, display_name)?;

    let effort = request.parsed_reasoning_effort()?;
    if let Some(level) = effort {
        if capabilities.reasoning_efforts.is_empty() {
            return Err(UsageError::ReasoningEffortUnsupported(display_name.to_string()));
        }
        if !capabilities.reasoning_efforts.contains(&level) {
            return Err(UsageError::InvalidReasoningEffort {
                value: level.to_string(),
                allowed: ReasoningEffort::joined(capabilities.reasoning_efforts),
            });
        }
    }
    Ok((media, effort))
}

/// A result for a run that never started, with its message written out.
fn reject(kind: AgentKind, settings: &EngineSettings, message: String, code: i32) -> RunResult {
    let writer = OutputWriter::new(&settings.output_dir, kind.as_str(), &Uuid::new_v4(), Local::now());
    rejected_with_output(kind, &writer, message, code)
}

fn rejected_with_output(kind: AgentKind, writer: &OutputWriter, message: String, code: i32) -> RunResult {
    let output_path = match writer.write_output(&message) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("{}", e);
            None
        }
    };
    RunResult::rejected(kind.as_str(), message, code).with_output_path(output_path.as_deref())
}

/// Removes staged media and the scratch directory.
///
/// Scratch is kept when the result still points into it.
fn cleanup(ctx: &RunContext, staged: &[PathBuf], result: &RunResult, keep_scratch: bool) {
    for path in staged {
        if let Err(e) = fs::remove_file(path) {
            debug!("Could not remove staged {}: {}", path.display(), e);
        }
    }
    if !staged.is_empty() {
        // only succeeds when nothing else lives there
        let _ = fs::remove_dir(ctx.workdir().join(STAGE_DIR));
    }

    let referenced = result
        .telemetry_log
        .as_deref()
        .is_some_and(|log| Path::new(log).starts_with(&ctx.scratch));
    if keep_scratch || referenced {
        debug!("Keeping run directory {}", ctx.scratch.display());
        return;
    }
    if let Err(e) = fs::remove_dir_all(&ctx.scratch) {
        warn!("Failed to remove {}: {}", ctx.scratch.display(), e);
    }
}

/// Release naming of the host platform, e.g. `("linux", "amd64")`.
fn archive_platform() -> Option<(&'static str, &'static str)> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        _ => return None,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        _ => return None,
    };
    Some((os, arch))
}

/// Download, unpack and link script for [`InstallPlan::Archive`].
///
/// Paths and the requested version arrive through the environment.
fn archive_script(latest_url: &str, url: &str, entry: &str, binary: &str) -> String {
    format!(
        r#"set -eu
version="${{CAKIT_ARCHIVE_VERSION:-$(curl -fsSL "{latest_url}")}}"
version="$(printf '%s' "$version" | tr -d '[:space:]')"
version="${{version#v}}"
root="$CAKIT_ARCHIVE_ROOT/v$version"
archive="$(mktemp)"
trap 'rm -f "$archive"' EXIT
curl -fsSL -o "$archive" "{url}"
mkdir -p "$root" "$CAKIT_BIN_DIR"
tar -xzf "$archive" -C "$root"
test -x "$root/{entry}"
ln -sf "$root/{entry}" "$CAKIT_BIN_DIR/{binary}"
"#
    )
}

/// First non-empty line, without a leading `<name> ` or `<name> version `.
pub fn parse_version(output: &str, names: &[&str]) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let lower = line.to_lowercase();
    for name in names {
        for prefix in [format!("{} version ", name), format!("{} ", name)] {
            if lower.starts_with(&prefix) {
                if let Some(rest) = line.get(prefix.len()..).map(str::trim).filter(|r| !r.is_empty()) {
                    return Some(rest.to_string());
                }
            }
        }
    }
    Some(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::agents::testing::script;
    use crate::runner::process::EXIT_TIMED_OUT;
    use tempfile::TempDir;

    const GEMINI_RESULT: &str = r#"{"response":"Done.","stats":{"models":{"gemini-2.5-pro":{"api":{"totalRequests":2},"tokens":{"prompt":100,"candidates":20,"total":120}}},"tools":{"totalCalls":1}}}"#;

    struct Fixture {
        home: TempDir,
        work: TempDir,
        out: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                home: TempDir::new().unwrap(),
                work: TempDir::new().unwrap(),
                out: TempDir::new().unwrap(),
            }
        }

        /// A fake gemini binary whose run prints `body`.
        fn runner(&self, body: &str) -> AgentRunner {
            self.runner_for(AgentKind::Gemini, body)
        }

        fn runner_for(&self, kind: AgentKind, body: &str) -> AgentRunner {
            let bin = script(
                self.home.path(),
                kind.binary(),
                &format!(
                    "if [ \"$1\" = \"--version\" ]; then echo '{} 0.9.0'; exit 0; fi\n{}",
                    kind.binary(),
                    body
                ),
            );
            self.runner_with(&[(kind.bin_env_var().as_str(), bin.to_str().unwrap())])
        }

        fn runner_with(&self, extra: &[(&str, &str)]) -> AgentRunner {
            let mut pairs = vec![
                ("HOME".to_string(), self.home.path().display().to_string()),
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("CAKIT_OUTPUT_DIR".to_string(), self.out.path().display().to_string()),
            ];
            pairs.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
            AgentRunner::new(EnvSnapshot::from_pairs(pairs))
        }

        fn request(&self, kind: AgentKind) -> RunRequest {
            RunRequest::new(kind, "fix the tests", self.work.path())
        }
    }

    #[tokio::test]
    async fn test_successful_run() {
        let fx = Fixture::new();
        let runner = fx.runner(&format!("echo '{}'", GEMINI_RESULT));

        let result = runner.run(fx.request(AgentKind::Gemini)).await;
        assert_eq!(result.cakit_exit_code, 0, "{:?}", result);
        assert_eq!(result.command_exit_code, Some(0));
        assert_eq!(result.models_usage["gemini-2.5-pro"].total_tokens, 120);
        assert_eq!(result.llm_calls, Some(2));
        assert_eq!(result.response.as_deref(), Some("Done."));
        assert_eq!(result.agent_version.as_deref(), Some("0.9.0"));
        let output = result.output_path.unwrap();
        assert!(output.starts_with(&fx.out.path().display().to_string()));
        assert!(fs::read_to_string(output).unwrap().contains("gemini-2.5-pro"));
        let trajectory = fs::read_to_string(result.trajectory_path.unwrap()).unwrap();
        assert!(trajectory.starts_with("# cakit trajectory\nagent: gemini\nsource: stdout result\n"));
    }

    #[tokio::test]
    async fn test_child_exit_code_passes_through() {
        let fx = Fixture::new();
        let runner = fx.runner(&format!("echo '{}'\nexit 7", GEMINI_RESULT));

        let result = runner.run(fx.request(AgentKind::Gemini)).await;
        assert_eq!(result.command_exit_code, Some(7));
        assert_eq!(result.cakit_exit_code, 7);
    }

    #[tokio::test]
    async fn test_missing_usage_forces_failure() {
        let fx = Fixture::new();
        let runner = fx.runner("echo '{\"response\":\"Done.\"}'");

        let result = runner.run(fx.request(AgentKind::Gemini)).await;
        assert_eq!(result.command_exit_code, Some(0));
        assert_eq!(result.cakit_exit_code, EXIT_FAILURE);
        assert!(result.models_usage.is_empty());
        assert_eq!(result.llm_calls, None);
        assert_eq!(result.tool_calls, None);
        // decoded fields survive the failed usage decode
        assert_eq!(result.response.as_deref(), Some("Done."));
    }

    #[tokio::test]
    async fn test_usage_without_tool_fields_passes() {
        let fx = Fixture::new();
        let body = r#"while [ $# -gt 0 ]; do
  if [ "$1" = "--log-dir" ]; then dir="$2"; fi
  shift
done
cat > "$dir/process-1.log" <<'LOG'
2025-01-10T10:00:01.000Z [DEBUG] data:
2025-01-10T10:00:01.000Z [DEBUG] {"model": "gpt-5", "choices": [{"message": {"content": "Fixed it."}}], "usage": {"prompt_tokens": 120, "completion_tokens": 30, "total_tokens": 150}}
LOG
echo 'Fixed it.'"#;
        let runner = fx.runner_for(AgentKind::Copilot, body);

        let result = runner.run(fx.request(AgentKind::Copilot)).await;
        assert_eq!(result.cakit_exit_code, 0, "{:?}", result);
        assert_eq!(result.models_usage["gpt-5"].prompt_tokens, 120);
        assert_eq!(result.models_usage["gpt-5"].completion_tokens, 30);
        assert_eq!(result.models_usage["gpt-5"].total_tokens, 150);
        assert_eq!(result.llm_calls, Some(1));
        assert_eq!(result.tool_calls, Some(0));
        assert_eq!(result.response.as_deref(), Some("Fixed it."));
        let log_dir = PathBuf::from(result.telemetry_log.unwrap());
        assert!(log_dir.join("process-1.log").is_file());
        fs::remove_dir_all(log_dir.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_error_event_forces_failure() {
        let fx = Fixture::new();
        let body = GEMINI_RESULT.replacen('{', "{\"error\":{\"message\":\"quota\"},", 1);
        let runner = fx.runner(&format!("echo '{}'", body));

        let result = runner.run(fx.request(AgentKind::Gemini)).await;
        assert_eq!(result.command_exit_code, Some(0));
        assert_eq!(result.cakit_exit_code, EXIT_FAILURE);
    }

    const OPENCLAW_VARS: [(&str, &str); 3] = [
        ("CAKIT_OPENCLAW_API_KEY", "sk-oc"),
        ("CAKIT_OPENCLAW_BASE_URL", "https://llm.internal/v1"),
        ("CAKIT_OPENCLAW_MODEL", "m"),
    ];

    fn openclaw_runner(fx: &Fixture, body: &str) -> AgentRunner {
        let bin = script(fx.home.path(), "openclaw", body);
        let bin_var = AgentKind::Openclaw.bin_env_var();
        let mut vars = vec![(bin_var.as_str(), bin.to_str().unwrap())];
        vars.extend(OPENCLAW_VARS);
        fx.runner_with(&vars)
    }

    #[tokio::test]
    async fn test_setup_runs_before_agent() {
        let fx = Fixture::new();
        let body = r#"case "$1" in
  onboard) mkdir -p "$OPENCLAW_HOME" && touch "$OPENCLAW_HOME/onboarded" ;;
  agent)
    test -f "$OPENCLAW_HOME/onboarded" || exit 9
    dir="$OPENCLAW_HOME/.openclaw/agents/main/sessions"
    mkdir -p "$dir"
    echo '{"message":{"role":"assistant","usage":{"input":10,"output":2}}}' > "$dir/$6.jsonl"
    echo '{"payloads":[{"text":"Done."}],"meta":{"agentMeta":{"provider":"p","model":"m","usage":{"input":10,"output":2}}}}'
    ;;
esac"#;
        let runner = openclaw_runner(&fx, body);

        let result = runner.run(fx.request(AgentKind::Openclaw)).await;
        assert_eq!(result.command_exit_code, Some(0), "{:?}", result);
        assert_eq!(result.cakit_exit_code, 0);
        assert_eq!(result.models_usage["p/m"].total_tokens, 12);
        assert_eq!(result.llm_calls, Some(1));
        assert_eq!(result.response.as_deref(), Some("Done."));
    }

    #[tokio::test]
    async fn test_failed_setup_stops_run() {
        let fx = Fixture::new();
        let marker = fx.work.path().join("agent-started");
        let body = format!(
            "case \"$1\" in\n  onboard) echo 'invalid key' >&2; exit 4 ;;\n  agent) touch '{}' ;;\nesac",
            marker.display()
        );
        let runner = openclaw_runner(&fx, &body);

        let result = runner.run(fx.request(AgentKind::Openclaw)).await;
        assert_eq!(result.cakit_exit_code, EXIT_FAILURE);
        assert_eq!(result.command_exit_code, None);
        let message = result.response.unwrap();
        assert!(message.contains("exited with code 4"), "{}", message);
        assert!(message.contains("invalid key"));
        assert!(!message.contains("sk-oc"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_127() {
        let fx = Fixture::new();
        let empty = TempDir::new().unwrap();
        let runner = AgentRunner::new(EnvSnapshot::from_pairs([
            ("HOME".to_string(), fx.home.path().display().to_string()),
            ("PATH".to_string(), empty.path().display().to_string()),
            ("CAKIT_OUTPUT_DIR".to_string(), fx.out.path().display().to_string()),
        ]));

        let result = runner.run(fx.request(AgentKind::Gemini)).await;
        assert_eq!(result.command_exit_code, Some(127));
        assert_eq!(result.cakit_exit_code, 127);
        assert!(result.agent_version.is_none());
    }

    #[tokio::test]
    async fn test_deadline_kills_child() {
        let fx = Fixture::new();
        let runner = fx.runner("echo partial\nexec sleep 5");
        let request = fx
            .request(AgentKind::Gemini)
            .with_timeout(Some(Duration::from_millis(300)));

        let result = runner.run(request).await;
        assert_eq!(result.cakit_exit_code, EXIT_TIMED_OUT);
        assert!(result.raw_output.contains("partial"));
    }

    #[tokio::test]
    async fn test_empty_prompt_is_usage_error() {
        let fx = Fixture::new();
        let runner = fx.runner("exit 0");
        let request = RunRequest::new(AgentKind::Gemini, "   ", fx.work.path());

        let result = runner.run(request).await;
        assert_eq!(result.cakit_exit_code, UsageError::EXIT_CODE);
        assert_eq!(result.command_exit_code, None);
        assert_eq!(result.response.as_deref(), Some("prompt is required"));
        assert_eq!(fs::read_to_string(result.output_path.unwrap()).unwrap(), "prompt is required");
    }

    #[tokio::test]
    async fn test_unsupported_video_is_usage_error() {
        let fx = Fixture::new();
        let video = fx.work.path().join("clip.mp4");
        fs::write(&video, "mp4").unwrap();
        let runner = fx.runner_with(&[]);
        let request = fx
            .request(AgentKind::Codex)
            .with_videos(vec![video.display().to_string()]);

        let result = runner.run(request).await;
        assert_eq!(result.cakit_exit_code, 2);
        assert_eq!(
            result.response.as_deref(),
            Some("video input is not supported by OpenAI Codex CLI.")
        );
    }

    #[tokio::test]
    async fn test_reasoning_effort_checked_against_agent() {
        let fx = Fixture::new();
        let runner = fx.runner_with(&[]);

        let request = fx
            .request(AgentKind::Aider)
            .with_reasoning_effort(Some("xhigh".to_string()));
        let result = runner.run(request).await;
        assert_eq!(result.cakit_exit_code, 2);
        assert!(result.response.unwrap().contains("low, medium, high"));

        let request = fx
            .request(AgentKind::Gemini)
            .with_reasoning_effort(Some("bogus".to_string()));
        assert_eq!(runner.run(request).await.cakit_exit_code, 2);
    }

    #[tokio::test]
    async fn test_missing_variables_fail_without_spawn() {
        let fx = Fixture::new();
        let runner = fx.runner_with(&[]);

        let result = runner.run(fx.request(AgentKind::Openhands)).await;
        assert_eq!(result.cakit_exit_code, EXIT_FAILURE);
        assert_eq!(result.command_exit_code, None);
        assert!(result.response.unwrap().contains("LLM_API_KEY"));
    }

    #[tokio::test]
    async fn test_env_file_overrides_snapshot() {
        let fx = Fixture::new();
        let env_file = fx.home.path().join("run.env");
        fs::write(&env_file, "LLM_API_KEY=from-file\nLLM_MODEL=gpt-4.1\n").unwrap();
        let runner = fx.runner_with(&[("CAKIT_OPENHANDS_BIN", "/nonexistent/openhands")]);

        let request = fx.request(AgentKind::Openhands).with_env_file(Some(env_file));
        let result = runner.run(request).await;
        // the environment composed, so the run reached the spawn
        assert_eq!(result.command_exit_code, Some(127));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("\ncodex-cli 0.46.0\n", &["codex"]).as_deref(), Some("codex-cli 0.46.0"));
        assert_eq!(parse_version("goose version 1.9.3", &["goose"]).as_deref(), Some("1.9.3"));
        assert_eq!(parse_version("aider 0.86.1\nextra", &["aider"]).as_deref(), Some("0.86.1"));
        assert_eq!(parse_version("  \n", &["aider"]), None);
    }

    #[test]
    fn test_configure_reports_no_op() {
        let fx = Fixture::new();
        let runner = fx.runner_with(&[]);
        let result = runner.configure(AgentKind::Aider);
        assert!(result.ok);
        assert!(result.config_path.is_none());
        assert_eq!(result.details.as_deref(), Some("no config written"));
    }

    #[test]
    fn test_install_spec_per_plan() {
        let fx = Fixture::new();
        let runner = fx.runner_with(&[]);

        let (spec, _) = runner
            .install_spec(&InstallPlan::Npm { package: "@openai/codex" }, AgentKind::Codex, Some("0.46.0"), InstallScope::User)
            .unwrap();
        assert_eq!(spec.args[..3], ["install", "-g", "--prefix"]);
        assert_eq!(spec.args.last().map(String::as_str), Some("@openai/codex@0.46.0"));
        assert!(fx.home.path().join(DEFAULT_NPM_PREFIX).is_dir());

        let (spec, _) = runner
            .install_spec(&InstallPlan::UvTool { package: "aider-chat" }, AgentKind::Aider, Some("0.86.1"), InstallScope::Global)
            .unwrap();
        assert!(spec.args.contains(&"aider-chat==0.86.1".to_string()));

        let plan = InstallPlan::Script {
            url: "https://example.invalid/install.sh",
            version_env: Some("GOOSE_VERSION"),
        };
        let (_, env) = runner
            .install_spec(&plan, AgentKind::Goose, Some("1.9.3"), InstallScope::User)
            .unwrap();
        assert_eq!(env.get("GOOSE_VERSION"), Some("v1.9.3"));

        let plan = InstallPlan::Script {
            url: "https://example.invalid/install.sh",
            version_env: None,
        };
        assert!(matches!(
            runner.install_spec(&plan, AgentKind::Goose, Some("1.0"), InstallScope::User),
            Err(InstallError::VersionUnsupported { .. })
        ));
    }

    #[test]
    fn test_archive_install_spec() {
        let fx = Fixture::new();
        let runner = fx.runner_with(&[]);
        let plan = InstallPlan::Archive {
            latest_url: "https://example.invalid/latest.txt",
            url_template: "https://example.invalid/tool_{version}_{os}_{arch}.tar.gz",
            entry: "tool",
        };

        let built = runner.install_spec(&plan, AgentKind::TraeCn, Some("v0.9.1"), InstallScope::User);
        let Some((os, arch)) = archive_platform() else {
            assert!(matches!(built, Err(InstallError::UnsupportedPlatform { .. })));
            return;
        };
        let (spec, env) = built.unwrap();
        assert_eq!(spec.program, PathBuf::from("bash"));
        assert_eq!(env.get("CAKIT_ARCHIVE_VERSION"), Some("0.9.1"));
        let root = fx.home.path().join(".local/share/cakit/trae-cn");
        assert_eq!(env.get("CAKIT_ARCHIVE_ROOT"), Some(root.to_str().unwrap()));
        let script = &spec.args[1];
        assert!(script.contains(&format!("tool_${{version}}_{}_{}.tar.gz", os, arch)));
        assert!(script.contains("ln -sf \"$root/tool\" \"$CAKIT_BIN_DIR/traecli\""));

        let (_, env) = runner
            .install_spec(&plan, AgentKind::TraeCn, None, InstallScope::User)
            .unwrap();
        assert!(!env.contains("CAKIT_ARCHIVE_VERSION"));
    }
}
