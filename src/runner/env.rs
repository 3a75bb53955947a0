//! Environment composition for child processes.
//!
//! The parent environment is captured once into an [`EnvSnapshot`] and never
//! written to. Each run builds a fresh [`ComposedEnvironment`] containing a
//! small base set, the agent's whitelisted variables and run-specific values.
//! The Process Runner clears the inherited environment and applies only this
//! mapping, so overrides never leak outside the spawned child.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::EnvError;

/// Variables copied from the parent into every child environment.
pub const BASE_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "LANG", "LC_ALL", "TERM", "TMPDIR", "SHELL",
];

/// Prefix reserved for variables that only cakit understands.
pub const CAKIT_PREFIX: &str = "CAKIT_";

/// Read-only view of the parent environment, optionally overlaid with an env file.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// Captures the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Builds a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Overlays values read from an env file. File values win.
    pub fn with_env_file(mut self, path: &Path) -> Result<Self, EnvError> {
        let pairs = load_env_file(path)?;
        debug!("Loaded {} variables from {}", pairs.len(), path.display());
        self.vars.extend(pairs);
        Ok(self)
    }

    /// Returns a variable when it is set to a non-blank value.
    ///
    /// The value is returned verbatim apart from surrounding whitespace.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Returns the raw value, including empty strings.
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Returns the first non-blank variable in priority order.
    pub fn first_of(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| self.get(name))
    }

    /// Checks if a variable is set to a truthy value (1, true, yes, y, on).
    pub fn flag(&self, name: &str) -> bool {
        matches!(
            self.get(name).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "y" | "on")
        )
    }

    /// Home directory as seen by the child.
    pub fn home(&self) -> Option<PathBuf> {
        self.get("HOME").map(PathBuf::from).or_else(dirs::home_dir)
    }

    /// Expands a leading `~` against [`EnvSnapshot::home`].
    pub fn expand(&self, value: &str) -> PathBuf {
        if value == "~" {
            return self.home().unwrap_or_else(|| PathBuf::from(value));
        }
        if let Some(rest) = value.strip_prefix("~/") {
            if let Some(home) = self.home() {
                return home.join(rest);
            }
        }
        PathBuf::from(value)
    }

    /// Resolves a directory from a variable, or a default relative to home.
    pub fn dir_or_home(&self, var: &str, default_under_home: &str) -> Option<PathBuf> {
        match self.get(var) {
            Some(value) => Some(self.expand(value)),
            None => self.home().map(|h| h.join(default_under_home)),
        }
    }
}

/// Parses `.env` style content.
///
/// Blank lines and `#` comments are skipped, an `export ` prefix is removed,
/// the first `=` splits name from value and one pair of matching quotes is
/// stripped from the value.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("export ") {
            line = rest.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            let first = bytes[0];
            if (first == b'"' || first == b'\'') && bytes[value.len() - 1] == first {
                value = &value[1..value.len() - 1];
            }
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    pairs
}

/// Reads and parses an env file.
pub fn load_env_file(path: &Path) -> Result<Vec<(String, String)>, EnvError> {
    let content = fs::read_to_string(path).map_err(|source| EnvError::EnvFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_env_file(&content))
}

/// Resolves a model name.
///
/// Priority: explicit override, then the agent-specific variable, then the
/// generic fallback variable.
pub fn resolve_model(
    explicit: Option<&str>,
    snapshot: &EnvSnapshot,
    agent_var: &str,
    generic_var: Option<&str>,
) -> Option<String> {
    if let Some(value) = explicit.map(str::trim).filter(|v| !v.is_empty()) {
        return Some(value.to_string());
    }
    if let Some(value) = snapshot.get(agent_var) {
        return Some(value.to_string());
    }
    generic_var
        .and_then(|name| snapshot.get(name))
        .map(str::to_string)
}

/// Collects missing required variables into one [`EnvError::Missing`].
#[derive(Debug, Default)]
pub struct Requirements {
    missing: Vec<String>,
}

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `label` as missing when `value` is absent.
    pub fn require<'a>(&mut self, value: Option<&'a str>, label: &str) -> Option<&'a str> {
        if value.is_none() {
            self.missing.push(label.to_string());
        }
        value
    }

    pub fn finish(self) -> Result<(), EnvError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(EnvError::Missing(self.missing))
        }
    }
}

/// The exact environment handed to one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedEnvironment {
    vars: BTreeMap<String, String>,
}

impl ComposedEnvironment {
    /// An empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the base variables present in the snapshot.
    pub fn base(snapshot: &EnvSnapshot) -> Self {
        let mut env = Self::new();
        for name in BASE_VARS {
            if let Some(value) = snapshot.raw(name) {
                env.vars.insert((*name).to_string(), value.to_string());
            }
        }
        env
    }

    /// Sets a variable.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Sets a variable only when a value is present.
    pub fn set_opt(&mut self, name: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.vars.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Copies whitelisted variables from the snapshot under the same names.
    pub fn pass_through(&mut self, snapshot: &EnvSnapshot, names: &[&str]) -> &mut Self {
        for name in names {
            self.set_opt(name, snapshot.get(name));
        }
        self
    }

    /// Prepends directories to `PATH`.
    pub fn prepend_path(&mut self, dirs: &[PathBuf]) -> &mut Self {
        if dirs.is_empty() {
            return self;
        }
        let mut entries: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
        if let Some(current) = self.vars.get("PATH").filter(|p| !p.is_empty()) {
            entries.push(current.clone());
        }
        self.vars.insert("PATH".to_string(), entries.join(":"));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn snapshot() -> EnvSnapshot {
        EnvSnapshot::from_pairs([
            ("PATH", "/usr/bin"),
            ("HOME", "/home/tester"),
            ("SECRET_TOKEN", "leak"),
            ("CODEX_MODEL", "gpt-5"),
            ("OPENAI_DEFAULT_MODEL", "gpt-4.1"),
            ("BLANK", "   "),
        ])
    }

    #[test]
    fn test_parse_env_file() {
        let content = "# comment\n\nexport A=1\nB = \"two words\"\nC='x=y'\nD=\"unterminated\nnot a pair\n=novalue\n";
        let pairs = parse_env_file(content);
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
                ("C".to_string(), "x=y".to_string()),
                ("D".to_string(), "\"unterminated".to_string()),
            ]
        );
    }

    #[test]
    fn test_env_file_overrides_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "CODEX_MODEL=o3\nNEW_VAR=1\n").unwrap();

        let snap = snapshot().with_env_file(&path).unwrap();
        assert_eq!(snap.get("CODEX_MODEL"), Some("o3"));
        assert_eq!(snap.get("NEW_VAR"), Some("1"));
    }

    #[test]
    fn test_missing_env_file_is_error() {
        let err = snapshot()
            .with_env_file(Path::new("/nonexistent/cakit.env"))
            .unwrap_err();
        assert!(matches!(err, EnvError::EnvFile { .. }));
    }

    #[test]
    fn test_blank_values_are_absent() {
        let snap = snapshot();
        assert_eq!(snap.get("BLANK"), None);
        assert_eq!(snap.raw("BLANK"), Some("   "));
        assert_eq!(snap.first_of(&["BLANK", "CODEX_MODEL"]), Some("gpt-5"));
    }

    #[test]
    fn test_model_priority() {
        let snap = snapshot();
        assert_eq!(
            resolve_model(Some("o4-mini"), &snap, "CODEX_MODEL", Some("OPENAI_DEFAULT_MODEL")),
            Some("o4-mini".to_string())
        );
        assert_eq!(
            resolve_model(None, &snap, "CODEX_MODEL", Some("OPENAI_DEFAULT_MODEL")),
            Some("gpt-5".to_string())
        );
        assert_eq!(
            resolve_model(None, &snap, "AIDER_MODEL", Some("OPENAI_DEFAULT_MODEL")),
            Some("gpt-4.1".to_string())
        );
        assert_eq!(resolve_model(Some("  "), &snap, "AIDER_MODEL", None), None);
    }

    #[test]
    fn test_base_excludes_unlisted_variables() {
        let env = ComposedEnvironment::base(&snapshot());
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_eq!(env.get("HOME"), Some("/home/tester"));
        assert!(!env.contains("SECRET_TOKEN"));
        assert!(!env.contains("CODEX_MODEL"));
    }

    #[test]
    fn test_model_override_stays_in_composed_mapping() {
        let snap = snapshot();
        let mut first = ComposedEnvironment::base(&snap);
        let model = resolve_model(Some("override-model"), &snap, "CODEX_MODEL", None);
        first.set_opt("CODEX_MODEL", model.as_deref());
        assert_eq!(first.get("CODEX_MODEL"), Some("override-model"));

        // a later run composed from the same snapshot sees the original value
        let mut second = ComposedEnvironment::base(&snap);
        let model = resolve_model(None, &snap, "CODEX_MODEL", None);
        second.set_opt("CODEX_MODEL", model.as_deref());
        assert_eq!(second.get("CODEX_MODEL"), Some("gpt-5"));
        assert_eq!(snap.get("CODEX_MODEL"), Some("gpt-5"));
        assert_ne!(std::env::var("CODEX_MODEL").ok().as_deref(), Some("override-model"));
    }

    #[test]
    fn test_prepend_path() {
        let mut env = ComposedEnvironment::base(&snapshot());
        env.prepend_path(&[PathBuf::from("/opt/npm/bin")]);
        assert_eq!(env.get("PATH"), Some("/opt/npm/bin:/usr/bin"));
    }

    #[test]
    fn test_requirements() {
        let mut req = Requirements::new();
        assert_eq!(req.require(Some("k"), "A"), Some("k"));
        req.require(None, "B");
        req.require(None, "C");
        match req.finish() {
            Err(EnvError::Missing(names)) => assert_eq!(names, vec!["B", "C"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expand_home() {
        let snap = snapshot();
        assert_eq!(snap.expand("~/x/y"), PathBuf::from("/home/tester/x/y"));
        assert_eq!(snap.expand("/abs"), PathBuf::from("/abs"));
        assert_eq!(
            snap.dir_or_home("CODEX_HOME", ".codex"),
            Some(PathBuf::from("/home/tester/.codex"))
        );
    }
}
