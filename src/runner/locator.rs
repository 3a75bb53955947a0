//! Artifact Locator.
//!
//! Resolves executables and per-run artifact files by exact identifiers.
//! Nothing here ever picks a file by modification time: a lookup either
//! finds exactly one file tied to the run's identifier or reports why not.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use super::env::EnvSnapshot;

/// Default npm prefix for user-scope installs, relative to home.
pub const DEFAULT_NPM_PREFIX: &str = ".npm-global";

/// Directories where user-scope installers place executables.
///
/// Only directories that exist are returned.
pub fn tool_dirs(snapshot: &EnvSnapshot) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(prefix) = snapshot.dir_or_home("CAKIT_NPM_PREFIX", DEFAULT_NPM_PREFIX) {
        candidates.push(prefix.join("bin"));
    }
    if let Some(home) = snapshot.home() {
        candidates.push(home.join(".npm").join("bin"));
        candidates.push(home.join(".local").join("bin"));
    }
    let mut dirs: Vec<PathBuf> = Vec::new();
    for dir in candidates {
        if dir.is_dir() && !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// Resolves an agent executable.
///
/// Order: the explicit `bin_var` path, `PATH` search, then the user-scope
/// tool directories. Returns `None` when nothing matched.
pub fn resolve_binary(
    binary: &str,
    bin_var: &str,
    snapshot: &EnvSnapshot,
    search_path: Option<&str>,
) -> Option<PathBuf> {
    if let Some(explicit) = snapshot.get(bin_var) {
        let path = snapshot.expand(explicit);
        if path.is_file() {
            debug!("Using {} from {}", path.display(), bin_var);
            return Some(path);
        }
        debug!("{} points at a missing file: {}", bin_var, path.display());
    }

    let cwd = std::env::temp_dir();
    if let Some(path_value) = search_path {
        if let Ok(found) = which::which_in(binary, Some(path_value), &cwd) {
            return Some(found);
        }
    }

    tool_dirs(snapshot)
        .into_iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Why a lookup did not produce exactly one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// No identifier was available to match against.
    MissingIdentifier(String),
    /// The identifier does not support the required derivation.
    UnsupportedIdentifier(String),
    /// No file matched the identifier.
    NotFound(String),
    /// More than one file matched the identifier.
    Ambiguous { pattern: String, count: usize },
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocateError::MissingIdentifier(what) => write!(f, "{} not found in run output", what),
            LocateError::UnsupportedIdentifier(why) => f.write_str(why),
            LocateError::NotFound(what) => write!(f, "no artifact matches {}", what),
            LocateError::Ambiguous { pattern, count } => {
                write!(f, "{} artifacts match {}, expected exactly one", count, pattern)
            }
        }
    }
}

/// Returns the single path matching a glob pattern.
///
/// Callers build the pattern from escaped directory parts plus the run's
/// identifier, so a match is an identifier match.
pub fn unique_glob(pattern: &str) -> Result<PathBuf, LocateError> {
    let paths = glob::glob(pattern).map_err(|e| LocateError::NotFound(format!("{} ({})", pattern, e.msg)))?;
    let mut matches: Vec<PathBuf> = paths.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    match matches.len() {
        0 => Err(LocateError::NotFound(pattern.to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(LocateError::Ambiguous {
            pattern: pattern.to_string(),
            count,
        }),
    }
}

/// Finds the single file under `root` whose name equals `file_name`.
pub fn unique_named_file(root: &Path, file_name: &str, max_depth: usize) -> Result<PathBuf, LocateError> {
    let mut matches: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == file_name)
        .map(|entry| entry.into_path())
        .collect();
    matches.sort();
    match matches.len() {
        0 => Err(LocateError::NotFound(format!("{}/**/{}", root.display(), file_name))),
        1 => Ok(matches.remove(0)),
        count => Err(LocateError::Ambiguous {
            pattern: format!("{}/**/{}", root.display(), file_name),
            count,
        }),
    }
}

/// Lists files in `dir` matching `pattern`, sorted by name.
pub fn sorted_files(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
    let mut files: Vec<PathBuf> = match glob::glob(&full) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}

/// Embedded timestamp of a UUIDv7, in UTC.
pub fn uuid_v7_timestamp(id: &str) -> Result<DateTime<Utc>, LocateError> {
    let uuid = Uuid::parse_str(id)
        .map_err(|_| LocateError::UnsupportedIdentifier(format!("'{}' is not a UUID", id)))?;
    if uuid.get_version_num() != 7 {
        return Err(LocateError::UnsupportedIdentifier(format!(
            "'{}' is a version {} UUID, a time-ordered v7 id is required",
            id,
            uuid.get_version_num()
        )));
    }
    let bytes = uuid.as_bytes();
    let millis = bytes[..6]
        .iter()
        .fold(0i64, |acc, byte| (acc << 8) | i64::from(*byte));
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| LocateError::UnsupportedIdentifier(format!("'{}' carries an invalid timestamp", id)))
}

/// Date-partitioned session directory for a time-ordered thread id.
pub fn date_partition(root: &Path, thread_id: &str) -> Result<PathBuf, LocateError> {
    let ts = uuid_v7_timestamp(thread_id)?;
    Ok(root.join(ts.format("%Y/%m/%d").to_string()))
}

/// Kind of a run artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Session,
    Trajectory,
    Store,
    Telemetry,
    Log,
}

/// One exactly-identified artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// The identifier this path was matched on.
    pub identifier: String,
}

/// Artifacts associated with one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunArtifactSet {
    items: Vec<ArtifactRef>,
}

impl RunArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: ArtifactKind, path: impl Into<PathBuf>, identifier: impl Into<String>) {
        self.items.push(ArtifactRef {
            kind,
            path: path.into(),
            identifier: identifier.into(),
        });
    }

    /// First artifact of the given kind.
    pub fn first(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.items.iter().find(|item| item.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
