//! Raw output and trajectory files.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::debug;
use uuid::Uuid;

use crate::error::ArtifactError;

/// Writes per-run files into the output directory.
#[derive(Debug, Clone)]
pub struct OutputWriter {
    dir: PathBuf,
    stem: String,
}

impl OutputWriter {
    /// `stem` is `{agent}-{YYYYmmdd-HHMMSS}-{run8}`.
    pub fn new(dir: impl Into<PathBuf>, agent: &str, run_id: &Uuid, at: DateTime<Local>) -> Self {
        let run8: String = run_id.simple().to_string().chars().take(8).collect();
        Self {
            dir: dir.into(),
            stem: format!("{}-{}-{}", agent, at.format("%Y%m%d-%H%M%S"), run8),
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    pub fn trajectory_path(&self) -> PathBuf {
        self.dir.join(format!("{}.trajectory.log", self.stem))
    }

    /// Writes the combined raw output.
    pub fn write_output(&self, text: &str) -> Result<PathBuf, ArtifactError> {
        let path = self.output_path();
        write_file(&path, text)?;
        Ok(path)
    }

    /// Writes the formatted trajectory document.
    pub fn write_trajectory(&self, text: &str) -> Result<PathBuf, ArtifactError> {
        let path = self.trajectory_path();
        write_file(&path, text)?;
        Ok(path)
    }
}

fn write_file(path: &Path, text: &str) -> Result<(), ArtifactError> {
    let to_err = |source| ArtifactError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_err)?;
    }
    fs::write(path, text).map_err(to_err)?;
    debug!("Wrote {} ({} bytes)", path.display(), text.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_file_names() {
        let run_id = Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap();
        let at = Local.with_ymd_and_hms(2025, 3, 9, 14, 5, 7).unwrap();
        let writer = OutputWriter::new("/out", "codex", &run_id, at);
        assert_eq!(writer.stem(), "codex-20250309-140507-1a2b3c4d");
        assert_eq!(writer.output_path(), PathBuf::from("/out/codex-20250309-140507-1a2b3c4d.log"));
        assert_eq!(
            writer.trajectory_path(),
            PathBuf::from("/out/codex-20250309-140507-1a2b3c4d.trajectory.log")
        );
    }

    #[test]
    fn test_writes_create_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("nested").join("out");
        let writer = OutputWriter::new(&dir, "claude", &Uuid::new_v4(), Local::now());

        let out = writer.write_output("raw").unwrap();
        let traj = writer.write_trajectory("# cakit trajectory\n").unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "raw");
        assert!(fs::read_to_string(traj).unwrap().starts_with("# cakit trajectory"));
    }

    #[test]
    fn test_distinct_runs_do_not_collide() {
        let at = Local::now();
        let a = OutputWriter::new("/out", "gemini", &Uuid::new_v4(), at);
        let b = OutputWriter::new("/out", "gemini", &Uuid::new_v4(), at);
        assert_ne!(a.output_path(), b.output_path());
    }
}
