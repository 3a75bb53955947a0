//! Media attachments: argument parsing, validation and prompt injection.
//!
//! Agents take media in one of three ways: a native flag, staged files
//! referenced as `@{path}` in the prompt, or a natural-language preamble
//! that names the files and the tool the agent should open them with.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::env::EnvSnapshot;
use crate::error::UsageError;

/// Directory under the working directory receiving staged copies.
pub const STAGE_DIR: &str = ".cakit-media";

/// Validated media inputs of one run, as absolute paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSet {
    pub images: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
}

impl MediaSet {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }

    /// Images followed by videos.
    pub fn all(&self) -> Vec<PathBuf> {
        self.images.iter().chain(self.videos.iter()).cloned().collect()
    }

    /// Rejects modalities the agent cannot take.
    pub fn check_supported(
        &self,
        images_supported: bool,
        videos_supported: bool,
        display_name: &str,
    ) -> Result<(), UsageError> {
        let bad_images = !self.images.is_empty() && !images_supported;
        let bad_videos = !self.videos.is_empty() && !videos_supported;
        let subject = match (bad_images, bad_videos) {
            (true, true) => "image and video",
            (true, false) => "image",
            (false, true) => "video",
            (false, false) => return Ok(()),
        };
        Err(UsageError::UnsupportedMedia {
            subject: format!("{} input", subject),
            display_name: display_name.to_string(),
        })
    }
}

/// Splits repeatable `--image` values on commas.
///
/// A value containing a comma is kept whole when that exact path exists.
pub fn split_image_args(values: &[String], snapshot: &EnvSnapshot) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.contains(',') && !snapshot.expand(trimmed).exists() {
            out.extend(
                trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string),
            );
        } else {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Expands `~`, makes the path absolute and checks it exists.
pub fn resolve_media_path(value: &str, snapshot: &EnvSnapshot) -> Result<PathBuf, UsageError> {
    let expanded = snapshot.expand(value.trim());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    };
    if absolute.is_file() {
        Ok(absolute)
    } else {
        Err(UsageError::MediaNotFound(absolute))
    }
}

/// Builds a [`MediaSet`] from raw CLI values.
pub fn resolve_media(images: &[String], videos: &[String], snapshot: &EnvSnapshot) -> Result<MediaSet, UsageError> {
    let images = split_image_args(images, snapshot)
        .iter()
        .map(|value| resolve_media_path(value, snapshot))
        .collect::<Result<Vec<_>, _>>()?;
    let videos = videos
        .iter()
        .filter(|value| !value.trim().is_empty())
        .map(|value| resolve_media_path(value, snapshot))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(MediaSet { images, videos })
}

fn safe_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "media".to_string());
    stem.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Copies media into `<workdir>/.cakit-media/` and returns the staged paths.
pub fn stage_media(workdir: &Path, media: &[PathBuf]) -> io::Result<Vec<PathBuf>> {
    let stage_dir = workdir.join(STAGE_DIR);
    fs::create_dir_all(&stage_dir)?;
    let mut staged = Vec::with_capacity(media.len());
    for (index, src) in media.iter().enumerate() {
        let ext = src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let target = stage_dir.join(format!("{:02}-{}{}", index, safe_stem(src), ext));
        if src != &target {
            fs::copy(src, &target)?;
        }
        debug!("Staged {} as {}", src.display(), target.display());
        staged.push(target);
    }
    Ok(staged)
}

/// `@{relpath}` references, a blank line, then the prompt.
pub fn symbolic_prompt(prompt: &str, workdir: &Path, staged: &[PathBuf]) -> String {
    if staged.is_empty() {
        return prompt.to_string();
    }
    let mut lines: Vec<String> = staged
        .iter()
        .map(|path| {
            let rel = path.strip_prefix(workdir).unwrap_or(path);
            format!("@{{{}}}", rel.display())
        })
        .collect();
    lines.push(String::new());
    lines.push(prompt.to_string());
    lines.join("\n")
}

/// MIME type of an image, from its extension.
pub fn image_media_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

/// Natural-language preamble naming the files and the tool to open them with.
pub fn natural_prompt(prompt: &str, tool_name: &str, media: &MediaSet) -> String {
    if media.is_empty() {
        return prompt.to_string();
    }
    let mut lines = vec![
        "You are provided with these local media files.".to_string(),
        format!("Use the {} tool to open each file before answering.", tool_name),
    ];
    for (title, paths) in [("Images:", &media.images), ("Videos:", &media.videos)] {
        if paths.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(title.to_string());
        lines.extend(paths.iter().map(|p| format!("- {}", p.display())));
    }
    lines.push(String::new());
    lines.push("User request:".to_string());
    lines.push(prompt.to_string());
    lines.join("\n")
}
