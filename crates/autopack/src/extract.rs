use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};
use crate::ffmpeg::{CommandBuilder, StdoutMode, Toolchain};
use crate::ffprobe::Stream;
use crate::joblog::JobLog;
use crate::progress::{ItemProgress, ProgressSink, Stage};
use crate::selector::UNKNOWN_LANGUAGE;

/// Extracted subtitle file as listed in the job manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleAsset {
    pub name: String,
    pub lang: String,
    pub default: bool,
    pub file: String,
}

/// Original attachment filename -> `fonts/<md5>-<filename>`
pub type FontMap = BTreeMap<String, String>;

/// Make a display name safe to use as a file name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_whitespace() || c == '-' {
            pending_dash = true;
            continue;
        }
        if c != '&' && !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~')) {
            continue;
        }

        if pending_dash && !slug.is_empty() {
            slug.push('-');
        }
        pending_dash = false;
        if c == '&' {
            slug.push_str("and");
        } else {
            slug.push(c);
        }
    }

    slug
}

/// Display name for a subtitle stream: its title or a generated placeholder
pub fn subtitle_display_name(stream: &Stream) -> String {
    match stream.title() {
        Some(title) => title.to_string(),
        None => format!(
            "Subtitles #{} ({})",
            stream.index,
            stream.language().unwrap_or(UNKNOWN_LANGUAGE)
        ),
    }
}

/// Output file name for a subtitle, unique within the job
fn subtitle_file_name(stream: &Stream, display_name: &str, used: &mut HashSet<String>) -> String {
    let mut base = slugify(display_name);
    if base.is_empty() {
        base = format!("subtitles-{}", stream.index);
    }

    let mut slug = base.clone();
    let mut n = 1;
    while used.contains(&slug) {
        slug = if n == 1 {
            format!("{}-{}", base, stream.index)
        } else {
            format!("{}-{}-{}", base, stream.index, n)
        };
        n += 1;
    }
    used.insert(slug.clone());
    format!("{}.ass", slug)
}

/// True when `path` is a file holding at least one byte
pub(crate) async fn artifact_present(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(_) => false,
    }
}

/// MD5 of the whole file, lowercase hex
pub async fn content_hash(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await.map_err(|source| PackError::HashFailure {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(format!("{:x}", md5::compute(&bytes)))
}

/// Rename a dumped file in `dir` to `<md5>-<file_name>` and return the new name.
///
/// Identical bytes under the same name always land on the same file, so running this
/// twice for the same content is a no-op overwrite.
pub async fn store_hashed(dir: &Path, file_name: &str) -> Result<String> {
    let dumped = dir.join(file_name);
    let hash = content_hash(&dumped).await?;
    let new_name = format!("{}-{}", hash, file_name);
    tokio::fs::rename(&dumped, dir.join(&new_name)).await?;
    Ok(new_name)
}

/// Copy every advanced subtitle stream out of the source into `out_dir`
pub async fn extract_subtitles(
    tools: &Toolchain,
    builder: &CommandBuilder<'_>,
    streams: &[&Stream],
    selected: Option<&Stream>,
    out_dir: &Path,
    log: &JobLog,
    progress: Option<&ProgressSink>,
) -> Result<Vec<SubtitleAsset>> {
    let mut assets = Vec::with_capacity(streams.len());
    let mut used = HashSet::new();
    let mut bar = ItemProgress::new(progress, Stage::Subtitles, "subtitles", streams.len() as f64);

    for (done, stream) in streams.iter().enumerate() {
        let name = subtitle_display_name(stream);
        let file = subtitle_file_name(stream, &name, &mut used);
        let out_path = out_dir.join(&file);

        let _region = log.region(&format!("Extract stream {}", stream.index));
        let args = builder.extract_stream(stream.index, "ass", &out_path);
        let output = tools
            .run(&tools.ffmpeg_bin, &args, StdoutMode::Discard, log, |_| {})
            .await
            .map_err(|e| PackError::ExtractionFailure {
                index: stream.index,
                message: format!("failed to execute ffmpeg: {}", e),
            })?;

        if !output.status.success() {
            return Err(PackError::ExtractionFailure {
                index: stream.index,
                message: format!("ffmpeg exited with {}", output.status),
            });
        }
        if !artifact_present(&out_path).await {
            return Err(PackError::ExtractionFailure {
                index: stream.index,
                message: format!("{} was not written", out_path.display()),
            });
        }

        info!("Extracted subtitle #{} \"{}\" -> {}", stream.index, name, file);
        assets.push(SubtitleAsset {
            name,
            lang: stream.language().unwrap_or(UNKNOWN_LANGUAGE).to_string(),
            default: selected.map(|s| s.index == stream.index).unwrap_or(false),
            file,
        });
        bar.report((done + 1) as f64);
    }

    bar.finish();
    Ok(assets)
}

/// Dump every font attachment into `font_dir` under a content-hashed name.
///
/// The exit status of `-dump_attachment` runs is ignored; only the dumped file counts.
pub async fn extract_fonts(
    tools: &Toolchain,
    builder: &CommandBuilder<'_>,
    fonts: &[&Stream],
    font_dir: &Path,
    log: &JobLog,
    progress: Option<&ProgressSink>,
) -> Result<FontMap> {
    let mut font_map = FontMap::new();
    let mut bar = ItemProgress::new(progress, Stage::Fonts, "fonts", fonts.len() as f64);

    for (done, font) in fonts.iter().enumerate() {
        let original = font
            .filename()
            .ok_or(PackError::MissingAttachmentFilename { index: font.index })?;

        // never let an embedded name escape the font directory
        let file_name = Path::new(original)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or(PackError::MissingAttachmentFilename { index: font.index })?
            .to_string();
        let dump_path: PathBuf = font_dir.join(&file_name);

        let _region = log.region(&format!("Dump attachment {}", font.index));
        let args = builder.dump_attachment(font.index, &dump_path);
        let output = tools
            .run(&tools.ffmpeg_bin, &args, StdoutMode::Discard, log, |_| {})
            .await
            .map_err(|e| PackError::ExtractionFailure {
                index: font.index,
                message: format!("failed to execute ffmpeg: {}", e),
            })?;
        if !output.status.success() {
            log.append(&format!("ignoring exit status {} of attachment dump\n", output.status));
        }

        if !artifact_present(&dump_path).await {
            return Err(PackError::ExtractionFailure {
                index: font.index,
                message: format!("{} was not written", dump_path.display()),
            });
        }

        let stored = store_hashed(font_dir, &file_name).await?;
        let value = format!("fonts/{}", stored);
        if let Some(previous) = font_map.insert(original.to_string(), value.clone()) {
            if previous != value {
                warn!("Font {:?} embedded twice with different content, keeping {}", original, value);
            }
        }
        info!("Extracted font #{} {:?} -> {}", font.index, original, value);
        bar.report((done + 1) as f64);
    }

    bar.finish();
    Ok(font_map)
}
