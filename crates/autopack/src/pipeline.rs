//! Transcode pipeline: the fallback encode, then every video rendition, then every
//! audio rendition, one ffmpeg process at a time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::{PackError, Result};
use crate::extract::artifact_present;
use crate::ffmpeg::StdoutMode;
use crate::job::{JobContext, JobPlan};
use crate::progress::{ItemProgress, Stage};
use crate::resolution::Resolution;
use crate::selector::AudioTrack;

pub const FALLBACK_FILE_NAME: &str = "fallback.mp4";

#[derive(Debug, Clone, PartialEq)]
pub struct VideoRendition {
    pub resolution: Resolution,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioRendition {
    pub lang: String,
    pub is_default: bool,
    pub path: PathBuf,
}

/// Everything the encoders produced
#[derive(Debug, Clone)]
pub struct Renditions {
    pub fallback: PathBuf,
    pub videos: Vec<VideoRendition>,
    pub audio: Vec<AudioRendition>,
}

pub fn video_file_name(resolution: &Resolution) -> String {
    format!("v{}.webm", resolution.name)
}

pub fn audio_file_name(lang: &str) -> String {
    format!("a{}.webm", lang)
}

/// Audio rendition file name, suffixed with the stream index when two tracks share a label
fn unique_audio_file_name(track: &AudioTrack, used: &mut HashSet<String>) -> String {
    let mut name = audio_file_name(&track.lang);
    if used.contains(&name) {
        name = format!("a{}-{}.webm", track.lang, track.index);
    }
    used.insert(name.clone());
    name
}

/// Basename of a rendition path, as referenced from manifests
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Run one encode to completion, feeding its stats lines to a progress reporter.
///
/// A non-zero exit or a missing/empty output are both `EncodeFailure`.
async fn encode(ctx: &JobContext, stage: Stage, item: &str, args: &[String], output: &Path, total: f64) -> Result<()> {
    let mut bar = ItemProgress::new(ctx.progress.as_ref(), stage, item, total);
    let _region = ctx.log.region(&format!("Encode {}", item));

    let result = ctx
        .tools
        .run(&ctx.tools.ffmpeg_bin, args, StdoutMode::Discard, &ctx.log, |line| {
            bar.observe_line(line)
        })
        .await
        .map_err(|e| PackError::EncodeFailure {
            item: item.to_string(),
            message: format!("failed to execute ffmpeg: {}", e),
        })?;

    if !result.status.success() {
        return Err(PackError::EncodeFailure {
            item: item.to_string(),
            message: format!("ffmpeg exited with {}", result.status),
        });
    }
    if !artifact_present(output).await {
        return Err(PackError::EncodeFailure {
            item: item.to_string(),
            message: format!("{} missing or empty after encode", output.display()),
        });
    }

    bar.finish();
    Ok(())
}

/// Single-file H.264 fallback with the default subtitle burned in
pub async fn encode_fallback(ctx: &JobContext, plan: &JobPlan) -> Result<PathBuf> {
    let output = ctx.paths.out.join(FALLBACK_FILE_NAME);
    info!(
        "Job {}: 🎞️  Encoding fallback at {} ({}x{})",
        ctx.id, plan.fallback.name, plan.fallback.w, plan.fallback.h
    );

    let args = ctx.commands().fallback_encode(
        plan.video_index,
        plan.default_audio_index,
        plan.subtitle_relative_index,
        &plan.fallback,
        &output,
    );
    encode(ctx, Stage::FallbackEncode, "V0", &args, &output, plan.duration).await?;
    Ok(output)
}

pub async fn encode_videos(ctx: &JobContext, plan: &JobPlan) -> Result<Vec<VideoRendition>> {
    let _region = ctx.log.region("Encoding videos");
    let mut videos = Vec::with_capacity(plan.ladder.len());

    for resolution in &plan.ladder {
        let output = ctx.paths.base.join(video_file_name(resolution));
        info!(
            "Job {}: Encoding video rendition {} ({}x{})",
            ctx.id, resolution.name, resolution.w, resolution.h
        );
        let args = ctx.commands().video_rendition(plan.video_index, resolution, &output);
        encode(ctx, Stage::VideoEncode, &resolution.name, &args, &output, plan.duration).await?;

        videos.push(VideoRendition {
            resolution: resolution.clone(),
            path: output,
        });
    }

    Ok(videos)
}

pub async fn encode_audio(ctx: &JobContext, plan: &JobPlan) -> Result<Vec<AudioRendition>> {
    let _region = ctx.log.region("Encoding audio");
    let mut audio = Vec::with_capacity(plan.audio.len());
    let mut used = HashSet::new();

    for track in &plan.audio {
        let output = ctx.paths.base.join(unique_audio_file_name(track, &mut used));
        info!(
            "Job {}: Encoding audio rendition {} from stream #{}{}",
            ctx.id,
            track.lang,
            track.index,
            if track.is_default { " (default)" } else { "" }
        );
        let args = ctx.commands().audio_rendition(track.index, &output);
        encode(ctx, Stage::AudioEncode, &track.lang, &args, &output, plan.duration).await?;

        audio.push(AudioRendition {
            lang: track.lang.clone(),
            is_default: track.is_default,
            path: output,
        });
    }

    Ok(audio)
}

/// Run every encode of the job in order; the first failure aborts the rest
pub async fn transcode(ctx: &JobContext, plan: &JobPlan) -> Result<Renditions> {
    let fallback = encode_fallback(ctx, plan).await?;
    let videos = encode_videos(ctx, plan).await?;
    let audio = encode_audio(ctx, plan).await?;

    info!(
        "Job {}: ✅ Encoded fallback, {} video and {} audio renditions",
        ctx.id,
        videos.len(),
        audio.len()
    );
    Ok(Renditions { fallback, videos, audio })
}
