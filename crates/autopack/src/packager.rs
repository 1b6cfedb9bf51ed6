use std::path::{Path, PathBuf};

use log::info;

use crate::error::{PackError, Result};
use crate::extract::artifact_present;
use crate::ffmpeg::StdoutMode;
use crate::job::JobContext;
use crate::pipeline::{file_name, AudioRendition, VideoRendition};
use crate::progress::{ItemProgress, Stage};

pub const MPD_FILE_NAME: &str = "manifest.mpd";

/// Packager stream descriptors plus the MPD output flag, in invocation order.
///
/// Each rendition keeps its encoded file name inside `out_dir`.
pub fn build_args(videos: &[VideoRendition], audio: &[AudioRendition], out_dir: &Path) -> Vec<String> {
    let mut args = Vec::with_capacity(videos.len() + audio.len() + 2);

    for video in videos {
        args.push(format!(
            "in={},stream=video,output={}",
            video.path.display(),
            out_dir.join(file_name(&video.path)).display()
        ));
    }

    for track in audio {
        args.push(format!(
            "in={},stream=audio,lang={}{},output={}",
            track.path.display(),
            track.lang,
            if track.is_default { ",roles=main" } else { "" },
            out_dir.join(file_name(&track.path)).display()
        ));
    }

    args.push("--mpd_output".to_string());
    args.push(out_dir.join(MPD_FILE_NAME).to_string_lossy().into_owned());
    args
}

/// Mux every rendition into `out/` and emit the DASH manifest; returns its path
pub async fn package(ctx: &JobContext, videos: &[VideoRendition], audio: &[AudioRendition]) -> Result<PathBuf> {
    let mut bar = ItemProgress::new(ctx.progress.as_ref(), Stage::Packaging, MPD_FILE_NAME, 1.0);
    let _region = ctx.log.region("Packager output");
    info!("Job {}: 📦 Packaging {} video and {} audio renditions", ctx.id, videos.len(), audio.len());

    let args = build_args(videos, audio, &ctx.paths.out);
    let output = ctx
        .tools
        .run(&ctx.tools.packager_bin, &args, StdoutMode::Discard, &ctx.log, |_| {})
        .await
        .map_err(|e| PackError::PackagingFailure(format!("failed to execute packager: {}", e)))?;

    if !output.status.success() {
        return Err(PackError::PackagingFailure(format!("packager exited with {}", output.status)));
    }

    let mpd = ctx.paths.out.join(MPD_FILE_NAME);
    let mut expected = vec![mpd.clone()];
    expected.extend(videos.iter().map(|v| ctx.paths.out.join(file_name(&v.path))));
    expected.extend(audio.iter().map(|a| ctx.paths.out.join(file_name(&a.path))));
    for path in &expected {
        if !artifact_present(path).await {
            return Err(PackError::PackagingFailure(format!(
                "{} missing or empty after packaging",
                path.display()
            )));
        }
    }

    bar.finish();
    Ok(mpd)
}
