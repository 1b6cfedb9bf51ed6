//! One pack job end to end.
//!
//! `run_job` owns the job directory and the job log for the whole run: it wipes the
//! directory, runs the pipeline on its own task and finalizes the log on every exit
//! path, including a panicking stage.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info};
use serde::Serialize;
use tokio::task::JoinError;

use crate::config::AutopackConfig;
use crate::error::{PackError, Result};
use crate::extract::{extract_fonts, extract_subtitles};
use crate::ffmpeg::{CommandBuilder, StdoutMode, Toolchain};
use crate::ffprobe::{probe_file, Chapter, ProbeResult};
use crate::joblog::JobLog;
use crate::manifest::JobManifest;
use crate::packager::package;
use crate::paths::JobPaths;
use crate::pipeline::transcode;
use crate::progress::{ItemProgress, ProgressSink, Stage};
use crate::resolution::{fallback_resolution, plan_ladder, Resolution};
use crate::selector::{self, AudioTrack, SubtitlePreferences};

/// Everything a stage needs, passed explicitly instead of living in globals
pub struct JobContext {
    pub id: String,
    pub input: PathBuf,
    pub paths: JobPaths,
    pub config: AutopackConfig,
    pub tools: Toolchain,
    pub log: JobLog,
    pub progress: Option<ProgressSink>,
}

impl JobContext {
    pub fn new(
        id: impl Into<String>,
        input: PathBuf,
        paths: JobPaths,
        config: AutopackConfig,
        log: JobLog,
        progress: Option<ProgressSink>,
    ) -> Self {
        Self {
            id: id.into(),
            tools: Toolchain::from_config(&config),
            input,
            paths,
            config,
            log,
            progress,
        }
    }

    pub fn commands(&self) -> CommandBuilder<'_> {
        CommandBuilder::new(&self.input, &self.config.encoders)
    }
}

/// Stream choices and the rendition ladder, settled before anything is extracted or encoded
#[derive(Debug, Clone, Serialize)]
pub struct JobPlan {
    pub input: PathBuf,
    /// Probed container duration, seconds
    pub duration: f64,
    pub chapters: Vec<Chapter>,
    pub video_index: u32,
    pub ladder: Vec<Resolution>,
    pub fallback: Resolution,
    pub default_audio_index: u32,
    /// One track per language, default first
    pub audio: Vec<AudioTrack>,
    /// Stream index of the burned-in / default subtitle
    pub default_subtitle: Option<u32>,
    /// Position of that subtitle among all subtitle streams
    pub subtitle_relative_index: Option<usize>,
    /// Advanced subtitle streams to extract
    pub subtitles: Vec<u32>,
    /// Font attachments to extract
    pub fonts: Vec<u32>,
}

fn subtitle_preferences(config: &AutopackConfig) -> SubtitlePreferences {
    SubtitlePreferences {
        language: config.subtitle_language.clone(),
        allow_undefined_language: config.allow_undefined_subtitle_language,
        exclude_signs_and_songs: config.exclude_signs_and_songs,
    }
}

/// Decoded text size of a subtitle stream, in bytes of SRT
async fn subtitle_text_size(tools: &Toolchain, args: Vec<String>, index: u32, log: &JobLog) -> Result<u64> {
    let output = tools
        .run(&tools.ffmpeg_bin, &args, StdoutMode::Count, log, |_| {})
        .await
        .map_err(|e| PackError::SubtitleLengthProbeFailure {
            index,
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(PackError::SubtitleLengthProbeFailure {
            index,
            message: format!("ffmpeg exited with {}", output.status),
        });
    }
    Ok(output.stdout_bytes)
}

/// Run every selection heuristic and plan the ladder
pub async fn build_plan(
    tools: &Toolchain,
    config: &AutopackConfig,
    input: &Path,
    probe: &ProbeResult,
    log: &JobLog,
) -> Result<JobPlan> {
    let streams = &probe.streams;

    let video = selector::video_stream(streams)?;
    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(PackError::ProbeFailure(format!(
                "video stream #{} has no dimensions",
                video.index
            )))
        }
    };

    let audio = selector::audio_stream(streams, &config.audio_language)?;
    let unique_audio = selector::unique_language_audio(streams, audio);
    let audio_tracks = selector::audio_tracks(&unique_audio, audio);

    let builder = CommandBuilder::new(input, &config.encoders);
    let subtitle = {
        let _region = log.region("Subtitle length probe");
        selector::subtitle_stream(streams, &subtitle_preferences(config), |index| {
            let args = builder.subtitle_length(index);
            subtitle_text_size(tools, args, index, log)
        })
        .await
    };

    let ladder = plan_ladder(width, height);
    let fallback = fallback_resolution(&ladder, &config.fallback_resolution)
        .cloned()
        .ok_or_else(|| PackError::ProbeFailure("empty resolution ladder".to_string()))?;

    Ok(JobPlan {
        input: input.to_path_buf(),
        duration: probe.duration,
        chapters: probe.chapters.clone(),
        video_index: video.index,
        fallback,
        ladder,
        default_audio_index: audio.index,
        audio: audio_tracks,
        default_subtitle: subtitle.map(|s| s.index),
        subtitle_relative_index: subtitle.and_then(|s| selector::subtitle_relative_index(streams, s)),
        subtitles: selector::advanced_subtitles(streams).iter().map(|s| s.index).collect(),
        fonts: selector::supported_fonts(streams).iter().map(|s| s.index).collect(),
    })
}

async fn ensure_input(input: &Path) -> Result<()> {
    match tokio::fs::metadata(input).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(PackError::InputNotFound(input.to_path_buf())),
    }
}

/// Probe and select without touching any job directory
pub async fn plan(config: &AutopackConfig, input: &Path) -> Result<JobPlan> {
    ensure_input(input).await?;
    let tools = Toolchain::from_config(config);
    let log = JobLog::detached();
    let probe = probe_file(&tools, input, &log).await?;
    build_plan(&tools, config, input, &probe, &log).await
}

async fn run_pipeline(ctx: &JobContext) -> Result<JobManifest> {
    let mut bar = ItemProgress::new(ctx.progress.as_ref(), Stage::Metadata, "probe", 1.0);
    let probe = probe_file(&ctx.tools, &ctx.input, &ctx.log).await?;
    let plan = build_plan(&ctx.tools, &ctx.config, &ctx.input, &probe, &ctx.log).await?;
    bar.finish();

    info!(
        "Job {}: {:.1}s, ladder [{}], {} audio track(s), default subtitle {:?}",
        ctx.id,
        plan.duration,
        plan.ladder.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(", "),
        plan.audio.len(),
        plan.default_subtitle
    );
    ctx.log.append(&format!("plan: {}\n", serde_json::to_string(&plan)?));

    let by_index = |indices: &[u32]| {
        indices
            .iter()
            .filter_map(|i| probe.streams.iter().find(|s| s.index == *i))
            .collect::<Vec<_>>()
    };
    let selected_subtitle = plan
        .default_subtitle
        .and_then(|i| probe.streams.iter().find(|s| s.index == i));

    let commands = ctx.commands();
    let subtitles = {
        let _region = ctx.log.region("Extracting subtitles");
        extract_subtitles(
            &ctx.tools,
            &commands,
            &by_index(&plan.subtitles),
            selected_subtitle,
            &ctx.paths.out,
            &ctx.log,
            ctx.progress.as_ref(),
        )
        .await?
    };

    let font_map = {
        let _region = ctx.log.region("Extracting fonts");
        extract_fonts(
            &ctx.tools,
            &commands,
            &by_index(&plan.fonts),
            &ctx.paths.fonts,
            &ctx.log,
            ctx.progress.as_ref(),
        )
        .await?
    };
    info!(
        "Job {}: extracted {} subtitle(s) and {} font(s)",
        ctx.id,
        subtitles.len(),
        font_map.len()
    );

    let renditions = transcode(ctx, &plan).await?;
    package(ctx, &renditions.videos, &renditions.audio).await?;

    let manifest = JobManifest::assemble(
        &ctx.id,
        &plan.chapters,
        subtitles,
        font_map,
        &renditions.audio,
        &renditions.videos,
    );
    ctx.log.append("Writing weebify manifest\n");
    let path = manifest.write_to(&ctx.paths.out).await?;
    debug!("Job {}: manifest written to {}", ctx.id, path.display());

    Ok(manifest)
}

fn abort_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return "pipeline task was cancelled".to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "pipeline task panicked".to_string())
}

/// Run one job from a clean directory to a written manifest.
///
/// The job directory `<work_dir>/<job_id>` is wiped first. Whatever happens, the job
/// log is closed with the outcome; on failure no manifest exists.
pub async fn run_job(
    config: AutopackConfig,
    input: PathBuf,
    job_id: String,
    progress: Option<ProgressSink>,
) -> Result<JobManifest> {
    ensure_input(&input).await?;

    let paths = JobPaths::new(&config.work_dir, &job_id);
    paths.prepare().await?;
    let log = JobLog::create(&paths.base)?;

    info!("Job {}: 🚀 packing {} in {}", job_id, input.display(), paths.base.display());

    let ctx = Arc::new(JobContext::new(job_id, input, paths, config, log, progress));
    run_guarded(ctx, |ctx| async move { run_pipeline(&ctx).await }).await
}

/// Run `pipeline` on its own task and close the job log with the outcome.
///
/// A panic or cancellation of that task becomes `PackError::Aborted`.
async fn run_guarded<T, F, Fut>(ctx: Arc<JobContext>, pipeline: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<JobContext>) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let result = match tokio::spawn(pipeline(Arc::clone(&ctx))).await {
        Ok(result) => result,
        Err(e) => Err(PackError::Aborted(abort_reason(e))),
    };

    match &result {
        Ok(_) => {
            ctx.log.close("Done!");
            info!("Job {}: ✅ complete, output in {}", ctx.id, ctx.paths.out.display());
        }
        Err(e) => {
            ctx.log.close_with_error(&e.to_string());
            error!("Job {}: ❌ failed: {}", ctx.id, e);
            if let Some(path) = ctx.log.path() {
                error!("Job {}: see {} for tool output", ctx.id, path.display());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffprobe::parse_probe_output;

    #[tokio::test]
    async fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AutopackConfig::default_config();
        config.work_dir = dir.path().join("work");

        let err = run_job(config, dir.path().join("nope.mkv"), "j".to_string(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::InputNotFound(_)));
        // nothing is wiped or created for a job that cannot start
        assert!(!dir.path().join("work").exists());
    }

    #[tokio::test]
    async fn test_plan_without_subtitles_never_probes_lengths() {
        let json = r#"{
            "format": {"duration": "1420.5"},
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
                {"index": 1, "codec_type": "audio", "codec_name": "flac", "tags": {"language": "jpn"}},
                {"index": 2, "codec_type": "audio", "codec_name": "aac", "tags": {"language": "eng"}},
                {"index": 3, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "eng"}}
            ],
            "chapters": []
        }"#;
        let probe = parse_probe_output(json).unwrap();
        let config = AutopackConfig::default_config();
        let tools = Toolchain {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe"),
            packager_bin: PathBuf::from("/nonexistent/packager"),
        };

        let plan = build_plan(&tools, &config, Path::new("/src.mkv"), &probe, &JobLog::detached())
            .await
            .unwrap();
        assert_eq!(plan.ladder.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["native", "720p"]);
        assert_eq!(plan.fallback.name, "720p");
        assert_eq!(plan.default_audio_index, 1);
        assert_eq!(plan.audio.len(), 2);
        assert_eq!(plan.default_subtitle, None);
        assert!(plan.subtitles.is_empty());
    }

    #[tokio::test]
    async fn test_video_without_dimensions_is_probe_failure() {
        let json = r#"{
            "format": {"duration": "10"},
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264"},
                {"index": 1, "codec_type": "audio", "codec_name": "aac"}
            ]
        }"#;
        let probe = parse_probe_output(json).unwrap();
        let config = AutopackConfig::default_config();
        let tools = Toolchain::from_config(&config);
        let err = build_plan(&tools, &config, Path::new("/src.mkv"), &probe, &JobLog::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, PackError::ProbeFailure(_)));
    }

    #[tokio::test]
    async fn test_failed_length_probe_degrades_to_no_subtitle() {
        let json = r#"{
            "format": {"duration": "10"},
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 640, "height": 480},
                {"index": 1, "codec_type": "audio", "codec_name": "aac"},
                {"index": 2, "codec_type": "subtitle", "codec_name": "ass", "tags": {"language": "eng", "title": "A"}},
                {"index": 3, "codec_type": "subtitle", "codec_name": "ass", "tags": {"language": "eng", "title": "B"}}
            ]
        }"#;
        let probe = parse_probe_output(json).unwrap();
        let config = AutopackConfig::default_config();
        let tools = Toolchain {
            ffmpeg_bin: PathBuf::from("/nonexistent/ffmpeg"),
            ffprobe_bin: PathBuf::from("/nonexistent/ffprobe"),
            packager_bin: PathBuf::from("/nonexistent/packager"),
        };

        let plan = build_plan(&tools, &config, Path::new("/src.mkv"), &probe, &JobLog::detached())
            .await
            .unwrap();
        assert_eq!(plan.default_subtitle, None);
        assert_eq!(plan.subtitle_relative_index, None);
        assert_eq!(plan.subtitles, vec![2, 3]);
        // 640x480 is narrower than 16:9, no tier is below 480 in height
        assert_eq!(plan.ladder.len(), 1);
        assert_eq!(plan.fallback.name, "native");
    }

    #[tokio::test]
    async fn test_panicking_stage_aborts_and_closes_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutopackConfig::default_config();
        let paths = JobPaths::new(dir.path(), "j");
        paths.prepare().await.unwrap();
        let log = JobLog::create(&paths.base).unwrap();
        let log_path = paths.base.join(crate::joblog::LOG_FILE_NAME);
        let out = paths.out.clone();
        let ctx = Arc::new(JobContext::new("j", dir.path().join("src.mkv"), paths, config, log, None));

        let err = run_guarded(Arc::clone(&ctx), |_ctx| async move {
            if true {
                panic!("font table corrupt");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PackError::Aborted(ref m) if m == "font table corrupt"), "{}", err);

        drop(ctx);
        assert!(!out.join(crate::manifest::MANIFEST_FILE_NAME).exists());
        let text = std::fs::read_to_string(log_path).unwrap();
        assert!(text.contains("!BEGIN Global Error!"));
        assert!(text.ends_with("!!! LOG END, REASON: job aborted: font table corrupt !!!\n"));
    }

    #[test]
    fn test_context_derives_toolchain_from_config() {
        let mut config = AutopackConfig::default_config();
        config.packager_bin = PathBuf::from("/opt/shaka/packager");
        let paths = JobPaths::new(Path::new("/w"), "j");
        let ctx = JobContext::new("j", PathBuf::from("/src.mkv"), paths, config, JobLog::detached(), None);
        assert_eq!(ctx.tools.packager_bin, PathBuf::from("/opt/shaka/packager"));
    }
}
