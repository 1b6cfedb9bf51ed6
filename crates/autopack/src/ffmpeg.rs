use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::{anyhow, Context};
use log::{debug, info};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::{AutopackConfig, EncoderSettings};
use crate::joblog::JobLog;
use crate::progress::drain_lines;
use crate::resolution::{Resolution, NATIVE};

/// ffmpeg log level 24 = warnings and errors only
const LOGLEVEL: &str = "24";

/// What to do with a tool's stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    Discard,
    Capture,
    /// Only count bytes (decoded subtitle size probing)
    Count,
}

/// Result of an external tool run
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stdout_bytes: u64,
}

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// Parse version from the first line of `ffmpeg -version`
    /// Example: "ffmpeg version 6.1.1-3ubuntu5" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> anyhow::Result<Self> {
        let mut words = version_str.split_whitespace();
        let version_part = words
            .by_ref()
            .find(|w| *w == "version")
            .and_then(|_| words.next())
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // distro builds prefix an "n" ("n6.1") and suffix a build tag ("6.1.1-3ubuntu5")
        let version_part = version_part.trim_start_matches(|c: char| !c.is_ascii_digit());
        let version_part = version_part.split(|c: char| c == '-' || c == '+').next().unwrap_or("");

        let mut parts = version_part.split('.');
        let mut next_number = |what: &str| -> anyhow::Result<u32> {
            match parts.next() {
                Some(p) => p
                    .parse::<u32>()
                    .with_context(|| format!("Failed to parse {} version from: {}", what, p)),
                None => Ok(0),
            }
        };

        let major = next_number("major")?;
        let minor = next_number("minor")?;
        let patch = next_number("patch")?;

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Outcome of `Toolchain::check`
#[derive(Debug, Clone)]
pub struct ToolchainReport {
    pub ffmpeg_version: FFmpegVersion,
    pub missing_encoders: Vec<String>,
}

/// Paths to the external tools the pipeline drives
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub packager_bin: PathBuf,
}

impl Toolchain {
    pub fn from_config(cfg: &AutopackConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            packager_bin: cfg.packager_bin.clone(),
        }
    }

    /// Run a tool to completion.
    ///
    /// The command line and all of stderr go to the job log; every stderr line (split on
    /// `\r` as well as `\n`) is handed to `on_line` as it arrives. The exit status is
    /// returned, not judged: callers decide what a non-zero exit means.
    pub async fn run<F>(
        &self,
        bin: &Path,
        args: &[String],
        stdout_mode: StdoutMode,
        log: &JobLog,
        mut on_line: F,
    ) -> std::io::Result<ToolOutput>
    where
        F: FnMut(&str),
    {
        let cmd_str = format!("{} {}", bin.display(), args.join(" "));
        debug!("Executing: {}", cmd_str);
        log.append(&format!("command: \n{}\n", cmd_str));

        let mut cmd = Command::new(bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.stdout(match stdout_mode {
            StdoutMode::Discard => Stdio::null(),
            StdoutMode::Capture | StdoutMode::Count => Stdio::piped(),
        });

        let mut child = cmd.spawn()?;
        let stderr = child.stderr.take();
        let stdout = child.stdout.take();

        let read_stderr = async {
            if let Some(mut stderr) = stderr {
                let mut pending = Vec::new();
                let mut chunk = vec![0u8; 8192];
                loop {
                    let n = stderr.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    log.append(&String::from_utf8_lossy(&chunk[..n]));
                    pending.extend_from_slice(&chunk[..n]);
                    for line in drain_lines(&mut pending) {
                        on_line(&line);
                    }
                }
                if !pending.is_empty() {
                    on_line(&String::from_utf8_lossy(&pending));
                }
            }
            Ok::<(), std::io::Error>(())
        };

        let read_stdout = async {
            let mut captured = Vec::new();
            let mut count = 0u64;
            if let Some(mut stdout) = stdout {
                match stdout_mode {
                    StdoutMode::Capture => {
                        stdout.read_to_end(&mut captured).await?;
                        count = captured.len() as u64;
                    }
                    StdoutMode::Count => {
                        let mut chunk = vec![0u8; 8192];
                        loop {
                            let n = stdout.read(&mut chunk).await?;
                            if n == 0 {
                                break;
                            }
                            count += n as u64;
                        }
                    }
                    StdoutMode::Discard => {}
                }
            }
            Ok::<(Vec<u8>, u64), std::io::Error>((captured, count))
        };

        let (stderr_result, stdout_result) = tokio::join!(read_stderr, read_stdout);
        stderr_result?;
        let (stdout, stdout_bytes) = stdout_result?;

        let status = child.wait().await?;
        debug!("{} exited with {}", bin.display(), status);
        log.append(&format!("exit status: {}\n", status));

        Ok(ToolOutput {
            status,
            stdout,
            stdout_bytes,
        })
    }

    /// Verify every tool starts and ffmpeg has the encoders the policies need
    pub async fn check(&self, encoders: &EncoderSettings) -> anyhow::Result<ToolchainReport> {
        let log = JobLog::detached();

        let version = self
            .run(&self.ffmpeg_bin, &["-version".to_string()], StdoutMode::Capture, &log, |_| {})
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", self.ffmpeg_bin.display()))?;
        if !version.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }
        let stdout = String::from_utf8_lossy(&version.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;
        let ffmpeg_version = FFmpegVersion::parse(first_line)?;

        let listing = self
            .run(
                &self.ffmpeg_bin,
                &["-hide_banner".to_string(), "-encoders".to_string()],
                StdoutMode::Capture,
                &log,
                |_| {},
            )
            .await
            .with_context(|| format!("Failed to query FFmpeg encoders at: {}", self.ffmpeg_bin.display()))?;
        if !listing.status.success() {
            return Err(anyhow!("FFmpeg encoder query failed"));
        }
        let required = [
            encoders.fallback_video_codec.as_str(),
            encoders.fallback_audio_codec.as_str(),
            encoders.video_codec.as_str(),
            encoders.audio_codec.as_str(),
        ];
        let missing_encoders = missing_encoders(&String::from_utf8_lossy(&listing.stdout), &required);

        for (bin, flag) in [(&self.ffprobe_bin, "-version"), (&self.packager_bin, "--version")] {
            let out = self
                .run(bin, &[flag.to_string()], StdoutMode::Discard, &log, |_| {})
                .await
                .with_context(|| format!("Failed to execute {}", bin.display()))?;
            if !out.status.success() {
                return Err(anyhow!("{} {} exited with {}", bin.display(), flag, out.status));
            }
        }

        info!(
            "🎬 FFmpeg {}.{}.{} found, missing encoders: {:?}",
            ffmpeg_version.major, ffmpeg_version.minor, ffmpeg_version.patch, missing_encoders
        );

        Ok(ToolchainReport {
            ffmpeg_version,
            missing_encoders,
        })
    }
}

/// Names from `required` that do not appear as an encoder in `ffmpeg -encoders` output
pub fn missing_encoders(listing: &str, required: &[&str]) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for name in required {
        let present = listing
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(*name));
        if !present && !missing.iter().any(|m| m == name) {
            missing.push(name.to_string());
        }
    }
    missing
}

/// Quote for an ffmpeg filtergraph argument
pub fn ff_escape(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Builds argument vectors for every ffmpeg invocation in a job
pub struct CommandBuilder<'a> {
    input: String,
    settings: &'a EncoderSettings,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(input: &Path, settings: &'a EncoderSettings) -> Self {
        Self {
            input: input.to_string_lossy().into_owned(),
            settings,
        }
    }

    fn base(&self, overwrite: bool) -> Vec<String> {
        let mut args = Vec::new();
        if overwrite {
            args.push("-y".to_string());
        }
        args.push("-loglevel".to_string());
        args.push(LOGLEVEL.to_string());
        args
    }

    fn encode_base(&self) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            LOGLEVEL.to_string(),
            "-stats".to_string(),
            "-i".to_string(),
            self.input.clone(),
        ]
    }

    /// Decode a subtitle stream to SRT on stdout; its byte count approximates how much text it has
    pub fn subtitle_length(&self, index: u32) -> Vec<String> {
        let mut args = self.base(false);
        args.extend([
            "-i".to_string(),
            self.input.clone(),
            "-map".to_string(),
            format!("0:{}", index),
            "-f".to_string(),
            "srt".to_string(),
            "-".to_string(),
        ]);
        args
    }

    /// Copy one stream losslessly into its own file
    pub fn extract_stream(&self, index: u32, format: &str, output: &Path) -> Vec<String> {
        let mut args = self.base(true);
        args.extend([
            "-i".to_string(),
            self.input.clone(),
            "-map".to_string(),
            format!("0:{}", index),
            "-c".to_string(),
            "copy".to_string(),
            "-f".to_string(),
            format.to_string(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }

    pub fn dump_attachment(&self, index: u32, output: &Path) -> Vec<String> {
        let mut args = self.base(true);
        args.extend([
            format!("-dump_attachment:{}", index),
            output.to_string_lossy().into_owned(),
            "-i".to_string(),
            self.input.clone(),
        ]);
        args
    }

    /// Single-file H.264/AAC fallback with the default subtitle burned in.
    ///
    /// `subtitle_index` is the position among subtitle streams (`si=`), not the
    /// global stream index.
    pub fn fallback_encode(
        &self,
        video_index: u32,
        audio_index: u32,
        subtitle_index: Option<usize>,
        resolution: &Resolution,
        output: &Path,
    ) -> Vec<String> {
        let s = self.settings;
        let mut args = self.encode_base();
        args.extend([
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-brand".to_string(),
            "mp42".to_string(),
        ]);

        args.extend([
            "-map".to_string(),
            format!("0:{}", video_index),
            "-c:v".to_string(),
            s.fallback_video_codec.clone(),
        ]);
        // stereo downmix
        args.extend([
            "-map".to_string(),
            format!("0:{}", audio_index),
            "-c:a".to_string(),
            s.fallback_audio_codec.clone(),
            "-ac".to_string(),
            "2".to_string(),
        ]);

        let mut filters = vec![
            "format=yuv420p".to_string(),
            format!("scale={}:{}", resolution.w, resolution.h),
        ];
        if let Some(si) = subtitle_index {
            // escaped once for the filter option, once for the filtergraph
            filters.push(format!("subtitles={}:si={}", ff_escape(&ff_escape(&self.input)), si));
        }
        args.push("-vf".to_string());
        args.push(filters.join(","));

        args.extend([
            "-f".to_string(),
            "mp4".to_string(),
            "-crf".to_string(),
            s.fallback_crf.to_string(),
            "-preset".to_string(),
            s.fallback_preset.clone(),
            "-tune".to_string(),
            s.fallback_tune.clone(),
            "-bf".to_string(),
            "2".to_string(),
            "-g".to_string(),
            "90".to_string(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Video-only rendition; native size gets no scale filter
    pub fn video_rendition(&self, video_index: u32, resolution: &Resolution, output: &Path) -> Vec<String> {
        let s = self.settings;
        let mut args = self.encode_base();
        args.push("-an".to_string());

        if resolution.name != NATIVE {
            args.push("-vf".to_string());
            args.push(format!("scale={}:{}", resolution.w, resolution.h));
        }

        args.extend([
            "-map".to_string(),
            format!("0:{}", video_index),
            "-c:v".to_string(),
            s.video_codec.clone(),
            "-g".to_string(),
            s.video_gop.to_string(),
            "-preset".to_string(),
            s.video_preset.to_string(),
            "-crf".to_string(),
            s.video_crf.to_string(),
        ]);
        if !s.svtav1_params.is_empty() {
            args.push("-svtav1-params".to_string());
            args.push(s.svtav1_params.clone());
        }
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Audio-only rendition with the fixed downmix/bitrate/samplerate policy
    pub fn audio_rendition(&self, audio_index: u32, output: &Path) -> Vec<String> {
        let s = self.settings;
        let mut args = self.encode_base();
        args.push("-vn".to_string());
        args.extend([
            "-map".to_string(),
            format!("0:{}", audio_index),
            "-c:a".to_string(),
            s.audio_codec.clone(),
            "-b:a".to_string(),
            s.audio_bitrate.clone(),
            "-ar".to_string(),
            s.audio_sample_rate.to_string(),
            "-ac".to_string(),
            s.audio_channels.to_string(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }
}
