use std::collections::HashMap;
use std::path::Path;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};
use crate::ffmpeg::{StdoutMode, Toolchain};
use crate::joblog::JobLog;

/// Stream kinds ffprobe reports; anything else (e.g. `data`) is `Other`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    Video,
    Audio,
    Subtitle,
    Attachment,
    #[default]
    #[serde(other)]
    Other,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Stream {
    pub index: u32,
    #[serde(default)]
    pub codec_type: CodecType,
    pub codec_name: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub disposition: HashMap<String, i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Stream {
    pub fn language(&self) -> Option<&str> {
        self.tags.get("language").map(String::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.tags.get("title").map(String::as_str)
    }

    /// Embedded filename of an attachment
    pub fn filename(&self) -> Option<&str> {
        self.tags.get("filename").map(String::as_str)
    }

    pub fn codec(&self) -> Option<&str> {
        self.codec_name.as_deref()
    }

    /// `disposition.default` set by the muxer
    pub fn is_default(&self) -> bool {
        self.disposition.get("default").copied().unwrap_or(0) != 0
    }
}

/// Container-level metadata
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Format {
    /// Duration in seconds, as a decimal string
    pub duration: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start: f64,
    pub end: f64,
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    start_time: String,
    end_time: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawProbe {
    format: Format,
    #[serde(default)]
    streams: Vec<Stream>,
    #[serde(default)]
    chapters: Vec<RawChapter>,
}

/// Everything the pipeline needs to know about a source, produced once per job
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub format: Format,
    pub streams: Vec<Stream>,
    pub chapters: Vec<Chapter>,
    /// `format.duration` parsed to seconds
    pub duration: f64,
}

fn parse_seconds(value: &str, what: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|e| PackError::ProbeFailure(format!("invalid {} {:?}: {}", what, value, e)))
}

/// Parse `-print_format json -show_format -show_streams -show_chapters` output
pub fn parse_probe_output(json: &str) -> Result<ProbeResult> {
    let raw: RawProbe = serde_json::from_str(json)
        .map_err(|e| PackError::ProbeFailure(format!("unparsable ffprobe output: {}", e)))?;

    let duration = match raw.format.duration.as_deref() {
        Some(d) => parse_seconds(d, "format.duration")?,
        None => return Err(PackError::ProbeFailure("format.duration missing".to_string())),
    };

    let mut chapters = Vec::with_capacity(raw.chapters.len());
    for chapter in raw.chapters {
        let start = parse_seconds(&chapter.start_time, "chapter start_time")?;
        let end = parse_seconds(&chapter.end_time, "chapter end_time")?;
        if end <= start {
            warn!("Dropping chapter with end {} <= start {}", end, start);
            continue;
        }
        chapters.push(Chapter {
            start,
            end,
            title: chapter.tags.get("title").cloned().unwrap_or_else(|| "?".to_string()),
        });
    }

    Ok(ProbeResult {
        format: raw.format,
        streams: raw.streams,
        chapters,
        duration,
    })
}

/// Run ffprobe against `input` and parse streams, format and chapters
pub async fn probe_file(tools: &Toolchain, input: &Path, log: &JobLog) -> Result<ProbeResult> {
    let _region = log.region("Streams, format and chapters");

    let args: Vec<String> = vec![
        "-loglevel".into(),
        "24".into(),
        "-print_format".into(),
        "json".into(),
        "-show_format".into(),
        "-show_streams".into(),
        "-show_chapters".into(),
        input.to_string_lossy().into_owned(),
    ];

    let output = tools
        .run(&tools.ffprobe_bin, &args, StdoutMode::Capture, log, |_| {})
        .await
        .map_err(|e| PackError::ProbeFailure(format!("failed to execute ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(PackError::ProbeFailure(format!(
            "ffprobe exited with {} for {}",
            output.status,
            input.display()
        )));
    }

    let json = String::from_utf8(output.stdout)
        .map_err(|_| PackError::ProbeFailure("ffprobe output is not valid UTF-8".to_string()))?;

    let probe = parse_probe_output(&json)?;
    debug!(
        "ffprobe: {} streams, {} chapters, duration {:.2}s",
        probe.streams.len(),
        probe.chapters.len(),
        probe.duration
    );
    Ok(probe)
}
