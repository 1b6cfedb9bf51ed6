use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::extract::{FontMap, SubtitleAsset};
use crate::ffprobe::Chapter;
use crate::pipeline::{file_name, AudioRendition, VideoRendition};
use crate::resolution::Resolution;

pub const MANIFEST_FILE_NAME: &str = "weebify.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestChapter {
    pub start: f64,
    pub end: f64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestAudio {
    pub file: String,
    pub lang: String,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestVideo {
    pub file: String,
    pub resolution: Resolution,
}

/// The job's result document, `out/weebify.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobManifest {
    pub version: u32,
    pub job: String,
    pub chapters: Vec<ManifestChapter>,
    pub subtitles: Vec<SubtitleAsset>,
    #[serde(rename = "fontMap")]
    pub font_map: FontMap,
    pub audio: Vec<ManifestAudio>,
    pub videos: Vec<ManifestVideo>,
}

impl JobManifest {
    pub fn assemble(
        job: &str,
        chapters: &[Chapter],
        subtitles: Vec<SubtitleAsset>,
        font_map: FontMap,
        audio: &[AudioRendition],
        videos: &[VideoRendition],
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            job: job.to_string(),
            chapters: chapters
                .iter()
                .map(|c| ManifestChapter {
                    start: c.start,
                    end: c.end,
                    title: c.title.clone(),
                })
                .collect(),
            subtitles,
            font_map,
            audio: audio
                .iter()
                .map(|a| ManifestAudio {
                    file: file_name(&a.path),
                    lang: a.lang.clone(),
                    default: a.is_default,
                })
                .collect(),
            videos: videos
                .iter()
                .map(|v| ManifestVideo {
                    file: file_name(&v.path),
                    resolution: v.resolution.clone(),
                })
                .collect(),
        }
    }

    /// Write into `out_dir` through a temporary file, so a reader either sees the
    /// whole manifest or none
    pub async fn write_to(&self, out_dir: &Path) -> Result<PathBuf> {
        let json = serde_json::to_vec(self)?;
        let final_path = out_dir.join(MANIFEST_FILE_NAME);
        let tmp_path = out_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));

        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(final_path)
    }
}
