use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for autopack jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopackConfig {
    /// Root of the per-job working directories (`<work_dir>/<job>/{fonts,out}`)
    pub work_dir: PathBuf,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Path to the DASH packager binary
    pub packager_bin: PathBuf,
    /// Preferred audio language for the default audio track
    pub audio_language: String,
    /// Preferred subtitle language for the default (burned-in) subtitle track
    pub subtitle_language: String,
    /// Accept "und"/untagged subtitles when nothing matches `subtitle_language`
    pub allow_undefined_subtitle_language: bool,
    /// Drop subtitle candidates titled like "Signs & Songs" (approximate heuristic)
    pub exclude_signs_and_songs: bool,
    /// Ladder tier used for the fallback single-file encode
    pub fallback_resolution: String,
    /// Codec policies for every encode
    pub encoders: EncoderSettings,
}

/// Fixed codec policies; exposed as data so operators can tune them per library
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub fallback_video_codec: String,
    pub fallback_crf: u8,
    pub fallback_preset: String,
    pub fallback_tune: String,
    pub fallback_audio_codec: String,
    pub video_codec: String,
    pub video_preset: u8,
    pub video_crf: u8,
    pub video_gop: u32,
    pub svtav1_params: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    pub audio_channels: u8,
}

impl Default for AutopackConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            fallback_video_codec: "libx264".to_string(),
            fallback_crf: 23,
            fallback_preset: "slow".to_string(),
            fallback_tune: "animation".to_string(),
            fallback_audio_codec: "aac".to_string(),
            video_codec: "libsvtav1".to_string(),
            video_preset: 7,
            video_crf: 33,
            video_gop: 90,
            // low film-grain keeps 2D animation clean at high crf
            svtav1_params: "tune=0:film-grain=2".to_string(),
            audio_codec: "libopus".to_string(),
            audio_bitrate: "96k".to_string(),
            audio_sample_rate: 48000,
            audio_channels: 2,
        }
    }
}

impl AutopackConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("weebify-encodeher"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            packager_bin: PathBuf::from("packager"),
            audio_language: "jpn".to_string(),
            subtitle_language: "eng".to_string(),
            allow_undefined_subtitle_language: true,
            exclude_signs_and_songs: true,
            fallback_resolution: "720p".to_string(),
            encoders: EncoderSettings::default(),
        }
    }

    /// Load the configuration named on the command line, or the defaults when none is given.
    ///
    /// A named file must exist; keys it leaves out keep their default values.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let Some(config_path) = path else {
            return Ok(Self::default_config());
        };
        if !config_path.is_file() {
            bail!("Config file not found: {}", config_path.display());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        match config_path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", config_path.display())),
            _ => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", config_path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_named_but_missing_file_is_an_error() {
        let err = AutopackConfig::load_config(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn test_no_file_yields_defaults() {
        let cfg = AutopackConfig::load_config(None).unwrap();
        assert_eq!(cfg.audio_language, "jpn");
        assert_eq!(cfg.subtitle_language, "eng");
        assert_eq!(cfg.fallback_resolution, "720p");
        assert!(cfg.exclude_signs_and_songs);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "audio_language = \"eng\"").unwrap();
        writeln!(file, "[encoders]").unwrap();
        writeln!(file, "video_crf = 30").unwrap();

        let cfg = AutopackConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.audio_language, "eng");
        assert_eq!(cfg.encoders.video_crf, 30);
        assert_eq!(cfg.encoders.video_preset, 7);
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"packager_bin": "/opt/shaka/packager", "exclude_signs_and_songs": false}}"#).unwrap();

        let cfg = AutopackConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.packager_bin, PathBuf::from("/opt/shaka/packager"));
        assert!(!cfg.exclude_signs_and_songs);
        assert!(cfg.allow_undefined_subtitle_language);
    }
}
