//! Stream selection heuristics.
//!
//! Picks the default video/audio/subtitle streams of a probed source and the sets of
//! streams worth extracting or encoding. Language and title fallbacks ("???", "unk")
//! are applied here and nowhere else.

use std::future::Future;

use log::{debug, warn};
use serde::Serialize;

use crate::error::{PackError, Result};
use crate::ffprobe::{CodecType, Stream};

/// Advanced SubStation Alpha, the only subtitle format we extract or burn in
pub const ADVANCED_SUBTITLE_CODEC: &str = "ass";
const FONT_CODECS: &[&str] = &["otf", "ttf"];

/// Language key for streams without a language tag
pub const UNKNOWN_LANGUAGE: &str = "???";
/// Language label for audio renditions without a language tag
pub const UNKNOWN_AUDIO_LANGUAGE: &str = "unk";

/// Knobs for the subtitle heuristic
#[derive(Debug, Clone)]
pub struct SubtitlePreferences {
    pub language: String,
    pub allow_undefined_language: bool,
    pub exclude_signs_and_songs: bool,
}

impl Default for SubtitlePreferences {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            allow_undefined_language: true,
            exclude_signs_and_songs: true,
        }
    }
}

/// An audio stream chosen for a rendition, with its resolved language label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioTrack {
    pub index: u32,
    pub lang: String,
    pub is_default: bool,
}

/// First video stream
pub fn video_stream(streams: &[Stream]) -> Result<&Stream> {
    streams
        .iter()
        .find(|s| s.codec_type == CodecType::Video)
        .ok_or(PackError::NoVideoStream)
}

/// Default audio stream: streams in `lang` if any (else all audio), then the one
/// flagged default, else the first
pub fn audio_stream<'a>(streams: &'a [Stream], lang: &str) -> Result<&'a Stream> {
    let audio = all_audio(streams);
    if audio.is_empty() {
        return Err(PackError::NoAudioStream);
    }

    let with_lang: Vec<&Stream> = audio.iter().copied().filter(|s| s.language() == Some(lang)).collect();
    let remaining = if with_lang.is_empty() { audio } else { with_lang };

    let chosen = remaining
        .iter()
        .copied()
        .find(|s| s.is_default())
        .unwrap_or(remaining[0]);
    Ok(chosen)
}

fn is_signs_or_songs(stream: &Stream) -> bool {
    // approximate on purpose: "Signs & Songs", "Songs only", "signs"...
    stream
        .title()
        .map(|t| {
            let t = t.to_lowercase();
            t.contains("signs") || t.contains("songs")
        })
        .unwrap_or(false)
}

/// Default subtitle stream, or `None` when nothing suitable exists.
///
/// Only advanced subtitles are considered. Candidates are those in the preferred
/// language, or (if allowed and none match) those tagged `und` or untagged. With
/// several candidates, sign/song tracks are dropped by title. If that still leaves
/// more than one, the decoded text size of every advanced subtitle stream is probed
/// with `text_size` and the largest wins (first one on ties). A failing size probe
/// degrades the result to `None`.
pub async fn subtitle_stream<'a, F, Fut>(
    streams: &'a [Stream],
    prefs: &SubtitlePreferences,
    mut text_size: F,
) -> Option<&'a Stream>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let subtitles: Vec<&Stream> = streams
        .iter()
        .filter(|s| s.codec_type == CodecType::Subtitle && s.codec() == Some(ADVANCED_SUBTITLE_CODEC))
        .collect();
    if subtitles.is_empty() {
        return None;
    }

    let lang_match: Vec<&Stream> = subtitles
        .iter()
        .copied()
        .filter(|s| s.language() == Some(prefs.language.as_str()))
        .collect();
    let candidates: Vec<&Stream> = if lang_match.is_empty() && prefs.allow_undefined_language {
        subtitles
            .iter()
            .copied()
            .filter(|s| matches!(s.language(), None | Some("und")))
            .collect()
    } else {
        lang_match
    };

    match candidates.len() {
        0 => return None,
        1 => return Some(candidates[0]),
        _ => {}
    }

    let survivors: Vec<&Stream> = if prefs.exclude_signs_and_songs {
        candidates.iter().copied().filter(|s| !is_signs_or_songs(s)).collect()
    } else {
        candidates
    };

    match survivors.len() {
        0 => return None,
        1 => return Some(survivors[0]),
        _ => {}
    }

    // Still ambiguous: the track with the most text is probably the full dialogue
    let mut longest: Option<(&Stream, u64)> = None;
    for sub in &subtitles {
        let len = match text_size(sub.index).await {
            Ok(len) => len,
            Err(e) => {
                warn!("Subtitle length probe failed, not selecting a default subtitle: {}", e);
                return None;
            }
        };
        debug!("Subtitle stream #{} decodes to {} bytes", sub.index, len);
        if longest.map_or(true, |(_, best)| len > best) {
            longest = Some((*sub, len));
        }
    }

    longest.map(|(s, _)| s)
}

/// One audio stream per language: the default stream first, then the first stream
/// seen for every other language, in source order
pub fn unique_language_audio<'a>(streams: &'a [Stream], default: &'a Stream) -> Vec<&'a Stream> {
    let key = |s: &Stream| s.language().unwrap_or(UNKNOWN_LANGUAGE).to_string();

    let mut seen = vec![key(default)];
    let mut picked = vec![default];

    for stream in all_audio(streams) {
        let lang = key(stream);
        if !seen.contains(&lang) {
            seen.push(lang);
            picked.push(stream);
        }
    }

    picked
}

/// Resolve rendition labels for the unique-language audio set
pub fn audio_tracks(unique: &[&Stream], default: &Stream) -> Vec<AudioTrack> {
    unique
        .iter()
        .map(|s| AudioTrack {
            index: s.index,
            lang: s.language().unwrap_or(UNKNOWN_AUDIO_LANGUAGE).to_string(),
            is_default: s.index == default.index,
        })
        .collect()
}

pub fn all_subtitles(streams: &[Stream]) -> Vec<&Stream> {
    streams.iter().filter(|s| s.codec_type == CodecType::Subtitle).collect()
}

pub fn all_audio(streams: &[Stream]) -> Vec<&Stream> {
    streams.iter().filter(|s| s.codec_type == CodecType::Audio).collect()
}

/// Attachments we can serve as web fonts
pub fn supported_fonts(streams: &[Stream]) -> Vec<&Stream> {
    streams
        .iter()
        .filter(|s| s.codec().map(|c| FONT_CODECS.contains(&c)).unwrap_or(false))
        .collect()
}

/// Advanced subtitle streams, the ones worth extracting
pub fn advanced_subtitles(streams: &[Stream]) -> Vec<&Stream> {
    streams
        .iter()
        .filter(|s| s.codec() == Some(ADVANCED_SUBTITLE_CODEC))
        .collect()
}

/// Position of `selected` among all subtitle streams, as the `subtitles` filter's
/// `si=` option counts them
pub fn subtitle_relative_index(streams: &[Stream], selected: &Stream) -> Option<usize> {
    all_subtitles(streams).iter().position(|s| s.index == selected.index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffprobe::tests::stream;
    use std::collections::HashMap;

    fn audio(index: u32, lang: Option<&str>, default: bool) -> Stream {
        let tags: Vec<(&str, &str)> = lang.map(|l| vec![("language", l)]).unwrap_or_default();
        let mut s = stream(index, CodecType::Audio, "flac", &tags);
        s.disposition = HashMap::from([("default".to_string(), i32::from(default))]);
        s
    }

    fn ass(index: u32, lang: Option<&str>, title: Option<&str>) -> Stream {
        let mut tags = Vec::new();
        if let Some(l) = lang {
            tags.push(("language", l));
        }
        if let Some(t) = title {
            tags.push(("title", t));
        }
        stream(index, CodecType::Subtitle, "ass", &tags)
    }

    async fn no_probe(_: u32) -> Result<u64> {
        panic!("length probe should not be needed");
    }

    #[test]
    fn test_video_stream() {
        let streams = vec![audio(0, Some("jpn"), true), stream(1, CodecType::Video, "h264", &[])];
        assert_eq!(video_stream(&streams).unwrap().index, 1);

        let err = video_stream(&streams[..1]).unwrap_err();
        assert!(matches!(err, PackError::NoVideoStream));
    }

    #[test]
    fn test_audio_prefers_default_within_language() {
        let streams = vec![
            audio(1, Some("eng"), true),
            audio(2, Some("jpn"), false),
            audio(3, Some("jpn"), true),
        ];
        assert_eq!(audio_stream(&streams, "jpn").unwrap().index, 3);
    }

    #[test]
    fn test_audio_falls_back_to_all_streams() {
        let streams = vec![audio(1, Some("eng"), false), audio(2, Some("ger"), true)];
        assert_eq!(audio_stream(&streams, "jpn").unwrap().index, 2);

        let streams = vec![audio(1, Some("eng"), false), audio(2, None, false)];
        assert_eq!(audio_stream(&streams, "jpn").unwrap().index, 1);
    }

    #[test]
    fn test_no_audio_is_error() {
        let streams = vec![stream(0, CodecType::Video, "h264", &[])];
        assert!(matches!(audio_stream(&streams, "jpn").unwrap_err(), PackError::NoAudioStream));
    }

    #[tokio::test]
    async fn test_signs_and_songs_excluded_without_probe() {
        let streams = vec![
            ass(2, Some("eng"), Some("Full Subtitles")),
            ass(3, Some("eng"), Some("Signs & Songs")),
        ];
        let chosen = subtitle_stream(&streams, &SubtitlePreferences::default(), no_probe).await;
        assert_eq!(chosen.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_longest_subtitle_wins_first_on_tie() {
        let streams = vec![
            ass(2, Some("eng"), Some("Dialogue A")),
            ass(3, Some("eng"), Some("Dialogue B")),
            ass(4, Some("eng"), Some("Dialogue C")),
        ];
        let sizes = HashMap::from([(2u32, 100u64), (3, 900), (4, 900)]);
        let mut probed = Vec::new();
        let chosen = subtitle_stream(&streams, &SubtitlePreferences::default(), |i| {
            probed.push(i);
            let size = sizes[&i];
            async move { Ok(size) }
        })
        .await;

        assert_eq!(chosen.unwrap().index, 3);
        assert_eq!(probed, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_length_probe_covers_every_advanced_subtitle() {
        // the largest track is in another language and still wins
        let streams = vec![
            ass(2, Some("eng"), None),
            ass(3, Some("eng"), None),
            ass(4, Some("ger"), None),
        ];
        let chosen = subtitle_stream(&streams, &SubtitlePreferences::default(), |i| async move {
            Ok(if i == 4 { 5000 } else { 10 })
        })
        .await;
        assert_eq!(chosen.unwrap().index, 4);
    }

    #[tokio::test]
    async fn test_length_probe_failure_degrades_to_none() {
        let streams = vec![ass(2, Some("eng"), None), ass(3, Some("eng"), None)];
        let chosen = subtitle_stream(&streams, &SubtitlePreferences::default(), |i| async move {
            Err(PackError::SubtitleLengthProbeFailure { index: i, message: "boom".into() })
        })
        .await;
        assert!(chosen.is_none());
    }

    #[tokio::test]
    async fn test_undefined_language_fallback() {
        let streams = vec![
            ass(2, Some("ger"), None),
            ass(3, Some("und"), Some("Subs")),
            stream(4, CodecType::Subtitle, "subrip", &[("language", "eng")]),
        ];
        let prefs = SubtitlePreferences::default();
        assert_eq!(subtitle_stream(&streams, &prefs, no_probe).await.unwrap().index, 3);

        let strict = SubtitlePreferences { allow_undefined_language: false, ..prefs };
        assert!(subtitle_stream(&streams, &strict, no_probe).await.is_none());
    }

    #[tokio::test]
    async fn test_only_signs_and_songs_gives_none() {
        let streams = vec![ass(2, Some("eng"), Some("Signs")), ass(3, Some("eng"), Some("SONGS"))];
        assert!(subtitle_stream(&streams, &SubtitlePreferences::default(), no_probe).await.is_none());
    }

    #[test]
    fn test_unique_language_audio_keeps_default_first() {
        let streams = vec![
            audio(1, Some("eng"), false),
            audio(2, Some("jpn"), false),
            audio(3, Some("jpn"), true),
            audio(4, None, false),
            audio(5, Some("eng"), false),
            audio(6, None, false),
        ];
        let default = audio_stream(&streams, "jpn").unwrap();
        let unique = unique_language_audio(&streams, default);
        let indices: Vec<u32> = unique.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![3, 1, 4]);

        let tracks = audio_tracks(&unique, default);
        assert_eq!(
            tracks,
            vec![
                AudioTrack { index: 3, lang: "jpn".into(), is_default: true },
                AudioTrack { index: 1, lang: "eng".into(), is_default: false },
                AudioTrack { index: 4, lang: "unk".into(), is_default: false },
            ]
        );
    }

    #[test]
    fn test_helper_selectors() {
        let streams = vec![
            stream(0, CodecType::Video, "hevc", &[]),
            stream(1, CodecType::Subtitle, "subrip", &[]),
            ass(2, Some("eng"), None),
            stream(3, CodecType::Attachment, "ttf", &[("filename", "a.ttf")]),
            stream(4, CodecType::Attachment, "otf", &[("filename", "b.otf")]),
            stream(5, CodecType::Attachment, "png", &[("filename", "cover.png")]),
        ];
        let fonts: Vec<u32> = supported_fonts(&streams).iter().map(|s| s.index).collect();
        assert_eq!(fonts, vec![3, 4]);
        assert_eq!(advanced_subtitles(&streams).len(), 1);
        assert_eq!(all_subtitles(&streams).len(), 2);
        assert_eq!(subtitle_relative_index(&streams, &streams[2]), Some(1));
    }
}
