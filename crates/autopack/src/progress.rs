use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// Pipeline stage an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Metadata,
    Subtitles,
    Fonts,
    FallbackEncode,
    VideoEncode,
    AudioEncode,
    Packaging,
}

/// One progress observation. For encodes `elapsed`/`total` are seconds of media,
/// for extraction stages they count items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub item: String,
    pub elapsed: f64,
    pub total: f64,
}

pub type ProgressSink = UnboundedSender<ProgressEvent>;

/// Reports progress for one item; never goes backwards
pub struct ItemProgress {
    sink: Option<ProgressSink>,
    stage: Stage,
    item: String,
    total: f64,
    last: f64,
}

impl ItemProgress {
    pub fn new(sink: Option<&ProgressSink>, stage: Stage, item: impl Into<String>, total: f64) -> Self {
        Self {
            sink: sink.cloned(),
            stage,
            item: item.into(),
            total,
            last: 0.0,
        }
    }

    pub fn report(&mut self, elapsed: f64) {
        let elapsed = elapsed.min(self.total).max(self.last);
        self.last = elapsed;
        if let Some(sink) = &self.sink {
            // nobody listening is fine
            let _ = sink.send(ProgressEvent {
                stage: self.stage,
                item: self.item.clone(),
                elapsed,
                total: self.total,
            });
        }
    }

    pub fn finish(&mut self) {
        self.report(self.total);
    }

    /// Scan one encoder diagnostic line and report any timestamp in it
    pub fn observe_line(&mut self, line: &str) {
        if let Some(t) = parse_time(line) {
            self.report(t);
        }
    }
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=(-?\d+):(\d+):(\d+)\.(\d+)\s").expect("static regex is valid"))
}

/// Extract elapsed seconds from an ffmpeg stats line (`time=H:MM:SS.CC `)
pub fn parse_time(line: &str) -> Option<f64> {
    let caps = time_regex().captures(line)?;
    let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());

    let hours = field(1)?;
    let minutes = field(2)?;
    let seconds = field(3)?;
    // fractional part is hundredths, as ffmpeg prints it
    let hundredths = field(4)?;

    let total = hours * 3600.0 + minutes * 60.0 + seconds + hundredths * 0.01;
    Some(total.max(0.0))
}

/// Split a diagnostic byte stream into lines on either `\n` or `\r`.
///
/// Returns complete lines and leaves the unterminated tail in `buf`.
pub fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' || b == b'\r' {
            if i > start {
                lines.push(String::from_utf8_lossy(&buf[start..i]).into_owned());
            }
            start = i + 1;
        }
    }
    buf.drain(..start);
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_time() {
        let line = "frame= 2400 fps=48 q=-0.0 size=  10240kB time=00:01:40.10 bitrate= 838.0kbits/s speed=2x";
        let t = parse_time(line).unwrap();
        assert!((t - 100.1).abs() < 1e-9);

        let t = parse_time("size=N/A time=1:02:03.50 bitrate=N/A").unwrap();
        assert!((t - 3723.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_time_rejects_other_lines() {
        assert_eq!(parse_time("Stream #0:1: Audio: opus"), None);
        assert_eq!(parse_time("time=N/A bitrate=N/A"), None);
        // must be followed by whitespace
        assert_eq!(parse_time("time=00:00:01.00"), None);
    }

    #[test]
    fn test_negative_time_clamps_to_zero() {
        assert_eq!(parse_time("time=-1:00:00.05 bitrate"), Some(0.0));
    }

    #[test]
    fn test_drain_lines_splits_on_cr_and_lf() {
        let mut buf = b"frame=1 time=00:00:01.00 \rframe=2 time=00:00:02.00 \r\nInput #0\npartial".to_vec();
        let lines = drain_lines(&mut buf);
        assert_eq!(
            lines,
            vec!["frame=1 time=00:00:01.00 ", "frame=2 time=00:00:02.00 ", "Input #0"]
        );
        assert_eq!(buf, b"partial");
    }

    #[test]
    fn test_item_progress_is_monotonic_and_finishes_at_total() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = ItemProgress::new(Some(&tx), Stage::VideoEncode, "720p", 60.0);
        p.observe_line("time=00:00:10.00 x");
        p.observe_line("time=00:00:05.00 x");
        p.observe_line("no timestamp here");
        p.finish();

        let seen: Vec<f64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.elapsed).collect();
        assert_eq!(seen, vec![10.0, 10.0, 60.0]);
    }

    #[test]
    fn test_item_progress_without_sink() {
        let mut p = ItemProgress::new(None, Stage::AudioEncode, "jpn", 1.0);
        p.report(0.5);
        p.finish();
    }
}
