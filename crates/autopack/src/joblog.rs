//! Per-job diagnostic trail.
//!
//! Every external tool's stderr and every command line ends up in
//! `<job>/encodeher.log`, grouped into nested `!BEGIN tag!` / `!END tag!` regions.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Local;
use log::warn;

pub const LOG_FILE_NAME: &str = "encodeher.log";

struct Inner {
    out: Option<BufWriter<File>>,
    tags: Vec<String>,
    closed: bool,
}

/// Log sink shared by every stage of a job
pub struct JobLog {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

/// Open region; ends itself when dropped
pub struct Region<'a> {
    log: &'a JobLog,
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        self.log.end();
    }
}

impl JobLog {
    /// Create `encodeher.log` inside `dir`
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(LOG_FILE_NAME);
        let file = File::create(&path)?;
        let log = Self {
            path: Some(path),
            inner: Mutex::new(Inner {
                out: Some(BufWriter::new(file)),
                tags: Vec::new(),
                closed: false,
            }),
        };
        log.append(&format!("!!! LOG START {} !!!\n", Local::now().to_rfc3339()));
        Ok(log)
    }

    /// A log that discards everything, for commands that touch no job directory
    pub fn detached() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner {
                out: None,
                tags: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // A panicking stage must not take the log down with it
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_raw(inner: &mut Inner, text: &str) {
        if inner.closed {
            return;
        }
        if let Some(out) = inner.out.as_mut() {
            if let Err(e) = out.write_all(text.as_bytes()) {
                warn!("Failed to write job log: {}", e);
                inner.out = None;
            }
        }
    }

    fn write_footer(inner: &mut Inner) {
        let tag = inner.tags.pop().unwrap_or_else(|| "REGION".to_string());
        let padding = " ".repeat(inner.tags.len() * 4);
        let text = format!("\n{}!END {}!\n\n", padding, tag);
        Self::write_raw(inner, &text);
    }

    /// Append raw text (tool output, command lines)
    pub fn append(&self, text: &str) {
        let mut inner = self.lock();
        Self::write_raw(&mut inner, text);
    }

    /// Start a named region, nested inside any open one
    pub fn begin(&self, tag: &str) {
        let mut inner = self.lock();
        let padding = " ".repeat(inner.tags.len() * 4);
        let text = format!("\n{}!BEGIN {}!\n\n", padding, tag);
        inner.tags.push(tag.to_string());
        Self::write_raw(&mut inner, &text);
    }

    /// End the innermost region
    pub fn end(&self) {
        let mut inner = self.lock();
        if inner.closed || inner.tags.is_empty() {
            return;
        }
        Self::write_footer(&mut inner);
    }

    pub fn region(&self, tag: &str) -> Region<'_> {
        self.begin(tag);
        Region { log: self }
    }

    /// End every open region, write the end marker and flush. Later writes are ignored.
    pub fn close(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        while !inner.tags.is_empty() {
            Self::write_footer(&mut inner);
        }
        let text = format!("!!! LOG END, REASON: {} !!!\n", reason);
        Self::write_raw(&mut inner, &text);
        if let Some(out) = inner.out.as_mut() {
            if let Err(e) = out.flush() {
                warn!("Failed to flush job log: {}", e);
            }
        }
        inner.closed = true;
    }

    /// Record a fatal error in its own region, then close with it as the reason
    pub fn close_with_error(&self, reason: &str) {
        self.begin("Global Error");
        self.append(&format!("{}\n", reason));
        self.close(reason);
    }
}

impl Drop for JobLog {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(out) = inner.out.as_mut() {
            let _ = out.flush();
        }
    }
}
