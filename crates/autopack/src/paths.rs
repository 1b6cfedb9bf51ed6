use std::path::{Path, PathBuf};

use log::debug;

/// Working directory tree of one job: `<work_dir>/<job>/{fonts,out}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub base: PathBuf,
    pub fonts: PathBuf,
    pub out: PathBuf,
}

impl JobPaths {
    pub fn new(work_dir: &Path, job: &str) -> Self {
        let base = work_dir.join(job);
        Self {
            fonts: base.join("fonts"),
            out: base.join("out"),
            base,
        }
    }

    /// Wipe whatever a previous run left behind and create a fresh tree
    pub async fn prepare(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.base).await {
            Ok(()) => debug!("Removed stale job directory {}", self.base.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::create_dir_all(&self.base).await?;
        tokio::fs::create_dir(&self.fonts).await?;
        tokio::fs::create_dir(&self.out).await?;
        Ok(())
    }
}
