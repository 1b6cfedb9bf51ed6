use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::extract::slugify;

/// Media file extensions to consider for packing
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm"];

/// A source file found in a library, with the job id it will be packed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub job_id: String,
    pub size: u64,
}

fn is_media(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| MEDIA_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Job id for a source: its slugified file stem, made unique within one scan
fn job_id_for(path: &Path, used: &mut HashSet<String>) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let mut base = slugify(&stem);
    if base.is_empty() {
        base = "job".to_string();
    }

    let mut id = base.clone();
    let mut n = 2;
    while used.contains(&id) {
        id = format!("{}-{}", base, n);
        n += 1;
    }
    used.insert(id.clone());
    id
}

/// Walk `root` for media files, sorted by path so batch order is stable
pub fn scan_library(root: &Path) -> Result<Vec<MediaFile>> {
    if !root.is_dir() {
        return Err(anyhow!("Library root does not exist: {}", root.display()));
    }
    info!("Scanning directory: {}", root.display());

    let mut paths = Vec::new();
    let mut entry_count = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        entry_count += 1;
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !entry.file_type().is_file() || !is_media(path) {
            continue;
        }
        debug!("Found media file: {}", path.display());
        paths.push(path.to_path_buf());
    }
    paths.sort();

    let mut used = HashSet::new();
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let size = std::fs::metadata(&path)
            .with_context(|| format!("Failed to stat file: {}", path.display()))?
            .len();
        let job_id = job_id_for(&path, &mut used);
        files.push(MediaFile { path, job_id, size });
    }

    info!(
        "Finished scanning {}: {} total entries, {} media files found",
        root.display(),
        entry_count,
        files.len()
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_finds_media_with_unique_job_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("s1")).unwrap();
        std::fs::create_dir_all(dir.path().join("s2")).unwrap();
        std::fs::write(dir.path().join("s1/Episode 01.mkv"), b"a").unwrap();
        std::fs::write(dir.path().join("s2/Episode 01.MP4"), b"bb").unwrap();
        std::fs::write(dir.path().join("s2/notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("s2/cover.jpg"), b"x").unwrap();

        let files = scan_library(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].job_id, "Episode-01");
        assert_eq!(files[0].size, 1);
        assert_eq!(files[1].job_id, "Episode-01-2");
        assert!(files[1].path.ends_with("s2/Episode 01.MP4"));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_library(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_unsluggable_stem() {
        let mut used = HashSet::new();
        assert_eq!(job_id_for(Path::new("/m/日本.mkv"), &mut used), "job");
        assert_eq!(job_id_for(Path::new("/m/中文.mkv"), &mut used), "job-2");
    }
}
