//! Filesystem metadata scan feeding the diff engine.
//!
//! Walks the codebase root with gitignore rules honored, skipping the static
//! noise directories, binary files, and anything over the size cap. Produces
//! path + mtime metadata only; content is read later, per batch.

use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::config::normalize_rel_path;

/// Directory names never worth indexing or watching: VCS metadata, build
/// outputs, dependency trees, caches.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    "target",
    "dist",
    "build",
    ".next",
    "vendor",
    ".venv",
    ".coderag",
];

/// File name suffixes dropped before any content read.
pub const SKIP_SUFFIXES: &[&str] = &[".log", ".lock", ".min.js", ".map"];

/// Metadata for one file visible in the filesystem view.
#[derive(Debug, Clone)]
pub struct FsEntry {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    /// Modification time, ms since epoch.
    pub mtime: i64,
}

/// Whether any path component or the file name disqualifies this path.
pub fn is_ignored_path(rel_path: &str) -> bool {
    if rel_path.split('/').any(|part| SKIP_DIRS.contains(&part)) {
        return true;
    }
    SKIP_SUFFIXES.iter().any(|suf| rel_path.ends_with(suf))
}

/// Check if a file appears to be text by probing the first 8KB for null bytes.
pub fn is_text_file(path: &Path) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; 8192];
    let n = match std::io::Read::read(&mut file, &mut buf) {
        Ok(n) => n,
        Err(_) => return false,
    };
    !buf[..n].contains(&0)
}

pub fn mtime_ms(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Walk the root and collect candidate files within the size cap.
/// Gitignore rules apply; the static skip lists apply on top of them.
pub fn scan_files(root: &Path, max_file_size: u64) -> Vec<FsEntry> {
    let start = std::time::Instant::now();
    let results: Mutex<Vec<FsEntry>> = Mutex::new(Vec::new());
    let skipped_large = std::sync::atomic::AtomicUsize::new(0);

    WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .filter_entry(|entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return !SKIP_DIRS.contains(&name.as_ref());
            }
            true
        })
        .build_parallel()
        .run(|| {
            Box::new(|entry| {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => return ignore::WalkState::Continue,
                };
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    return ignore::WalkState::Continue;
                }
                let abs_path = entry.path().to_path_buf();
                let rel_path = match normalize_rel_path(root, &abs_path) {
                    Some(p) => p,
                    None => return ignore::WalkState::Continue,
                };
                if is_ignored_path(&rel_path) {
                    return ignore::WalkState::Continue;
                }
                let meta = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => return ignore::WalkState::Continue,
                };
                if meta.len() > max_file_size {
                    skipped_large.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return ignore::WalkState::Continue;
                }
                if !is_text_file(&abs_path) {
                    return ignore::WalkState::Continue;
                }
                let mtime = mtime_ms(&meta);
                results.lock().unwrap().push(FsEntry {
                    rel_path,
                    abs_path,
                    size: meta.len(),
                    mtime,
                });
                ignore::WalkState::Continue
            })
        });

    let mut files = results.into_inner().unwrap();
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    debug!(
        files = files.len(),
        skipped_large = skipped_large.load(std::sync::atomic::Ordering::Relaxed),
        time_ms = start.elapsed().as_millis() as u64,
        "filesystem scan complete"
    );
    files
}
