//! Resolution of the configured watch paths: glob expansion, recursive
//! directory walks, symlink and special-file policy, exclusion list.

use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

/// Compiled exclusion patterns. Any watched-path candidate matching one
/// of them is silently skipped.
#[derive(Default)]
pub struct ExcludeList {
    patterns: Vec<Regex>,
}

impl ExcludeList {
    /// Compile the configured patterns, dropping (and reporting) the
    /// ones that do not parse.
    pub fn compile(patterns: &[String]) -> ExcludeList {
        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::error!(pattern = %p, error = %e, "bad exclude pattern, ignoring");
                    None
                }
            })
            .collect();
        ExcludeList { patterns }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.patterns.iter().any(|regex| regex.is_match(&text))
    }
}

/// A resolved candidate for watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Rebase an absolute configured path under the optional root prefix.
pub fn rebase(root: Option<&Path>, path: &Path) -> PathBuf {
    match root {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(path)),
        None => path.to_path_buf(),
    }
}

/// Resolve one candidate path: sockets and irregular files are skipped,
/// symlinks are followed one level (relative targets against the link's
/// parent directory).
pub fn resolve(path: &Path) -> Option<FileInfo> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::debug!(file = %path.display(), error = %e, "cannot stat, skipping");
            return None;
        }
    };
    let (path, meta) = if meta.file_type().is_symlink() {
        let target = match std::fs::read_link(path) {
            Ok(target) => target,
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "cannot read link, skipping");
                return None;
            }
        };
        let target = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(Path::new("/")).join(target)
        };
        match std::fs::metadata(&target) {
            Ok(meta) => (target, meta),
            Err(_) => return None,
        }
    } else {
        (path.to_path_buf(), meta)
    };

    if !meta.is_file() && !meta.is_dir() {
        tracing::debug!(file = %path.display(), "not a regular file or directory, skipping");
        return None;
    }
    Some(FileInfo {
        is_dir: meta.is_dir(),
        path,
    })
}

/// Expand a configured list of globs and paths into watchable files.
/// Directories are walked recursively and contribute themselves plus
/// every descendant.
pub fn list_files(patterns: &[String], root: Option<&Path>) -> Vec<FileInfo> {
    let mut files = Vec::new();
    for pattern in patterns {
        let real = rebase(root, Path::new(pattern));
        let matches = match glob::glob(&real.to_string_lossy()) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(pattern = %real.display(), error = %e, "bad glob, ignoring");
                continue;
            }
        };
        for entry in matches {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(error = %e, "unreadable glob entry, ignoring");
                    continue;
                }
            };
            let Some(info) = resolve(&entry) else { continue };
            if info.is_dir {
                for walked in WalkDir::new(&info.path) {
                    match walked {
                        Ok(walked) => {
                            if let Some(info) = resolve(walked.path()) {
                                files.push(info);
                            }
                        }
                        Err(e) => {
                            tracing::error!(dir = %info.path.display(), error = %e, "walk error")
                        }
                    }
                }
            } else {
                files.push(info);
            }
        }
    }
    files
}
