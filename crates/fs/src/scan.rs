//! Reading real directories: recursive scans and glob expansion.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use crate::{FsError, RelativePath};

/// A filesystem entry discovered by [`scan`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathStat {
    Dir { path: RelativePath },
    File { path: RelativePath, is_executable: bool },
}

impl PathStat {
    #[must_use]
    pub const fn path(&self) -> &RelativePath {
        match self {
            Self::Dir { path } | Self::File { path, .. } => path,
        }
    }
}

/// Stat `root/path` and, if it is a directory, everything below it.
///
/// Symlinks are followed. A missing path (or a dangling symlink) yields an
/// empty list rather than an error. Results are sorted.
///
/// # Errors
/// Returns [`FsError::Io`] for failures other than not-found, and
/// [`FsError::InvalidPath`] for entry names that are not valid UTF-8.
pub fn scan(root: &Path, path: &RelativePath) -> Result<Vec<PathStat>, FsError> {
    let mut out = Vec::new();
    scan_into(root, path, &mut out)?;
    out.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(out)
}

fn scan_into(root: &Path, path: &RelativePath, out: &mut Vec<PathStat>) -> Result<(), FsError> {
    let abs = root.join(path);
    let metadata = match std::fs::metadata(&abs) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(FsError::io(abs, e)),
    };
    if metadata.is_dir() {
        out.push(PathStat::Dir { path: path.clone() });
        let entries = std::fs::read_dir(&abs).map_err(|e| FsError::io(&abs, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(&abs, e))?;
            let child = path.join(&RelativePath::new(entry.file_name())?);
            scan_into(root, &child, out)?;
        }
    } else if metadata.is_file() {
        out.push(PathStat::File {
            path: path.clone(),
            is_executable: is_executable(&metadata),
        });
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
const fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Expand glob `patterns` relative to `root`, returning matching files.
///
/// Directories are not returned. The result is sorted and deduplicated.
///
/// # Errors
/// Returns [`FsError::Glob`] for an invalid pattern, [`FsError::InvalidPath`]
/// for patterns that escape `root`, and [`FsError::Io`] for unreadable paths.
pub fn expand_globs(root: &Path, patterns: &[String]) -> Result<Vec<RelativePath>, FsError> {
    let mut matches = BTreeSet::new();
    for pattern in patterns {
        // Validates that the pattern stays under root.
        RelativePath::new(pattern)?;
        let full = root.join(pattern);
        let paths = glob::glob(&full.to_string_lossy()).map_err(|e| FsError::Glob {
            pattern: pattern.clone(),
            message: e.msg.to_owned(),
        })?;
        for entry in paths {
            let abs = entry.map_err(|e| {
                let path = e.path().to_owned();
                FsError::io(path, e.into_error())
            })?;
            if !abs.is_file() {
                continue;
            }
            let rel = abs.strip_prefix(root).map_err(|_| FsError::InvalidPath {
                path: abs.clone(),
                reason: format!("glob match is outside {}", root.display()),
            })?;
            matches.insert(RelativePath::new(rel)?);
        }
    }
    tracing::debug!(count = matches.len(), "expanded globs");
    Ok(matches.into_iter().collect())
}

/// `create_dir_all` that tolerates concurrent creation of the same path.
///
/// # Errors
/// Propagates I/O errors other than `AlreadyExists`.
pub fn safe_create_dir_all(path: &Path) -> io::Result<()> {
    match std::fs::create_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}
