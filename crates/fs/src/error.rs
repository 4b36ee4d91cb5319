use std::path::PathBuf;

use thiserror::Error;

/// Errors from path validation, tree construction, and disk scanning.
#[derive(Debug, Error)]
pub enum FsError {
    /// A path failed [`RelativePath`](crate::RelativePath) validation.
    #[error("invalid relative path {}: {reason}", path.display())]
    InvalidPath {
        /// The rejected path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// A directory entry name is unusable (empty, contains `/`, etc.).
    #[error("invalid entry name {name:?}: {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Encoded directory bytes could not be decoded.
    #[error("malformed directory encoding: {reason}")]
    MalformedDirectory {
        /// What was wrong with the encoding.
        reason: String,
    },

    /// The same path was added both as a file and as a directory.
    #[error("path {} is both a file and a directory", path.display())]
    Collision {
        /// The conflicting path.
        path: PathBuf,
    },

    /// A glob pattern was invalid.
    #[error("invalid glob {pattern:?}: {message}")]
    Glob {
        /// The offending pattern.
        pattern: String,
        /// Parser message.
        message: String,
    },

    /// An I/O error occurred while reading the filesystem.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
