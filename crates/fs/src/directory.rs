//! The directory model stored in the CAS.
//!
//! A [`Directory`] lists its immediate children by name. Child directories
//! are referenced by digest, so a single root digest identifies an entire
//! tree (a Merkle tree).
//!
//! # Canonical encoding
//!
//! ```text
//! f <hash> <size> <x|-> <name>\n     one line per file, sorted by name
//! d <hash> <size> <name>\n           one line per directory, sorted by name
//! ```
//!
//! The empty directory encodes to zero bytes, so its digest is
//! [`hashing::EMPTY_DIGEST`].

use std::fmt::Write as _;

use hashing::{Digest, Fingerprint};
use serde::{Deserialize, Serialize};

use crate::FsError;

/// A file entry in a [`Directory`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

/// A subdirectory entry in a [`Directory`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// One level of a directory tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    /// Build a directory, sorting entries and validating names.
    ///
    /// # Errors
    /// Returns [`FsError::InvalidName`] for unusable or duplicate names.
    pub fn new(
        mut files: Vec<FileNode>,
        mut directories: Vec<DirectoryNode>,
    ) -> Result<Self, FsError> {
        files.sort_by(|a, b| a.name.cmp(&b.name));
        directories.sort_by(|a, b| a.name.cmp(&b.name));
        let dir = Self { files, directories };
        dir.validate()?;
        Ok(dir)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    /// Encode to the canonical byte form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for f in &self.files {
            let mode = if f.is_executable { 'x' } else { '-' };
            let _ = writeln!(
                out,
                "f {} {} {mode} {}",
                f.digest.hash, f.digest.size_bytes, f.name
            );
        }
        for d in &self.directories {
            let _ = writeln!(out, "d {} {} {}", d.digest.hash, d.digest.size_bytes, d.name);
        }
        out.into_bytes()
    }

    /// Decode the canonical byte form.
    ///
    /// # Errors
    /// Returns [`FsError::MalformedDirectory`] if a line cannot be parsed and
    /// [`FsError::InvalidName`] if entries are unsorted or duplicated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FsError> {
        let text = std::str::from_utf8(bytes).map_err(|e| FsError::MalformedDirectory {
            reason: format!("not UTF-8: {e}"),
        })?;
        let mut files = Vec::new();
        let mut directories = Vec::new();
        for (lineno, line) in text.split_terminator('\n').enumerate() {
            let malformed = |what: &str| FsError::MalformedDirectory {
                reason: format!("line {}: {what}", lineno + 1),
            };
            match line.split_once(' ') {
                Some(("f", rest)) => {
                    let mut parts = rest.splitn(4, ' ');
                    let digest = parse_digest(parts.next(), parts.next())
                        .ok_or_else(|| malformed("bad file digest"))?;
                    let is_executable = match parts.next() {
                        Some("x") => true,
                        Some("-") => false,
                        _ => return Err(malformed("bad file mode")),
                    };
                    let name = parts.next().ok_or_else(|| malformed("missing file name"))?;
                    if !directories.is_empty() {
                        return Err(malformed("file entry after directory entries"));
                    }
                    files.push(FileNode {
                        name: name.to_owned(),
                        digest,
                        is_executable,
                    });
                }
                Some(("d", rest)) => {
                    let mut parts = rest.splitn(3, ' ');
                    let digest = parse_digest(parts.next(), parts.next())
                        .ok_or_else(|| malformed("bad directory digest"))?;
                    let name = parts
                        .next()
                        .ok_or_else(|| malformed("missing directory name"))?;
                    directories.push(DirectoryNode {
                        name: name.to_owned(),
                        digest,
                    });
                }
                _ => return Err(malformed("unknown entry kind")),
            }
        }
        let dir = Self { files, directories };
        dir.validate()?;
        Ok(dir)
    }

    /// Digest of the canonical encoding.
    #[must_use]
    pub fn digest(&self) -> Digest {
        Digest::of_bytes(&self.to_bytes())
    }

    fn validate(&self) -> Result<(), FsError> {
        let names = self
            .files
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.directories.iter().map(|d| d.name.as_str()));
        for name in names {
            validate_name(name)?;
        }
        check_sorted_unique(self.files.iter().map(|f| f.name.as_str()))?;
        check_sorted_unique(self.directories.iter().map(|d| d.name.as_str()))?;
        for f in &self.files {
            if self.directories.iter().any(|d| d.name == f.name) {
                return Err(FsError::InvalidName {
                    name: f.name.clone(),
                    reason: "used for both a file and a directory".to_owned(),
                });
            }
        }
        Ok(())
    }
}

fn parse_digest(hash: Option<&str>, size: Option<&str>) -> Option<Digest> {
    let hash = Fingerprint::from_hex_string(hash?).ok()?;
    let size = size?.parse().ok()?;
    Some(Digest::new(hash, size))
}

pub(crate) fn validate_name(name: &str) -> Result<(), FsError> {
    let reason = if name.is_empty() {
        "name must not be empty"
    } else if name == "." || name == ".." {
        "name must not be '.' or '..'"
    } else if name.contains('/') {
        "name must not contain '/'"
    } else if name.contains('\n') {
        "name must not contain a newline"
    } else {
        return Ok(());
    };
    Err(FsError::InvalidName {
        name: name.to_owned(),
        reason: reason.to_owned(),
    })
}

fn check_sorted_unique<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), FsError> {
    let mut prev: Option<&str> = None;
    for name in names {
        if let Some(p) = prev
            && p >= name
        {
            return Err(FsError::InvalidName {
                name: name.to_owned(),
                reason: "entries must be unique and sorted by name".to_owned(),
            });
        }
        prev = Some(name);
    }
    Ok(())
}
