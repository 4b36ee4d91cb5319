//! The on-disk content-addressed store.
//!
//! # Directory layout
//!
//! ```text
//! <root>/
//! ├── files/<aa>/<hash>           ← file contents
//! ├── directories/<aa>/<hash>     ← encoded Directory values
//! ├── action_cache/<aa>/<hash>    ← "<hash> <size>" of a cached result blob
//! └── tmp/                        ← staging area for atomic writes
//! ```
//!
//! `<aa>` is the first byte of the hash in hex. Entries are written to `tmp/`
//! and renamed into place, so readers never observe a partial entry.

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use hashing::{Digest, Fingerprint};

use crate::{EntryType, StoreError};

const ACTION_CACHE_DIR: &str = "action_cache";
const TMP_DIR: &str = "tmp";

#[derive(Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] if the layout cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in [
            EntryType::File.dir_name(),
            EntryType::Directory.dir_name(),
            ACTION_CACHE_DIR,
            TMP_DIR,
        ] {
            let dir = root.join(sub);
            fs::safe_create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, area: &str, fingerprint: Fingerprint) -> PathBuf {
        self.root
            .join(area)
            .join(fingerprint.prefix_hex())
            .join(fingerprint.to_hex())
    }

    #[must_use]
    pub fn contains(&self, entry_type: EntryType, digest: Digest) -> bool {
        self.entry_path(entry_type.dir_name(), digest.hash).is_file()
    }

    /// Store `bytes`, returning their digest. Storing existing content is a
    /// no-op.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] on write failure.
    pub fn store_bytes(&self, entry_type: EntryType, bytes: &[u8]) -> Result<Digest, StoreError> {
        let digest = Digest::of_bytes(bytes);
        if self.contains(entry_type, digest) {
            return Ok(digest);
        }
        let dest = self.entry_path(entry_type.dir_name(), digest.hash);
        self.write_atomically(&dest, bytes)?;
        tracing::trace!(%digest, ?entry_type, "stored locally");
        Ok(digest)
    }

    /// Load the bytes for `digest`, or `None` if absent. An entry whose hash
    /// matches but whose size differs from `digest` also counts as absent.
    ///
    /// # Errors
    /// Returns [`StoreError::Corrupt`] if the stored bytes no longer match
    /// their digest, and [`StoreError::Io`] on read failure.
    pub fn load_bytes(
        &self,
        entry_type: EntryType,
        digest: Digest,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        if digest == hashing::EMPTY_DIGEST {
            return Ok(Some(Vec::new()));
        }
        let path = self.entry_path(entry_type.dir_name(), digest.hash);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let actual = Digest::of_bytes(&bytes);
        if actual.hash == digest.hash && actual.size_bytes != digest.size_bytes {
            tracing::debug!(%digest, %actual, "stored entry has a different size than requested");
            return Ok(None);
        }
        if actual != digest {
            return Err(StoreError::Corrupt {
                expected: digest,
                actual,
                path,
            });
        }
        Ok(Some(bytes))
    }

    /// Map an action digest to the digest of its serialized result.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] on write failure.
    pub fn record_action_result(&self, action: Digest, result: Digest) -> Result<(), StoreError> {
        let dest = self.entry_path(ACTION_CACHE_DIR, action.hash);
        let line = format!("{} {}", result.hash, result.size_bytes);
        self.write_atomically(&dest, line.as_bytes())
    }

    /// Look up a result previously recorded for `action`.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] on read failure and
    /// [`StoreError::MalformedEntry`] if the entry cannot be parsed.
    pub fn load_action_result(&self, action: Digest) -> Result<Option<Digest>, StoreError> {
        let path = self.entry_path(ACTION_CACHE_DIR, action.hash);
        let line = match std::fs::read_to_string(&path) {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let malformed = || StoreError::MalformedEntry {
            path: path.clone(),
            detail: format!("expected '<hash> <size>', got {line:?}"),
        };
        let (hash, size) = line.trim().split_once(' ').ok_or_else(malformed)?;
        let hash = Fingerprint::from_hex_string(hash).map_err(|_| malformed())?;
        let size = size.parse().map_err(|_| malformed())?;
        Ok(Some(Digest::new(hash, size)))
    }

    fn write_atomically(&self, dest: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = dest.parent().unwrap_or(&self.root);
        fs::safe_create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        let tmp_dir = self.root.join(TMP_DIR);
        let mut tmp =
            tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| StoreError::io(&tmp_dir, e))?;
        tmp.write_all(bytes)
            .and_then(|()| tmp.as_file().sync_data())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(dest)
            .map_err(|e| StoreError::io(dest, e.error))?;
        Ok(())
    }
}
