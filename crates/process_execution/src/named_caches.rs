use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use fs::RelativePath;
use serde::{Deserialize, Serialize};

use crate::ProcessError;

/// The name of a persistent cache directory: `[a-z0-9_]+`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheName(String);

impl CacheName {
    /// # Errors
    /// Returns [`ProcessError::InvalidCacheName`] unless `name` is non-empty
    /// and made of lowercase ASCII letters, digits and underscores.
    pub fn new(name: String) -> Result<Self, ProcessError> {
        if name.is_empty() {
            return Err(ProcessError::InvalidCacheName {
                name,
                reason: "must not be empty",
            });
        }
        let valid = name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !valid {
            return Err(ProcessError::InvalidCacheName {
                name,
                reason: "may only contain a-z, 0-9 and _",
            });
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CacheName {
    type Error = ProcessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CacheName> for String {
    fn from(name: CacheName) -> Self {
        name.0
    }
}

/// Where a named cache appears inside the sandbox.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheDest(RelativePath);

impl CacheDest {
    /// # Errors
    /// Returns [`ProcessError::Fs`] if `dest` is not a valid relative path or
    /// is empty.
    pub fn new(dest: impl AsRef<Path>) -> Result<Self, ProcessError> {
        let path = RelativePath::new(dest.as_ref())?;
        if path.is_empty() {
            return Err(ProcessError::Fs(fs::FsError::InvalidPath {
                path: dest.as_ref().to_owned(),
                reason: "a cache destination cannot be the sandbox root".to_owned(),
            }));
        }
        Ok(Self(path))
    }

    #[must_use]
    pub const fn path(&self) -> &RelativePath {
        &self.0
    }
}

/// The base directory holding every named cache.
#[derive(Clone, Debug)]
pub struct NamedCaches {
    base: PathBuf,
}

impl NamedCaches {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The persistent location of `name`.
    #[must_use]
    pub fn path_for(&self, name: &CacheName) -> PathBuf {
        self.base.join(name.as_str())
    }

    /// Create each cache directory and symlink it into `sandbox` at its
    /// destination.
    pub(crate) fn link_into(
        &self,
        sandbox: &Path,
        caches: &BTreeMap<CacheName, CacheDest>,
    ) -> Result<(), ProcessError> {
        for (name, dest) in caches {
            let target = self.path_for(name);
            fs::safe_create_dir_all(&target).map_err(|e| ProcessError::io(&target, e))?;
            let link = sandbox.join(dest.path());
            if let Some(parent) = link.parent() {
                fs::safe_create_dir_all(parent).map_err(|e| ProcessError::io(parent, e))?;
            }
            symlink(&target, &link)?;
            tracing::debug!(cache = %name, dest = %dest.path(), "linked named cache");
        }
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn symlink(target: &Path, link: &Path) -> Result<(), ProcessError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| ProcessError::io(link, e))
}

#[cfg(not(unix))]
pub(crate) fn symlink(target: &Path, link: &Path) -> Result<(), ProcessError> {
    std::os::windows::fs::symlink_dir(target, link).map_err(|e| ProcessError::io(link, e))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn cache_names_are_validated() {
        assert!(CacheName::new("pip_cache2".to_owned()).is_ok());
        for bad in ["", "Pip", "pip-cache", "a/b", "ümlaut"] {
            assert!(CacheName::new(bad.to_owned()).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn cache_dest_rejects_root_and_escapes() {
        assert!(CacheDest::new(".cache/pip").is_ok());
        assert!(CacheDest::new(".").is_err());
        assert!(CacheDest::new("../outside").is_err());
        assert!(CacheDest::new("/abs").is_err());
    }

    #[test]
    fn link_into_creates_cache_and_symlink() {
        let base = TempDir::new().unwrap();
        let sandbox = TempDir::new().unwrap();
        let caches = NamedCaches::new(base.path());
        let name = CacheName::new("geo".to_owned()).unwrap();
        let dest = CacheDest::new(".cache/geo").unwrap();
        caches
            .link_into(sandbox.path(), &BTreeMap::from([(name.clone(), dest)]))
            .unwrap();

        std::fs::write(sandbox.path().join(".cache/geo/marker"), b"x").unwrap();
        assert!(caches.path_for(&name).join("marker").exists());
    }

    #[test]
    fn cache_name_serializes_as_a_string() {
        let name = CacheName::new("jvm".to_owned()).unwrap();
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"jvm\"");
        assert!(serde_json::from_str::<CacheName>("\"JVM\"").is_err());
    }
}
