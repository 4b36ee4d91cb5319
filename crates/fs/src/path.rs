use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::FsError;

/// A normalized path relative to some root.
///
/// `.` components are dropped and `..` components are resolved lexically.
/// A path that would climb above its root, or that is absolute, is rejected.
/// The empty path refers to the root itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(PathBuf);

impl RelativePath {
    /// Validate and normalize `path`.
    ///
    /// # Errors
    /// Returns [`FsError::InvalidPath`] for absolute paths, for paths that
    /// escape their root, and for components that are not valid UTF-8.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, FsError> {
        let path = path.as_ref();
        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    if part.to_str().is_none() {
                        return Err(FsError::InvalidPath {
                            path: path.to_owned(),
                            reason: "path must be valid UTF-8".to_owned(),
                        });
                    }
                    normalized.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(FsError::InvalidPath {
                            path: path.to_owned(),
                            reason: "path escapes its root".to_owned(),
                        });
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::InvalidPath {
                        path: path.to_owned(),
                        reason: "path must be relative".to_owned(),
                    });
                }
            }
        }
        Ok(Self(normalized))
    }

    /// The root itself.
    #[must_use]
    pub fn empty() -> Self {
        Self(PathBuf::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Append `other`, which is itself relative and so cannot escape.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        Self(self.0.join(&other.0))
    }

    /// The containing path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_empty() {
            return None;
        }
        Some(Self(
            self.0.parent().map(Path::to_path_buf).unwrap_or_default(),
        ))
    }

    /// Path components as strings. Construction guarantees they are UTF-8.
    #[must_use]
    pub fn components(&self) -> Vec<String> {
        self.0
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect()
    }
}

impl AsRef<Path> for RelativePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<String> for RelativePath {
    type Error = FsError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> Self {
        path.0.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_dots() {
        let p = RelativePath::new("./a/./b/../c").unwrap();
        assert_eq!(p.as_path(), Path::new("a/c"));
    }

    #[test]
    fn rejects_absolute() {
        let err = RelativePath::new("/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("must be relative"));
    }

    #[test]
    fn rejects_escape() {
        let err = RelativePath::new("a/../../b").unwrap_err();
        assert!(err.to_string().contains("escapes its root"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_non_utf8_component() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt as _;
        let err = RelativePath::new(OsStr::from_bytes(b"dir/caf\xe9.txt")).unwrap_err();
        assert!(err.to_string().contains("valid UTF-8"), "{err}");
    }

    #[test]
    fn dotdot_back_to_root_is_empty() {
        let p = RelativePath::new("a/..").unwrap();
        assert!(p.is_empty());
        assert_eq!(p.parent(), None);
    }

    #[test]
    fn parent_of_single_component_is_root() {
        let p = RelativePath::new("cats").unwrap();
        assert_eq!(p.parent(), Some(RelativePath::empty()));
        let nested = RelativePath::new("cats/roland.ext").unwrap();
        assert_eq!(nested.parent(), Some(p));
    }

    #[test]
    fn components_split_on_separator() {
        let p = RelativePath::new("birds/falcons").unwrap();
        assert_eq!(p.components(), vec!["birds", "falcons"]);
    }

    mod proptests {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn normalized_paths_never_contain_dot_components(
                parts in proptest::collection::vec(prop_oneof![
                    Just(".".to_owned()),
                    Just("..".to_owned()),
                    "[a-z]{1,6}",
                ], 0..8)
            ) {
                let joined = parts.join("/");
                if let Ok(p) = RelativePath::new(&joined) {
                    for c in p.components() {
                        prop_assert!(c != "." && c != "..");
                    }
                    // Normalizing twice is a no-op.
                    prop_assert_eq!(RelativePath::new(p.as_path()).unwrap(), p);
                }
            }
        }
    }
}
