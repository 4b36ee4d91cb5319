//! Assemble a Merkle tree of [`Directory`] values from flat path listings.

use std::collections::BTreeMap;

use hashing::Digest;

use crate::directory::validate_name;
use crate::{Directory, DirectoryNode, FileNode, FsError, RelativePath};

#[derive(Default)]
struct Node {
    files: BTreeMap<String, (Digest, bool)>,
    dirs: BTreeMap<String, Node>,
}

/// The output of [`DirectoryTreeBuilder::build`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuiltTree {
    /// Digest of the root directory.
    pub root: Digest,
    /// Every directory in the tree (root last), paired with its digest.
    pub directories: Vec<(Digest, Directory)>,
}

/// Collects files and directories by relative path.
#[derive(Default)]
pub struct DirectoryTreeBuilder {
    root: Node,
}

impl DirectoryTreeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file.
    ///
    /// # Errors
    /// Returns [`FsError::Collision`] if `path` or one of its ancestors was
    /// already recorded with the other kind, and [`FsError::InvalidPath`] for
    /// the empty path.
    pub fn add_file(
        &mut self,
        path: &RelativePath,
        digest: Digest,
        is_executable: bool,
    ) -> Result<(), FsError> {
        let mut components = path.components();
        let Some(name) = components.pop() else {
            return Err(FsError::InvalidPath {
                path: path.as_path().to_owned(),
                reason: "a file cannot be the root".to_owned(),
            });
        };
        validate_name(&name)?;
        let parent = self.descend(path, &components)?;
        if parent.dirs.contains_key(&name) {
            return Err(FsError::Collision {
                path: path.as_path().to_owned(),
            });
        }
        parent.files.insert(name, (digest, is_executable));
        Ok(())
    }

    /// Record a directory (and its ancestors). Recording the root is a no-op.
    ///
    /// # Errors
    /// Returns [`FsError::Collision`] if a component was recorded as a file.
    pub fn add_directory(&mut self, path: &RelativePath) -> Result<(), FsError> {
        let components = path.components();
        self.descend(path, &components).map(|_| ())
    }

    fn descend(&mut self, path: &RelativePath, components: &[String]) -> Result<&mut Node, FsError> {
        let mut node = &mut self.root;
        for component in components {
            validate_name(component)?;
            if node.files.contains_key(component) {
                return Err(FsError::Collision {
                    path: path.as_path().to_owned(),
                });
            }
            node = node.dirs.entry(component.clone()).or_default();
        }
        Ok(node)
    }

    /// Compute digests bottom-up.
    ///
    /// # Errors
    /// Propagates name validation failures from [`Directory::new`].
    pub fn build(self) -> Result<BuiltTree, FsError> {
        let mut directories = Vec::new();
        let root = build_node(self.root, &mut directories)?;
        Ok(BuiltTree { root, directories })
    }
}

fn build_node(node: Node, out: &mut Vec<(Digest, Directory)>) -> Result<Digest, FsError> {
    let files = node
        .files
        .into_iter()
        .map(|(name, (digest, is_executable))| FileNode {
            name,
            digest,
            is_executable,
        })
        .collect();
    let mut directories = Vec::with_capacity(node.dirs.len());
    for (name, child) in node.dirs {
        let digest = build_node(child, out)?;
        directories.push(DirectoryNode { name, digest });
    }
    let dir = Directory::new(files, directories)?;
    let digest = dir.digest();
    out.push((digest, dir));
    Ok(digest)
}
