//! Filesystem vocabulary shared by the engine crates.
//!
//! # Crate layout
//!
//! - [`RelativePath`]: a validated path that cannot escape its root.
//! - [`directory`]: the [`Directory`] tree model and its canonical encoding.
//! - [`tree`]: [`DirectoryTreeBuilder`], which turns a flat list of captured
//!   files into a tree of directories with digests.
//! - [`scan`]: walking and globbing real directories on disk.

pub mod directory;
pub mod scan;
pub mod tree;

mod error;
mod path;

pub use directory::{Directory, DirectoryNode, FileNode};
pub use error::FsError;
pub use path::RelativePath;
pub use scan::{PathStat, expand_globs, safe_create_dir_all, scan};
pub use tree::{BuiltTree, DirectoryTreeBuilder};

/// Digest of the empty directory (identical to [`hashing::EMPTY_DIGEST`]).
pub const EMPTY_DIRECTORY_DIGEST: hashing::Digest = hashing::EMPTY_DIGEST;
