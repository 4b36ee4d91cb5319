use bytes::Bytes;
use fs::{Directory, DirectoryNode, FileNode};
use hashing::Digest;

/// A named blob with a known digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestData {
    string: String,
}

impl TestData {
    #[must_use]
    pub fn empty() -> Self {
        Self::new("")
    }

    #[must_use]
    pub fn roland() -> Self {
        Self::new("European Burmese")
    }

    #[must_use]
    pub fn catnip() -> Self {
        Self::new("catnip")
    }

    #[must_use]
    pub fn robin() -> Self {
        Self::new("Pug")
    }

    #[must_use]
    pub fn new(s: &str) -> Self {
        Self {
            string: s.to_owned(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.string.as_bytes())
    }

    #[must_use]
    pub fn string(&self) -> String {
        self.string.clone()
    }

    #[must_use]
    pub fn digest(&self) -> Digest {
        Digest::of_bytes(self.string.as_bytes())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.string.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.string.is_empty()
    }
}

/// A fixed directory tree with a known digest.
///
/// The trees mirror the outputs the process runner tests produce:
///
/// ```text
/// containing_roland      roland.ext
/// containing_falcons_dir falcons/
/// nested                 cats/roland.ext
/// recursive              cats/roland.ext, treats.ext
/// nested_dir_and_file    birds/falcons/, cats/roland.ext
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestDirectory {
    directory: Directory,
}

fn file(name: &str, data: &TestData) -> FileNode {
    FileNode {
        name: name.to_owned(),
        digest: data.digest(),
        is_executable: false,
    }
}

fn dir(name: &str, child: &TestDirectory) -> DirectoryNode {
    DirectoryNode {
        name: name.to_owned(),
        digest: child.digest(),
    }
}

impl TestDirectory {
    fn from_parts(files: Vec<FileNode>, directories: Vec<DirectoryNode>) -> Self {
        // Fixture names are static and valid; sorting happens here too.
        let mut files = files;
        let mut directories = directories;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        directories.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            directory: Directory { files, directories },
        }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::from_parts(vec![], vec![])
    }

    #[must_use]
    pub fn containing_roland() -> Self {
        Self::from_parts(vec![file("roland.ext", &TestData::roland())], vec![])
    }

    #[must_use]
    pub fn containing_falcons_dir() -> Self {
        Self::from_parts(vec![], vec![dir("falcons", &Self::empty())])
    }

    #[must_use]
    pub fn nested() -> Self {
        Self::from_parts(vec![], vec![dir("cats", &Self::containing_roland())])
    }

    #[must_use]
    pub fn recursive() -> Self {
        Self::from_parts(
            vec![file("treats.ext", &TestData::catnip())],
            vec![dir("cats", &Self::containing_roland())],
        )
    }

    #[must_use]
    pub fn nested_dir_and_file() -> Self {
        Self::from_parts(
            vec![],
            vec![
                dir("birds", &Self::containing_falcons_dir()),
                dir("cats", &Self::containing_roland()),
            ],
        )
    }

    #[must_use]
    pub fn directory(&self) -> Directory {
        self.directory.clone()
    }

    #[must_use]
    pub fn bytes(&self) -> Bytes {
        Bytes::from(self.directory.to_bytes())
    }

    #[must_use]
    pub fn digest(&self) -> Digest {
        self.directory.digest()
    }
}
