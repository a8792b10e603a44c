//! Content-based change detection for the compile stage.
//!
//! The toolchain decides what to recompile from file timestamps. Copying
//! sources into a workspace restored from a dependency layer can leave a
//! changed file with an older timestamp than the artifact built from the
//! placeholder, so the toolchain would skip it. [`SourceIndex`] records the
//! digest of every file the workspace was last compiled from; files whose
//! content differs get their modification time bumped with [`touch`].

use layerkit_core::ContentDigest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use crate::fsutil;
use crate::workspace::BuildWorkspace;

const INDEX_FILE: &str = "sources.json";

/// Digest of every tracked file, keyed by workspace-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIndex {
    files: BTreeMap<String, ContentDigest>,
}

impl SourceIndex {
    /// Index every file under the given workspace-relative paths. Paths
    /// that do not exist are skipped; a path naming a file indexes that file.
    pub fn scan(root: &Path, paths: &[&Path]) -> io::Result<Self> {
        let mut files = BTreeMap::new();
        for path in paths {
            let full = root.join(path);
            if full.is_file() {
                files.insert(fsutil::slash_path(path), ContentDigest::of_file(&full)?);
            } else if full.is_dir() {
                for relative in fsutil::relative_files(&full)? {
                    let key = fsutil::slash_path(&path.join(&relative));
                    files.insert(key, ContentDigest::of_file(&full.join(&relative))?);
                }
            }
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&ContentDigest> {
        self.files.get(path)
    }

    /// Files that are new or whose content differs from `previous`.
    pub fn changed_since(&self, previous: &SourceIndex) -> Vec<String> {
        self.files
            .iter()
            .filter(|(path, digest)| previous.files.get(*path) != Some(*digest))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Files present in `previous` but gone now.
    pub fn removed_since(&self, previous: &SourceIndex) -> Vec<String> {
        previous
            .files
            .keys()
            .filter(|path| !self.files.contains_key(*path))
            .cloned()
            .collect()
    }

    /// Load the index saved in the workspace; an absent index is empty.
    pub fn load(workspace: &BuildWorkspace) -> io::Result<Self> {
        let path = workspace.state_dir().join(INDEX_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, workspace: &BuildWorkspace) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(workspace.state_dir().join(INDEX_FILE), bytes)
    }
}

/// Set the modification time of each workspace-relative path to `now`.
/// Files are opened read-only; the owner may set times on a read-only
/// descriptor, so read-only sources can be touched too.
pub fn touch(root: &Path, paths: &[String], now: SystemTime) -> io::Result<()> {
    for path in paths {
        let file = fs::File::open(root.join(path))?;
        file.set_modified(now)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn write(root: &Path, path: &str, contents: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_scan_indexes_dirs_and_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "src/ui/view.rs", "pub fn view() {}");
        write(dir.path(), "templates/index.html", "<html/>");

        let index = SourceIndex::scan(
            dir.path(),
            &[Path::new("src"), Path::new("templates/index.html"), Path::new("absent")],
        )
        .unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.get("src/ui/view.rs").is_some());
        assert_eq!(
            index.get("src/main.rs"),
            Some(&ContentDigest::of_bytes(b"fn main() {}"))
        );
    }

    #[test]
    fn test_changed_since_compares_content_not_time() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "src/a.rs", "a");
        let before = SourceIndex::scan(dir.path(), &[Path::new("src")]).unwrap();

        // Rewrite with identical bytes, change one file, add another.
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "src/a.rs", "a2");
        write(dir.path(), "src/b.rs", "b");
        let after = SourceIndex::scan(dir.path(), &[Path::new("src")]).unwrap();

        assert_eq!(after.changed_since(&before), vec!["src/a.rs", "src/b.rs"]);
        assert!(after.removed_since(&before).is_empty());
        assert_eq!(before.removed_since(&after), vec!["src/b.rs"]);
        assert!(after.changed_since(&after).is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ws = BuildWorkspace::open(dir.path()).unwrap();
        assert!(SourceIndex::load(&ws).unwrap().is_empty());

        write(ws.root(), "src/main.rs", "fn main() {}");
        let index = SourceIndex::scan(ws.root(), &[Path::new("src")]).unwrap();
        index.save(&ws).unwrap();

        assert_eq!(SourceIndex::load(&ws).unwrap(), index);
    }

    #[test]
    fn test_touch_sets_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);

        touch(dir.path(), &["src/main.rs".to_string()], old).unwrap();
        touch(dir.path(), &["src/main.rs".to_string()], now).unwrap();

        let modified = fs::metadata(PathBuf::from(dir.path()).join("src/main.rs"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(modified, now);
        assert_eq!(
            fs::read_to_string(dir.path().join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_touch_read_only_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        let path = dir.path().join("src/main.rs");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(3_000_000);

        touch(dir.path(), &["src/main.rs".to_string()], now).unwrap();

        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.modified().unwrap(), now);
        assert_eq!(metadata.permissions().mode() & 0o777, 0o444);
    }
}
