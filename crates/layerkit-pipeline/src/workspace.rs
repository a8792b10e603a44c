//! The build workspace: an isolated directory mirroring the project layout
//! in which both toolchain stages run.

use layerkit_config::ManifestPair;
use layerkit_core::pipeline::BuildRecipe;
use layerkit_core::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::fsutil;

/// Directory inside the workspace holding layerkit's own state.
pub const STATE_DIR: &str = ".layerkit";
const LOCK_FILE: &str = "lock";

pub struct BuildWorkspace {
    root: PathBuf,
}

impl BuildWorkspace {
    /// Open (creating if needed) the workspace at `root`. The root is
    /// canonicalized so it can be bind-mounted into builder containers.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(STATE_DIR))?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Join a recipe path onto the workspace root. Paths that are absolute,
    /// climb out with `..`, or name the root itself are refused, so nothing
    /// outside the workspace is ever written or deleted.
    pub fn path(&self, relative: &Path) -> Result<PathBuf> {
        let mut named = false;
        for component in relative.components() {
            match component {
                Component::Normal(_) => named = true,
                Component::CurDir => {}
                _ => {
                    return Err(Error::Internal(format!(
                        "'{}' escapes the build workspace",
                        relative.display()
                    )));
                }
            }
        }
        if !named {
            return Err(Error::Internal(format!(
                "'{}' does not name a path inside the build workspace",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }

    pub fn target_dir(&self, recipe: &BuildRecipe) -> Result<PathBuf> {
        self.path(&recipe.toolchain.target_dir)
    }

    /// Where the toolchain leaves the release binary.
    pub fn release_artifact_path(&self, recipe: &BuildRecipe) -> Result<PathBuf> {
        Ok(self
            .path(&recipe.toolchain.output_dir)?
            .join(&recipe.project.binary))
    }

    /// Take the exclusive workspace lock. Fails with `WorkspaceLocked` when
    /// another build holds it.
    pub fn lock(&self) -> Result<WorkspaceLock> {
        let path = self.state_dir().join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!(path = %path.display(), "Acquired workspace lock");
                Ok(WorkspaceLock { path })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(Error::WorkspaceLocked(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reset the workspace to the dependency skeleton: the manifest pair at
    /// its project-relative location plus the placeholder source. Everything
    /// else except the state directory is removed.
    pub fn prepare_skeleton(&self, recipe: &BuildRecipe, pair: &ManifestPair) -> Result<()> {
        let manifest = self.path(&recipe.manifest.manifest)?;
        let lock = self.path(&recipe.manifest.lock)?;
        let placeholder = &recipe.toolchain.placeholder;
        let placeholder_path = self.path(&placeholder.path)?;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_name() == STATE_DIR {
                continue;
            }
            fsutil::remove_path(&entry.path())?;
        }

        write_file(&manifest, pair.manifest.as_bytes())?;
        write_file(&lock, pair.lock.as_bytes())?;
        write_file(&placeholder_path, placeholder.contents.as_bytes())?;

        info!(
            workspace = %self.root.display(),
            placeholder = %placeholder.path.display(),
            "Prepared dependency skeleton"
        );
        Ok(())
    }

    /// Remove the placeholder and any source-tree directories left over
    /// from the skeleton.
    pub fn teardown_skeleton(&self, recipe: &BuildRecipe) -> Result<()> {
        let mut doomed = vec![self.path(&recipe.toolchain.placeholder.path)?];
        for dir in recipe.source_tree() {
            doomed.push(self.path(dir)?);
        }
        for path in doomed {
            fsutil::remove_path(&path)?;
        }
        Ok(())
    }

    /// Copy the real source tree (sources and templates) into the
    /// workspace. A missing source directory is a compile error.
    pub fn ingest_sources(&self, recipe: &BuildRecipe) -> Result<u64> {
        let mut files = 0;
        for dir in recipe.source_tree() {
            let into = self.path(dir)?;
            let from = recipe.resolve(dir);
            if !from.is_dir() {
                return Err(Error::Compile(format!(
                    "source directory not found: {}",
                    from.display()
                )));
            }
            files += fsutil::copy_tree(&from, &into)?.files;
        }
        debug!(files, "Ingested source tree");
        Ok(files)
    }

    /// Delete every artifact the toolchain derived from the project's own
    /// crate, so a binary linked from the placeholder can never survive
    /// into the compile stage. Dependency artifacts are left alone.
    ///
    /// Returns the removed paths relative to the workspace root.
    pub fn invalidate_stale(&self, recipe: &BuildRecipe) -> Result<Vec<PathBuf>> {
        let out = self.path(&recipe.toolchain.output_dir)?;
        let binary = &recipe.project.binary;
        let crate_name = binary.replace('-', "_");

        let mut doomed = vec![out.join(binary), out.join(format!("{binary}.d"))];
        for dir in ["deps", ".fingerprint", "incremental", "build"] {
            let dir = out.join(dir);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if is_artifact_of(&name, binary) || is_artifact_of(&name, &crate_name) {
                    doomed.push(entry.path());
                }
            }
        }

        let mut removed = Vec::new();
        for path in doomed {
            if fsutil::remove_path(&path)? {
                let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
                debug!(path = %relative.display(), "Removed stale artifact");
                removed.push(relative);
            }
        }
        removed.sort();
        Ok(removed)
    }
}

/// Exclusive hold on a workspace; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)
}

/// Whether `file_name` is `<stem>` or a toolchain artifact named
/// `<stem>-<hex hash>[.ext]`. The hash check keeps `app-utils-…` from
/// matching `app`.
fn is_artifact_of(file_name: &str, stem: &str) -> bool {
    if file_name == stem {
        return true;
    }
    let Some(rest) = file_name
        .strip_prefix(stem)
        .and_then(|rest| rest.strip_prefix('-'))
    else {
        return false;
    };
    let hash = rest.split('.').next().unwrap_or("");
    !hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit())
}
