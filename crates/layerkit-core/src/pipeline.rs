//! Build recipe types and the pipeline state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::VolumeMount;
use crate::{ContentDigest, Error, Result};

/// Everything needed to build and package one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecipe {
    pub project: ProjectSpec,
    pub manifest: ManifestSpec,
    /// Application source directory, relative to the project directory.
    pub source_dir: PathBuf,
    /// Template directory compiled into the binary, if any.
    pub templates_dir: Option<PathBuf>,
    /// Static assets shipped next to the binary, if any.
    pub assets_dir: Option<PathBuf>,
    pub toolchain: ToolchainSpec,
    pub runtime: RuntimeSpec,
}

impl BuildRecipe {
    /// Resolve a project-relative path.
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.project.dir.join(relative)
    }

    /// Source-tree directories that get copied into the workspace, as
    /// project-relative paths.
    pub fn source_tree(&self) -> Vec<&Path> {
        let mut dirs = vec![self.source_dir.as_path()];
        if let Some(templates) = &self.templates_dir {
            dirs.push(templates.as_path());
        }
        dirs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    /// Project name (e.g., "mc-frontend").
    pub name: String,
    /// Name of the release binary. Defaults to the project name.
    pub binary: String,
    /// Directory the recipe was loaded from; relative paths resolve here.
    pub dir: PathBuf,
}

/// Locations of the manifest pair, relative to the project directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSpec {
    pub manifest: PathBuf,
    pub lock: PathBuf,
}

/// How the toolchain is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainSpec {
    /// Builder image for container executors.
    pub image: Option<String>,
    /// Command compiling dependencies against the skeleton.
    pub dependency_build: Vec<String>,
    /// Command compiling the real sources.
    pub build: Vec<String>,
    /// Directory, relative to the workspace, holding build output. This is
    /// the tree snapshotted as the dependency layer.
    pub target_dir: PathBuf,
    /// Directory, relative to the workspace, where the release binary lands.
    pub output_dir: PathBuf,
    /// Placeholder source written into the skeleton.
    pub placeholder: PlaceholderSource,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub volumes: Vec<VolumeMount>,
}

impl ToolchainSpec {
    /// Fingerprint of everything that affects the dependency layer other
    /// than the manifest pair itself.
    pub fn fingerprint(&self) -> ContentDigest {
        let mut builder = ContentDigest::builder()
            .part("image", self.image.as_deref().unwrap_or("").as_bytes())
            .part("target", self.target_dir.to_string_lossy().as_bytes())
            .part("placeholder-path", self.placeholder.path.to_string_lossy().as_bytes())
            .part("placeholder", self.placeholder.contents.as_bytes());
        for arg in &self.dependency_build {
            builder = builder.part("arg", arg.as_bytes());
        }
        for (key, value) in &self.env {
            builder = builder.part("env-key", key.as_bytes());
            builder = builder.part("env-value", value.as_bytes());
        }
        builder.finish()
    }
}

/// The throwaway source the dependency pre-build compiles against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderSource {
    /// Path relative to the workspace, e.g. `src/main.rs`.
    pub path: PathBuf,
    pub contents: String,
}

impl Default for PlaceholderSource {
    fn default() -> Self {
        Self {
            path: PathBuf::from("src/main.rs"),
            contents: "fn main() {}\n".to_string(),
        }
    }
}

/// Shape of the runtime image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Minimal base image, recorded in the image config.
    pub base: String,
    /// Absolute working directory inside the image.
    pub working_dir: String,
    pub trust_store: TrustStoreSpec,
}

/// Where the CA bundle comes from and where it goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustStoreSpec {
    /// Host path of the CA bundle.
    pub source: PathBuf,
    /// Absolute path inside the image.
    pub path: String,
}

/// The three stages of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    Dependencies,
    Compile,
    Assemble,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Dependencies, StageKind::Compile, StageKind::Assemble];

    /// State the pipeline reaches when this stage succeeds.
    pub fn completes(self) -> PipelineState {
        match self {
            StageKind::Dependencies => PipelineState::DependenciesBuilt,
            StageKind::Compile => PipelineState::SourceCompiled,
            StageKind::Assemble => PipelineState::ImageAssembled,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageKind::Dependencies => "dependencies",
            StageKind::Compile => "compile",
            StageKind::Assemble => "assemble",
        })
    }
}

/// Pipeline-level state. Strictly forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Init,
    DependenciesBuilt,
    SourceCompiled,
    ImageAssembled,
    Failed { stage: StageKind },
}

impl PipelineState {
    /// The only state this one may advance to.
    pub fn successor(self) -> Option<PipelineState> {
        match self {
            PipelineState::Init => Some(PipelineState::DependenciesBuilt),
            PipelineState::DependenciesBuilt => Some(PipelineState::SourceCompiled),
            PipelineState::SourceCompiled => Some(PipelineState::ImageAssembled),
            PipelineState::ImageAssembled | PipelineState::Failed { .. } => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.successor().is_none()
    }

    /// Stage that runs from this state.
    pub fn next_stage(self) -> Option<StageKind> {
        match self {
            PipelineState::Init => Some(StageKind::Dependencies),
            PipelineState::DependenciesBuilt => Some(StageKind::Compile),
            PipelineState::SourceCompiled => Some(StageKind::Assemble),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Init => f.write_str("init"),
            PipelineState::DependenciesBuilt => f.write_str("dependencies-built"),
            PipelineState::SourceCompiled => f.write_str("source-compiled"),
            PipelineState::ImageAssembled => f.write_str("image-assembled"),
            PipelineState::Failed { stage } => write!(f, "failed({})", stage),
        }
    }
}

/// Tracks a run's state and validates every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMachine {
    state: PipelineState,
    history: Vec<(PipelineState, DateTime<Utc>)>,
}

impl PipelineMachine {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Init,
            history: vec![(PipelineState::Init, Utc::now())],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[(PipelineState, DateTime<Utc>)] {
        &self.history
    }

    /// Move to `to`, which must be the current state's successor.
    pub fn advance(&mut self, to: PipelineState) -> Result<()> {
        if self.state.successor() != Some(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push((to, Utc::now()));
        Ok(())
    }

    /// Record that `stage` failed. Only valid while that stage is the next
    /// one to run.
    pub fn fail(&mut self, stage: StageKind) -> Result<()> {
        let to = PipelineState::Failed { stage };
        if self.state.next_stage() != Some(stage) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.history.push((to, Utc::now()));
        Ok(())
    }
}

impl Default for PipelineMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_walks_forward() {
        let mut machine = PipelineMachine::new();
        for stage in StageKind::ALL {
            assert_eq!(machine.state().next_stage(), Some(stage));
            machine.advance(stage.completes()).unwrap();
        }
        assert_eq!(machine.state(), PipelineState::ImageAssembled);
        assert!(machine.state().is_terminal());
        assert_eq!(machine.history().len(), 4);
    }

    #[test]
    fn test_machine_rejects_skipping_a_stage() {
        let mut machine = PipelineMachine::new();
        let err = machine.advance(PipelineState::SourceCompiled).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: PipelineState::Init,
                to: PipelineState::SourceCompiled
            }
        ));
        assert_eq!(machine.state(), PipelineState::Init);
    }

    #[test]
    fn test_machine_rejects_going_backwards() {
        let mut machine = PipelineMachine::new();
        machine.advance(PipelineState::DependenciesBuilt).unwrap();
        assert!(machine.advance(PipelineState::DependenciesBuilt).is_err());
        assert!(machine.advance(PipelineState::Init).is_err());
    }

    #[test]
    fn test_failure_is_terminal() {
        let mut machine = PipelineMachine::new();
        machine.advance(PipelineState::DependenciesBuilt).unwrap();
        machine.fail(StageKind::Compile).unwrap();
        assert_eq!(
            machine.state(),
            PipelineState::Failed {
                stage: StageKind::Compile
            }
        );
        assert!(machine.advance(PipelineState::SourceCompiled).is_err());
        assert!(machine.fail(StageKind::Assemble).is_err());
    }

    #[test]
    fn test_fail_must_name_the_running_stage() {
        let mut machine = PipelineMachine::new();
        assert!(machine.fail(StageKind::Assemble).is_err());
        assert_eq!(machine.state(), PipelineState::Init);
    }

    fn toolchain() -> ToolchainSpec {
        ToolchainSpec {
            image: Some("rust:1.85".to_string()),
            dependency_build: vec!["cargo".into(), "build".into(), "--release".into()],
            build: vec!["cargo".into(), "build".into(), "--release".into()],
            target_dir: PathBuf::from("target"),
            output_dir: PathBuf::from("target/release"),
            placeholder: PlaceholderSource::default(),
            env: BTreeMap::new(),
            timeout: None,
            volumes: vec![],
        }
    }

    #[test]
    fn test_fingerprint_ignores_source_build_command() {
        let base = toolchain();
        let mut changed = toolchain();
        changed.build.push("--verbose".into());
        assert_eq!(base.fingerprint(), changed.fingerprint());

        changed.dependency_build.push("--verbose".into());
        assert_ne!(base.fingerprint(), changed.fingerprint());
    }
}
