//! Build orchestrator - drives the three build stages through the pipeline
//! state machine.

use futures::StreamExt;
use layerkit_config::{ManifestPair, VariableContext, load_manifest_pair};
use layerkit_core::ResourceId;
use layerkit_core::artifact::{DependencyLayer, LayerKey, LayerStore, ReleaseBinary, RuntimeImage};
use layerkit_core::executor::{Executor, JobSpec, JobStatus, LogLine};
use layerkit_core::pipeline::{
    BuildRecipe, PipelineMachine, PipelineState, StageKind, ToolchainSpec,
};
use layerkit_core::{ContentDigest, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::assemble::{IMAGE_DIR, ImageAssembler};
use crate::fingerprint::{self, SourceIndex};
use crate::fsutil;
use crate::workspace::BuildWorkspace;

/// Directory under the output dir that receives the release binary.
pub const RELEASE_DIR: &str = "release";

/// Extra time given to an executor to report its own timeout before the
/// orchestrator cancels the job.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);
/// How long to keep draining a job's logs after it has finished.
const LOG_DRAIN: Duration = Duration::from_secs(5);

/// Event emitted during a build.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { stage: StageKind },
    StageLog { stage: StageKind, line: LogLine },
    CacheHit { key: LayerKey },
    CacheMiss { key: LayerKey },
    StaleArtifactRemoved { path: PathBuf },
    SourcesTouched { count: usize },
    StageCompleted { stage: StageKind, success: bool },
    PipelineCompleted { success: bool, state: PipelineState },
}

/// Where a build runs and what it produces.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Build workspace; reused between builds of the same project.
    pub workspace: PathBuf,
    /// Receives `release/<binary>` and `image/`.
    pub out_dir: PathBuf,
    /// Stop once the pipeline reaches this state.
    pub stop_after: Option<PipelineState>,
}

impl BuildOptions {
    /// Workspace and output under `<project>/.layerkit/`.
    pub fn for_recipe(recipe: &BuildRecipe) -> Self {
        let base = recipe.project.dir.join(".layerkit");
        Self {
            workspace: base.join("workspace"),
            out_dir: base.join("out"),
            stop_after: None,
        }
    }

    pub fn stop_after(mut self, state: PipelineState) -> Self {
        self.stop_after = Some(state);
        self
    }
}

/// Outcome of a build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub run_id: ResourceId,
    pub state: PipelineState,
    pub manifest_digest: Option<ContentDigest>,
    pub layer: Option<DependencyLayer>,
    pub cache_hit: bool,
    pub binary: Option<ReleaseBinary>,
    pub image: Option<RuntimeImage>,
    /// Stale artifacts removed before compiling: toolchain outputs relative
    /// to the workspace, then previous pipeline outputs.
    pub removed: Vec<PathBuf>,
    /// Source files whose modification time was bumped.
    pub touched: Vec<String>,
}

impl BuildReport {
    fn new(run_id: ResourceId) -> Self {
        Self {
            run_id,
            state: PipelineState::Init,
            manifest_digest: None,
            layer: None,
            cache_hit: false,
            binary: None,
            image: None,
            removed: Vec::new(),
            touched: Vec::new(),
        }
    }
}

/// Orchestrates the layered build.
#[derive(Clone)]
pub struct BuildOrchestrator {
    executor: Arc<dyn Executor>,
    store: Arc<dyn LayerStore>,
}

impl BuildOrchestrator {
    pub fn new(executor: Arc<dyn Executor>, store: Arc<dyn LayerStore>) -> Self {
        Self { executor, store }
    }

    /// Execute a build, returning a channel of events and a handle to get
    /// the final report.
    pub fn execute(
        &self,
        recipe: BuildRecipe,
        options: BuildOptions,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<Result<BuildReport>>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let orchestrator = self.clone();

        let handle =
            tokio::spawn(async move { orchestrator.run(&recipe, &options, &tx).await });

        (rx, handle)
    }

    /// Run a build to completion, sending events to `tx`.
    pub async fn run(
        &self,
        recipe: &BuildRecipe,
        options: &BuildOptions,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<BuildReport> {
        let run_id = ResourceId::new();
        let workspace = BuildWorkspace::open(&options.workspace)?;
        let _lock = workspace.lock()?;

        info!(
            run_id = %run_id.short(),
            project = %recipe.project.name,
            executor = self.executor.name(),
            workspace = %workspace.root().display(),
            "Starting build"
        );

        let mut machine = PipelineMachine::new();
        let mut report = BuildReport::new(run_id);
        let outcome = self
            .run_stages(recipe, options, &workspace, &mut machine, &mut report, tx)
            .await;

        report.state = machine.state();
        let _ = tx
            .send(PipelineEvent::PipelineCompleted {
                success: outcome.is_ok(),
                state: report.state,
            })
            .await;

        outcome?;
        info!(run_id = %run_id.short(), state = %report.state, "Build finished");
        Ok(report)
    }

    async fn run_stages(
        &self,
        recipe: &BuildRecipe,
        options: &BuildOptions,
        workspace: &BuildWorkspace,
        machine: &mut PipelineMachine,
        report: &mut BuildReport,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<()> {
        for stage in StageKind::ALL {
            if options.stop_after == Some(machine.state()) {
                info!(state = %machine.state(), "Stopping early");
                break;
            }

            let _ = tx.send(PipelineEvent::StageStarted { stage }).await;

            let outcome = match stage {
                StageKind::Dependencies => {
                    self.build_dependencies(recipe, workspace, report, tx).await
                }
                StageKind::Compile => self.compile(recipe, options, workspace, report, tx).await,
                StageKind::Assemble => self.assemble(recipe, options, report),
            };

            match outcome {
                Ok(()) => {
                    machine.advance(stage.completes())?;
                    info!(stage = %stage, "Stage completed successfully");
                    let _ = tx
                        .send(PipelineEvent::StageCompleted {
                            stage,
                            success: true,
                        })
                        .await;
                }
                Err(e) => {
                    error!(stage = %stage, error = %e, "Stage failed");
                    machine.fail(stage)?;
                    let _ = tx
                        .send(PipelineEvent::StageCompleted {
                            stage,
                            success: false,
                        })
                        .await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stage 1: validate the manifest pair, then restore the dependency
    /// layer from the store or build it against the placeholder source.
    async fn build_dependencies(
        &self,
        recipe: &BuildRecipe,
        workspace: &BuildWorkspace,
        report: &mut BuildReport,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<()> {
        let pair = load_manifest_pair(
            &recipe.resolve(&recipe.manifest.manifest),
            &recipe.resolve(&recipe.manifest.lock),
        )?;
        let key = layer_key(recipe, &pair);
        info!(
            package = %pair.package,
            dependencies = pair.dependencies.len(),
            key = %key.short(),
            "Validated manifest pair"
        );

        workspace.prepare_skeleton(recipe, &pair)?;
        let placeholder = recipe.toolchain.placeholder.path.as_path();
        SourceIndex::scan(workspace.root(), &[placeholder])?.save(workspace)?;

        let target = workspace.target_dir(recipe)?;
        let layer = match self.store.lookup(&key)? {
            Some(layer) => {
                info!(key = %key.short(), "Dependency layer cache hit");
                let _ = tx.send(PipelineEvent::CacheHit { key: key.clone() }).await;
                self.store.restore(&layer, &pair.digest, &target)?;
                report.cache_hit = true;
                layer
            }
            None => {
                info!(key = %key.short(), "Dependency layer cache miss, building");
                let _ = tx.send(PipelineEvent::CacheMiss { key: key.clone() }).await;
                self.run_job(
                    StageKind::Dependencies,
                    &recipe.toolchain.dependency_build,
                    recipe,
                    workspace,
                    tx,
                )
                .await
                .map_err(|e| job_error(e, Error::Manifest, "dependency build failed"))?;

                if !target.is_dir() {
                    return Err(Error::Manifest(format!(
                        "dependency build produced no {}",
                        recipe.toolchain.target_dir.display()
                    )));
                }
                self.store.store(&key, &pair.digest, &target)?
            }
        };

        report.manifest_digest = Some(pair.digest);
        report.layer = Some(layer);
        Ok(())
    }

    /// Stage 2: swap the placeholder for the real sources, drop every
    /// artifact derived from the placeholder and compile.
    async fn compile(
        &self,
        recipe: &BuildRecipe,
        options: &BuildOptions,
        workspace: &BuildWorkspace,
        report: &mut BuildReport,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<()> {
        let compiled_from = SourceIndex::load(workspace)?;
        workspace.teardown_skeleton(recipe)?;
        workspace.ingest_sources(recipe)?;

        let mut removed = workspace.invalidate_stale(recipe)?;
        let promoted = promoted_binary_path(recipe, &options.out_dir);
        for output in [promoted.clone(), options.out_dir.join(IMAGE_DIR)] {
            if fsutil::remove_path(&output)? {
                removed.push(output);
            }
        }
        for path in &removed {
            let _ = tx
                .send(PipelineEvent::StaleArtifactRemoved { path: path.clone() })
                .await;
        }
        info!(count = removed.len(), "Removed stale artifacts");

        let sources = SourceIndex::scan(workspace.root(), &recipe.source_tree())?;
        let changed = sources.changed_since(&compiled_from);
        fingerprint::touch(workspace.root(), &changed, SystemTime::now())?;
        debug!(
            changed = changed.len(),
            removed = sources.removed_since(&compiled_from).len(),
            "Touched changed sources"
        );
        let _ = tx
            .send(PipelineEvent::SourcesTouched {
                count: changed.len(),
            })
            .await;

        report.removed = removed;
        report.touched = changed;

        self.run_job(StageKind::Compile, &recipe.toolchain.build, recipe, workspace, tx)
            .await
            .map_err(|e| job_error(e, Error::Compile, "build failed"))?;
        sources.save(workspace)?;

        let artifact = workspace.release_artifact_path(recipe)?;
        if !artifact.is_file() {
            return Err(Error::Compile(format!(
                "build succeeded but produced no binary at {}",
                artifact.display()
            )));
        }

        let size = fsutil::copy_atomic(&artifact, &promoted)?;
        let binary = ReleaseBinary {
            name: recipe.project.binary.clone(),
            digest: ContentDigest::of_file(&promoted)?,
            path: promoted,
            size,
        };
        info!(
            binary = %binary.path.display(),
            digest = %binary.digest.short(),
            size = binary.size,
            "Promoted release binary"
        );
        report.binary = Some(binary);
        Ok(())
    }

    /// Stage 3: assemble the runtime image around the promoted binary.
    fn assemble(
        &self,
        recipe: &BuildRecipe,
        options: &BuildOptions,
        report: &mut BuildReport,
    ) -> Result<()> {
        let binary = report
            .binary
            .as_ref()
            .ok_or_else(|| Error::Assembly("no release binary to assemble".to_string()))?;
        let image = ImageAssembler::new(recipe).assemble(binary, &options.out_dir)?;
        report.image = Some(image);
        Ok(())
    }

    /// Run one toolchain command in the workspace and forward its logs.
    async fn run_job(
        &self,
        stage: StageKind,
        command: &[String],
        recipe: &BuildRecipe,
        workspace: &BuildWorkspace,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<()> {
        let mut var_ctx = job_variables(recipe, stage);
        var_ctx.workspace = workspace.root().display().to_string();

        let toolchain = &recipe.toolchain;
        let spec = JobSpec {
            id: ResourceId::new(),
            image: toolchain.image.clone(),
            command: var_ctx.interpolate_vec(command),
            workspace: workspace.root().to_path_buf(),
            env: var_ctx.interpolate_map(&toolchain.env),
            timeout: toolchain.timeout,
            volumes: toolchain.volumes.clone(),
        };

        if !self.executor.can_execute(&spec).await {
            return Err(Error::ExecutionFailed(format!(
                "executor '{}' cannot run this job",
                self.executor.name()
            )));
        }

        let command_line = spec.command.join(" ");
        let timeout = spec.timeout;
        info!(stage = %stage, command = %command_line, "Spawning job");

        let handle = self.executor.spawn(spec).await?;
        let log_stream = self.executor.logs(&handle).await?;

        let tx_clone = tx.clone();
        let mut log_handle = tokio::spawn(async move {
            let mut stream = log_stream;
            while let Some(line) = stream.next().await {
                let _ = tx_clone.send(PipelineEvent::StageLog { stage, line }).await;
            }
        });

        let waited = match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit + TIMEOUT_GRACE, self.executor.wait(&handle)).await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(stage = %stage, "Job exceeded its timeout, cancelling");
                        if let Err(e) = self.executor.cancel(&handle).await {
                            warn!(error = %e, "Failed to cancel job");
                        }
                        Err(Error::Timeout(format!(
                            "`{}` exceeded {}s",
                            command_line,
                            limit.as_secs()
                        )))
                    }
                }
            }
            None => self.executor.wait(&handle).await,
        };

        if tokio::time::timeout(LOG_DRAIN, &mut log_handle).await.is_err() {
            log_handle.abort();
        }
        if let Err(e) = self.executor.cleanup(&handle).await {
            warn!(error = %e, "Failed to clean up job");
        }

        match waited?.status {
            JobStatus::Succeeded { .. } => Ok(()),
            JobStatus::Failed { message, .. } => Err(Error::ExecutionFailed(format!(
                "`{}` failed: {}",
                command_line, message
            ))),
            JobStatus::Cancelled { .. } => Err(Error::Cancelled),
            _ => Err(Error::ExecutionFailed(
                "job ended in unexpected state".to_string(),
            )),
        }
    }
}

/// Attribute a job failure to the stage that ran it. Cancellation and
/// infrastructure errors pass through unchanged.
fn job_error(e: Error, wrap: fn(String) -> Error, context: &str) -> Error {
    match e {
        Error::ExecutionFailed(msg) | Error::Timeout(msg) => wrap(format!("{context}: {msg}")),
        other => other,
    }
}

/// Variables visible to the toolchain commands of `stage`. The workspace is
/// left unset.
fn job_variables(recipe: &BuildRecipe, stage: StageKind) -> VariableContext {
    let mut ctx = VariableContext::for_project(&recipe.project.name, &recipe.project.binary);
    ctx.populate_env();
    ctx.stage.name = stage.to_string();
    ctx
}

/// The toolchain as the dependency stage runs it: `dependency_build` and
/// `env` interpolated. `${workspace}` stays as written, so the result does
/// not depend on where the workspace lives.
pub fn resolved_toolchain(recipe: &BuildRecipe) -> ToolchainSpec {
    let vars = job_variables(recipe, StageKind::Dependencies);
    let mut toolchain = recipe.toolchain.clone();
    toolchain.dependency_build = vars.interpolate_vec(&toolchain.dependency_build);
    toolchain.env = vars.interpolate_map(&toolchain.env).into_iter().collect();
    toolchain
}

/// Cache key of the dependency layer for `pair` built under `recipe`.
pub fn layer_key(recipe: &BuildRecipe, pair: &ManifestPair) -> LayerKey {
    LayerKey::derive(&pair.digest, &resolved_toolchain(recipe).fingerprint())
}

/// Path of the promoted release binary for a recipe.
pub fn promoted_binary_path(recipe: &BuildRecipe, out_dir: &Path) -> PathBuf {
    out_dir.join(RELEASE_DIR).join(&recipe.project.binary)
}
